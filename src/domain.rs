//! Memory registration domain.
//!
//! Registrations are per-domain and shared by every endpoint opened on
//! it. The registry implementation (cache internals included) is an
//! external collaborator; the endpoint only consumes this interface.
//! All registry calls are serialized by the domain's own lock, which is
//! ordered strictly below any endpoint lock: registry methods never call
//! back into an endpoint.

use parking_lot::Mutex;

use crate::env::MemIface;
use crate::error::RdmResult;

/// Descriptor of a registered buffer, as supplied by the application or
/// produced by an on-demand registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrDesc {
    pub key: u64,
    pub iface: MemIface,
    /// Parallel descriptor for the shared-memory collaborator.
    pub shm_desc: Option<u64>,
}

/// The registration provider the domain wraps.
pub trait MrProvider: Send {
    /// Whether an on-demand registration cache is available. Read-based
    /// protocols for unregistered sources depend on it.
    fn cache_available(&self) -> bool;

    /// Register a snapshot of `data` for remote access and return its key.
    fn register_bytes(&mut self, data: &[u8], iface: MemIface) -> RdmResult<u64>;

    fn deregister(&mut self, key: u64);

    /// Read `out.len()` bytes of a registered region, for responder-side
    /// emulated reads.
    fn read(&self, key: u64, addr: u64, out: &mut [u8]) -> RdmResult<()>;

    /// Write into a registered region, for responder-side emulated writes.
    fn write(&mut self, key: u64, addr: u64, data: &[u8]) -> RdmResult<()>;

    /// Read-modify-write on a registered region, for atomics.
    fn with_mut(
        &mut self,
        key: u64,
        addr: u64,
        len: usize,
        f: &mut dyn FnMut(&mut [u8]) -> RdmResult<()>,
    ) -> RdmResult<()>;
}

pub struct Domain {
    mr: Mutex<Box<dyn MrProvider>>,
}

impl Domain {
    pub fn new(provider: Box<dyn MrProvider>) -> Self {
        Self {
            mr: Mutex::new(provider),
        }
    }

    pub fn cache_available(&self) -> bool {
        self.mr.lock().cache_available()
    }

    pub fn register_bytes(&self, data: &[u8], iface: MemIface) -> RdmResult<u64> {
        self.mr.lock().register_bytes(data, iface)
    }

    pub fn deregister(&self, key: u64) {
        self.mr.lock().deregister(key);
    }

    pub fn read(&self, key: u64, addr: u64, out: &mut [u8]) -> RdmResult<()> {
        self.mr.lock().read(key, addr, out)
    }

    pub fn write(&self, key: u64, addr: u64, data: &[u8]) -> RdmResult<()> {
        self.mr.lock().write(key, addr, data)
    }

    pub fn with_mut(
        &self,
        key: u64,
        addr: u64,
        len: usize,
        f: &mut dyn FnMut(&mut [u8]) -> RdmResult<()>,
    ) -> RdmResult<()> {
        self.mr.lock().with_mut(key, addr, len, f)
    }
}

/// The atomic-operator arithmetic library, applied to registered memory
/// by the receive path. Operator and datatype codes pass through the
/// wire untouched; their meaning belongs to the library.
pub trait AtomicMath: Send + Sync {
    fn write(&self, op: u32, dtype: u32, dst: &mut [u8], src: &[u8]) -> RdmResult<()>;

    /// Apply `op` and copy the pre-operation value into `old_out`.
    fn fetch(
        &self,
        op: u32,
        dtype: u32,
        dst: &mut [u8],
        src: &[u8],
        old_out: &mut [u8],
    ) -> RdmResult<()>;

    /// Conditionally swap and copy the pre-operation value into `old_out`.
    fn compare(
        &self,
        op: u32,
        dtype: u32,
        dst: &mut [u8],
        src: &[u8],
        cmp: &[u8],
        old_out: &mut [u8],
    ) -> RdmResult<()>;
}
