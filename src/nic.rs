//! Interface to the user-space RDMA datagram device.
//!
//! Device enumeration and queue-pair creation happen outside this crate;
//! the endpoint only consumes the trait below. All posting calls are
//! non-blocking. Work requests are identified by a caller-chosen `wr_id`
//! that comes back in the matching completion.

use crate::error::RdmResult;

/// Raw device-level locator of an endpoint (interface address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawAddr(pub [u8; 16]);

/// Device destination: queue pair number plus locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NicDest {
    pub qpn: u32,
    pub locator: RawAddr,
}

/// A remote registered memory slice, as carried in wire headers and
/// passed to one-sided work requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSlice {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

/// Completion source metadata, used for reverse address lookup.
#[derive(Debug, Clone, Copy)]
pub struct NicRecvMeta {
    pub src_qpn: u32,
    pub src_locator: RawAddr,
}

/// Device error classification for failed work completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicErrorKind {
    /// Receiver not ready: the remote ran out of posted receive buffers
    /// and firmware-level retries were exhausted. Recoverable.
    ReceiverNotReady,
    /// The remote queue pair no longer exists.
    RemoteDestroyed,
    /// Anything else, with the vendor code.
    Transport(u32),
}

/// One entry drained from the device's extended completion queue.
#[derive(Debug)]
pub enum NicCompletion {
    SendOk {
        wr_id: u64,
    },
    RecvOk {
        wr_id: u64,
        buf: Box<[u8]>,
        len: usize,
        meta: NicRecvMeta,
    },
    /// A one-sided read finished; the fetched bytes are handed back here.
    ReadOk {
        wr_id: u64,
        data: Box<[u8]>,
    },
    WriteOk {
        wr_id: u64,
    },
    /// The remote wrote into local memory with immediate data attached.
    /// This consumes a posted receive buffer without filling it.
    RecvRdmaImm {
        wr_id: u64,
        buf: Box<[u8]>,
        imm: u32,
        meta: NicRecvMeta,
    },
    /// A send, read or write work request failed.
    SendErr {
        wr_id: u64,
        err: NicErrorKind,
    },
    /// A receive work request failed; the posted buffer is returned.
    RecvErr {
        wr_id: u64,
        buf: Box<[u8]>,
        err: NicErrorKind,
    },
}

/// Error from posting a receive buffer. The buffer travels back with the
/// error so the caller can return it to its pool.
#[derive(Debug)]
pub enum RecvPostError {
    QueueFull(Box<[u8]>),
}

/// The unreliable datagram device with one-sided read/write support.
pub trait NicDevice: Send {
    /// Wire maximum transfer unit, including transport headers.
    fn mtu(&self) -> usize;
    /// Device send queue depth; the endpoint never exceeds this many
    /// outstanding TX work requests.
    fn max_outstanding_tx(&self) -> usize;
    /// Largest single one-sided transfer the device accepts.
    fn max_rdma_size(&self) -> usize;
    fn supports_rdma_read(&self) -> bool;
    fn supports_rdma_write(&self) -> bool;
    /// Program firmware-level send retries before an RNR completion is
    /// reported (7 retries indefinitely).
    fn configure_rnr_retry(&mut self, retries: u8);

    /// Post one datagram. `more` hints that further requests follow
    /// immediately and may be batched until [`NicDevice::flush`].
    fn post_send(&mut self, dest: &NicDest, wr_id: u64, frame: &[u8], more: bool) -> RdmResult<()>;

    /// Post a receive buffer. Ownership of the buffer passes to the device
    /// until a completion returns it.
    fn post_recv(&mut self, wr_id: u64, buf: Box<[u8]>) -> Result<(), RecvPostError>;

    /// Post a one-sided read of `remote`. `dest` of `None` is a local
    /// read (copy within this process, used for staging device memory).
    fn post_read(
        &mut self,
        dest: Option<&NicDest>,
        wr_id: u64,
        remote: RemoteSlice,
        more: bool,
    ) -> RdmResult<()>;

    /// Post a one-sided write of `data` into `remote`, optionally with
    /// immediate data that raises a completion at the target.
    fn post_write(
        &mut self,
        dest: &NicDest,
        wr_id: u64,
        data: &[u8],
        remote: RemoteSlice,
        imm: Option<u32>,
        more: bool,
    ) -> RdmResult<()>;

    /// Submit any work requests accumulated under the `more` hint.
    fn flush(&mut self) -> RdmResult<()>;

    /// Drain one completion, if any. Never blocks.
    fn poll_cq(&mut self) -> Option<NicCompletion>;
}
