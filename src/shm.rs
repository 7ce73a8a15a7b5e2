//! Shared-memory shortcut for co-located peers.
//!
//! The SHM fast path itself is an external collaborator; the endpoint
//! only detects local peers, translates operations into the
//! collaborator's address space and forwards them. A NIC packet received
//! from a supposedly local peer turns the shortcut off for that peer:
//! the remote chose the device, and we follow.

use smallvec::SmallVec;

use crate::error::RdmResult;
use crate::nic::RemoteSlice;
use crate::ope::DataVec;
use crate::pkt::RmaVec;

/// A send translated for the SHM medium.
#[derive(Debug)]
pub struct ShmSend {
    /// Peer address in the collaborator's own vector.
    pub shm_addr: u64,
    pub data: DataVec,
    pub desc: SmallVec<[Option<u64>; 4]>,
    pub context: u64,
    pub tag: Option<u64>,
    pub cq_data: Option<u64>,
    pub inject: bool,
}

#[derive(Debug)]
pub struct ShmRma {
    pub shm_addr: u64,
    pub data: DataVec,
    pub desc: SmallVec<[Option<u64>; 4]>,
    /// Remote vector, already rewritten to base-0 offsets when the
    /// target endpoint uses offset-style keys.
    pub rma_iov: RmaVec,
    pub context: u64,
    pub cq_data: Option<u64>,
}

#[derive(Debug)]
pub struct ShmAtomic {
    pub shm_addr: u64,
    pub op: u32,
    pub dtype: u32,
    pub operand: Vec<u8>,
    pub compare: Option<Vec<u8>>,
    pub fetch_into: Option<Vec<u8>>,
    pub rma_iov: RmaVec,
    pub context: u64,
}

pub trait ShmTransport: Send {
    /// Whether the collaborator's targets expect offset-style remote
    /// addresses (base 0) rather than virtual addresses.
    fn offset_addressing(&self) -> bool;

    fn send(&mut self, op: ShmSend) -> RdmResult<()>;
    fn write(&mut self, op: ShmRma) -> RdmResult<()>;
    fn read(&mut self, op: ShmRma) -> RdmResult<()>;
    fn atomic(&mut self, op: ShmAtomic) -> RdmResult<()>;
}

/// Rewrite a remote vector for offset addressing.
pub fn rewrite_offsets(iov: &RmaVec) -> RmaVec {
    iov.iter()
        .map(|slice| RemoteSlice {
            addr: 0,
            len: slice.len,
            key: slice.key,
        })
        .collect()
}
