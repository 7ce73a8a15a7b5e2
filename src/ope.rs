//! Operation entries.
//!
//! Every user operation (and every internally generated responder
//! operation) is tracked by one `Ope` living in a per-endpoint arena.
//! Entries reference peers and packets by id, and peers reference
//! entries back the same way; there are no owning pointers in either
//! direction. Queue membership is recorded in the entry's flag bitset so
//! an entry is never on two lists of the same class.

use smallvec::SmallVec;

use crate::av::Addr;
use crate::cq::CqFlags;
use crate::domain::MrDesc;
use crate::pkt::{PacketType, RmaVec};
use crate::pool::PktId;

/// Arena handle. The generation detects stale ids after slot reuse;
/// wire headers carry only the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpeId {
    pub index: u32,
    pub generation: u32,
}

impl std::fmt::Display for OpeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpeType {
    Tx,
    Rx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Msg,
    Tagged,
    Write,
    Read,
    AtomicWrite,
    AtomicFetch,
    AtomicCompare,
}

/// Entry lifecycle. `Free` is terminal: a released entry never changes
/// state again until the slot is reallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpeState {
    Free,
    /// TX: sending REQ packet(s).
    TxReq,
    /// TX: streaming windowed data.
    TxSend,
    /// RX: posted, waiting for a message.
    RxInit,
    /// RX: created for an unexpected message, waiting for a post.
    RxUnexp,
    /// RX: matched with an incoming message.
    RxMatched,
    /// RX: receiving data packets of a large message.
    RxRecv,
}

/// `Ope::flags` bits. The three `QUEUED_*` bits double as queue-class
/// membership markers.
pub const OPE_QUEUED_RNR: u32 = 1 << 0;
pub const OPE_QUEUED_CTRL: u32 = 1 << 1;
pub const OPE_QUEUED_READ: u32 = 1 << 2;
pub const OPE_LONGCTS_SENDING: u32 = 1 << 3;
pub const OPE_EOR_IN_FLIGHT: u32 = 1 << 4;
pub const OPE_CANCELLED: u32 = 1 << 5;
pub const OPE_MULTI_RECV_POSTED: u32 = 1 << 6;
pub const OPE_MULTI_RECV_CONSUMER: u32 = 1 << 7;
pub const OPE_DELIVERY_COMPLETE_REQUESTED: u32 = 1 << 8;
/// Guard so a TX entry writes at most one RNR error completion no matter
/// how many of its packets hit RNR.
pub const OPE_RNR_ERR_WRITTEN: u32 = 1 << 9;
pub const OPE_NO_COMPLETION: u32 = 1 << 10;
pub const OPE_NO_COUNTER: u32 = 1 << 11;
pub const OPE_FOR_PEER_SRX: u32 = 1 << 12;
/// Set once an error completion was produced, to suppress a second one.
pub const OPE_ERRORED: u32 = 1 << 13;

/// User operation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFlags(pub u64);

pub const OP_COMPLETION: u64 = 1 << 0;
pub const OP_DELIVERY_COMPLETE: u64 = 1 << 1;
pub const OP_INJECT: u64 = 1 << 2;
pub const OP_MULTI_RECV: u64 = 1 << 3;
pub const OP_PEEK: u64 = 1 << 4;
pub const OP_CLAIM: u64 = 1 << 5;
pub const OP_DISCARD: u64 = 1 << 6;
pub const OP_REMOTE_CQ_DATA: u64 = 1 << 7;
pub const OP_MORE: u64 = 1 << 8;

impl OpFlags {
    pub fn has(self, bit: u64) -> bool {
        self.0 & bit != 0
    }
}

/// Owned data segments of an operation, at most four.
pub type DataVec = SmallVec<[Vec<u8>; 4]>;

pub fn total_iov_len(iov: &DataVec) -> u64 {
    iov.iter().map(|seg| seg.len() as u64).sum()
}

/// Per-operation completion template, filled in as the operation makes
/// progress and flushed to the user CQ at the end.
#[derive(Debug, Clone, Default)]
pub struct CqTemplate {
    pub context: u64,
    pub flags: CqFlags,
    pub len: u64,
    pub data: Option<u64>,
    pub tag: u64,
}

#[derive(Debug)]
pub struct Ope {
    pub ty: OpeType,
    pub state: OpeState,
    pub kind: OpKind,
    pub addr: Option<Addr>,
    pub msg_id: u32,
    pub tag: u64,
    pub ignore: u64,
    pub flags: u32,
    pub op_flags: OpFlags,

    pub iov: DataVec,
    pub desc: SmallVec<[Option<MrDesc>; 4]>,
    /// Remote vector of the operation's target (RMA and atomics).
    pub rma_iov: RmaVec,
    /// Registered local segments advertised for the peer to read
    /// (read-based message protocols).
    pub source_iov: RmaVec,
    /// Skipped application-owned prefix at the front of `iov[0]`.
    pub prefix_len: u64,

    pub total_len: u64,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub bytes_copied: u64,
    pub bytes_runt: u64,
    pub window: u64,
    pub max_req_data_size: u64,

    pub bytes_read_offset: u64,
    pub bytes_read_total: u64,
    pub bytes_read_submitted: u64,
    pub bytes_read_completed: u64,
    pub bytes_write_total: u64,
    pub bytes_write_submitted: u64,
    pub bytes_write_completed: u64,

    /// Work requests of this entry currently owned by the device.
    pub device_outstanding_tx: usize,
    /// Packets queued for retry after RNR or a full TX queue.
    pub queued_pkts: Vec<PktId>,
    pub queued_ctrl_type: Option<PacketType>,

    pub cq: CqTemplate,
    /// The remote side's entry id, learned from CTS/READRSP/RTM headers.
    pub remote_id: Option<u32>,
    pub unexp_pkt: Option<PktId>,
    /// Later fragments that arrived while the message was unexpected,
    /// replayed when it matches.
    pub unexp_frags: Vec<PktId>,
    /// Multi-recv: master for a consumer, consumers for a master.
    pub master: Option<OpeId>,
    pub consumers: Vec<OpeId>,
    /// Operator and datatype codes for atomics, passed through to the
    /// arithmetic library.
    pub atomic_op: u32,
    pub atomic_dtype: u32,
    /// Staged atomic response bytes: the result buffer on the requester,
    /// the pre-operation value on the responder.
    pub atomrsp: Vec<u8>,
    /// Keys registered on behalf of this entry, dropped at release.
    pub registered_keys: SmallVec<[u64; 4]>,
    /// Source packet of a local read (device-memory staging copy).
    pub local_read_pkt: Option<PktId>,
}

impl Ope {
    fn blank() -> Self {
        Self {
            ty: OpeType::Tx,
            state: OpeState::Free,
            kind: OpKind::Msg,
            addr: None,
            msg_id: 0,
            tag: 0,
            ignore: !0,
            flags: 0,
            op_flags: OpFlags::default(),
            iov: DataVec::new(),
            desc: SmallVec::new(),
            rma_iov: RmaVec::new(),
            source_iov: RmaVec::new(),
            prefix_len: 0,
            total_len: 0,
            bytes_sent: 0,
            bytes_acked: 0,
            bytes_received: 0,
            bytes_copied: 0,
            bytes_runt: 0,
            window: 0,
            max_req_data_size: 0,
            bytes_read_offset: 0,
            bytes_read_total: 0,
            bytes_read_submitted: 0,
            bytes_read_completed: 0,
            bytes_write_total: 0,
            bytes_write_submitted: 0,
            bytes_write_completed: 0,
            device_outstanding_tx: 0,
            queued_pkts: Vec::new(),
            queued_ctrl_type: None,
            cq: CqTemplate::default(),
            remote_id: None,
            unexp_pkt: None,
            unexp_frags: Vec::new(),
            master: None,
            consumers: Vec::new(),
            atomic_op: 0,
            atomic_dtype: 0,
            atomrsp: Vec::new(),
            registered_keys: SmallVec::new(),
            local_read_pkt: None,
        }
    }

    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }

    pub fn set_flag(&mut self, bit: u32) {
        self.flags |= bit;
    }

    pub fn clear_flag(&mut self, bit: u32) {
        self.flags &= !bit;
    }

    /// Copy `out.len()` bytes starting at message offset `offset` out of
    /// the data segments.
    pub fn copy_out(&self, offset: u64, out: &mut [u8]) {
        let mut skip = offset + self.prefix_len;
        let mut written = 0usize;
        for seg in &self.iov {
            let seg_len = seg.len() as u64;
            if skip >= seg_len {
                skip -= seg_len;
                continue;
            }
            let start = skip as usize;
            skip = 0;
            let avail = seg.len() - start;
            let want = out.len() - written;
            let take = avail.min(want);
            out[written..written + take].copy_from_slice(&seg[start..start + take]);
            written += take;
            if written == out.len() {
                break;
            }
        }
        debug_assert_eq!(written, out.len(), "copy_out past end of data vector");
    }

    /// Copy received bytes into the data segments at message offset
    /// `offset`, clipped to the buffer. Returns the number copied.
    pub fn copy_in(&mut self, offset: u64, data: &[u8]) -> usize {
        let mut skip = offset + self.prefix_len;
        let mut read = 0usize;
        for seg in &mut self.iov {
            let seg_len = seg.len() as u64;
            if skip >= seg_len {
                skip -= seg_len;
                continue;
            }
            let start = skip as usize;
            skip = 0;
            let avail = seg.len() - start;
            let want = data.len() - read;
            let take = avail.min(want);
            seg[start..start + take].copy_from_slice(&data[read..read + take]);
            read += take;
            if read == data.len() {
                break;
            }
        }
        read
    }

    /// Usable receive capacity of the data segments.
    pub fn buffer_len(&self) -> u64 {
        total_iov_len(&self.iov).saturating_sub(self.prefix_len)
    }
}

struct Slot {
    generation: u32,
    ope: Ope,
}

/// Slab of operation entries with a free list.
pub struct OpeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    cap: usize,
}

impl OpeArena {
    pub fn new(cap: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            cap,
        }
    }

    /// Allocate a zeroed entry. Returns `None` when the arena cap is hit.
    pub fn alloc(&mut self) -> Option<OpeId> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert_eq!(slot.ope.state, OpeState::Free);
            slot.ope = Ope::blank();
            return Some(OpeId {
                index,
                generation: slot.generation,
            });
        }
        if self.slots.len() >= self.cap {
            return None;
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            ope: Ope::blank(),
        });
        Some(OpeId {
            index,
            generation: 0,
        })
    }

    pub fn get(&self, id: OpeId) -> Option<&Ope> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation || slot.ope.state == OpeState::Free {
            return None;
        }
        Some(&slot.ope)
    }

    pub fn get_mut(&mut self, id: OpeId) -> Option<&mut Ope> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.ope.state == OpeState::Free {
            return None;
        }
        Some(&mut slot.ope)
    }

    /// Resolve a wire-carried entry index to the current id, if the slot
    /// is live.
    pub fn by_wire_id(&self, index: u32) -> Option<OpeId> {
        let slot = self.slots.get(index as usize)?;
        if slot.ope.state == OpeState::Free {
            return None;
        }
        Some(OpeId {
            index,
            generation: slot.generation,
        })
    }

    /// Mark the entry free and bump the slot generation. The caller must
    /// already have detached it from every queue.
    pub fn release(&mut self, id: OpeId) {
        let slot = &mut self.slots[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale ope id at release");
        debug_assert_ne!(slot.ope.state, OpeState::Free, "double release of ope");
        slot.ope.state = OpeState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
