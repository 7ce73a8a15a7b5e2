//! Pre-registered packet buffer pools.
//!
//! Every wire packet the endpoint touches lives in a pool entry: a
//! fixed-size buffer plus bookkeeping. Entries are recycled through
//! per-kind free lists; pools grow by whole chunks so that co-located
//! processes can synchronize their allocation spikes by growing all
//! receive-side pools on the first progress tick.

use crate::error::{RdmError, RdmResult};
use crate::av::Addr;
use crate::ope::OpeId;

/// Which pool an entry belongs to. An entry never changes pools; the only
/// cross-pool operation is [`PktStore::clone_into_readcopy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    DeviceTx,
    DeviceRx,
    Unexpected,
    OutOfOrder,
    ReadCopy,
    /// Zero-copy receive: the buffer is an application receive buffer.
    UserBuffer,
    /// Tiny entries handed to the external receive-matching service.
    PeerSrx,
}

const POOL_KIND_COUNT: usize = 7;

impl PoolKind {
    fn index(self) -> usize {
        match self {
            PoolKind::DeviceTx => 0,
            PoolKind::DeviceRx => 1,
            PoolKind::Unexpected => 2,
            PoolKind::OutOfOrder => 3,
            PoolKind::ReadCopy => 4,
            PoolKind::UserBuffer => 5,
            PoolKind::PeerSrx => 6,
        }
    }
}

/// Handle to a pool entry. Stable for the entry's whole lifetime, and the
/// value used as the device work-request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PktId(pub u32);

pub const PKT_FROM_USER_BUFFER: u8 = 1 << 0;
pub const PKT_LOCAL_READ: u8 = 1 << 1;
/// The packet already went through one RNR retransmit cycle.
pub const PKT_RNR_RETRANSMIT: u8 = 1 << 2;

/// A packet entry: one wire buffer plus metadata.
#[derive(Debug)]
pub struct PktEntry {
    pub kind: PoolKind,
    /// `None` while the buffer is posted to the device.
    pub buf: Option<Box<[u8]>>,
    /// Length of the valid frame in `buf`.
    pub len: usize,
    /// Owning operation; `None` for handshakes.
    pub ope: Option<OpeId>,
    /// Peer address: destination for TX entries, reverse-looked-up source
    /// for RX entries. `None` when the peer left the address vector.
    pub addr: Option<Addr>,
    /// Message offset of a one-sided work request using this entry as
    /// its context.
    pub rma_offset: u64,
    pub flags: u8,
}

impl PktEntry {
    pub fn frame(&self) -> &[u8] {
        &self.buf.as_ref().expect("buffer posted to device")[..self.len]
    }
}

struct Slot {
    in_use: bool,
    entry: PktEntry,
}

struct PoolState {
    free: Vec<PktId>,
    chunk_size: usize,
    /// Cap on total entries, in chunks. Zero means the pool is unused.
    max_chunks: usize,
    chunks: usize,
}

/// All packet pools of one endpoint.
pub struct PktStore {
    slots: Vec<Slot>,
    pools: [PoolState; POOL_KIND_COUNT],
    buf_size: usize,
}

impl PktStore {
    pub fn new(buf_size: usize, plan: &[(PoolKind, usize, usize)]) -> Self {
        let mut pools: [PoolState; POOL_KIND_COUNT] = std::array::from_fn(|_| PoolState {
            free: Vec::new(),
            chunk_size: 0,
            max_chunks: 0,
            chunks: 0,
        });
        for &(kind, chunk_size, max_chunks) in plan {
            pools[kind.index()] = PoolState {
                free: Vec::new(),
                chunk_size,
                max_chunks,
                chunks: 0,
            };
        }
        Self {
            slots: Vec::new(),
            pools,
            buf_size,
        }
    }

    /// Allocate one chunk of buffers for `kind` up front.
    pub fn grow(&mut self, kind: PoolKind) -> RdmResult<()> {
        let pool = &self.pools[kind.index()];
        if pool.chunk_size == 0 || pool.chunks >= pool.max_chunks {
            return Err(RdmError::OutOfResources);
        }
        let chunk_size = pool.chunk_size;
        for _ in 0..chunk_size {
            let id = PktId(self.slots.len() as u32);
            self.slots.push(Slot {
                in_use: false,
                entry: PktEntry {
                    kind,
                    buf: Some(vec![0u8; self.buf_size].into_boxed_slice()),
                    len: 0,
                    ope: None,
                    addr: None,
                    rma_offset: 0,
                    flags: 0,
                },
            });
            self.pools[kind.index()].free.push(id);
        }
        self.pools[kind.index()].chunks += 1;
        Ok(())
    }

    /// Whether the pool has ever been grown. Used by the first-tick
    /// allocation barrier.
    pub fn is_unallocated(&self, kind: PoolKind) -> bool {
        let pool = &self.pools[kind.index()];
        pool.chunk_size != 0 && pool.chunks == 0
    }

    pub fn chunk_size(&self, kind: PoolKind) -> usize {
        self.pools[kind.index()].chunk_size
    }

    /// Allocate an entry, growing the pool by one chunk when the free
    /// list is empty and the cap allows.
    pub fn alloc(&mut self, kind: PoolKind) -> Option<PktId> {
        if self.pools[kind.index()].free.is_empty() {
            self.grow(kind).ok()?;
        }
        let id = self.pools[kind.index()].free.pop()?;
        let slot = &mut self.slots[id.0 as usize];
        debug_assert!(!slot.in_use);
        slot.in_use = true;
        slot.entry.len = 0;
        slot.entry.ope = None;
        slot.entry.addr = None;
        slot.entry.rma_offset = 0;
        slot.entry.flags = 0;
        Some(id)
    }

    /// Wrap a caller-provided buffer as a [`PoolKind::UserBuffer`] or
    /// [`PoolKind::PeerSrx`] entry. Such entries do not count against any
    /// chunk cap.
    pub fn adopt(&mut self, kind: PoolKind, buf: Box<[u8]>, len: usize) -> PktId {
        debug_assert!(matches!(kind, PoolKind::UserBuffer | PoolKind::PeerSrx));
        if let Some(id) = self.pools[kind.index()].free.pop() {
            let slot = &mut self.slots[id.0 as usize];
            slot.in_use = true;
            slot.entry.buf = Some(buf);
            slot.entry.len = len;
            slot.entry.ope = None;
            slot.entry.addr = None;
            slot.entry.rma_offset = 0;
            slot.entry.flags = if kind == PoolKind::UserBuffer {
                PKT_FROM_USER_BUFFER
            } else {
                0
            };
            return id;
        }
        let id = PktId(self.slots.len() as u32);
        self.slots.push(Slot {
            in_use: true,
            entry: PktEntry {
                kind,
                buf: Some(buf),
                len,
                ope: None,
                addr: None,
                rma_offset: 0,
                flags: if kind == PoolKind::UserBuffer {
                    PKT_FROM_USER_BUFFER
                } else {
                    0
                },
            },
        });
        id
    }

    /// Return an entry to its originating pool.
    pub fn release(&mut self, id: PktId) -> Option<Box<[u8]>> {
        let slot = &mut self.slots[id.0 as usize];
        debug_assert!(slot.in_use, "double release of packet entry");
        slot.in_use = false;
        slot.entry.len = 0;
        slot.entry.ope = None;
        let kind = slot.entry.kind;
        if matches!(kind, PoolKind::UserBuffer | PoolKind::PeerSrx) {
            // Adopted buffers go back to their owner, not the pool.
            let buf = slot.entry.buf.take();
            self.pools[kind.index()].free.push(id);
            return buf;
        }
        self.pools[kind.index()].free.push(id);
        None
    }

    /// Copy an entry's frame and metadata into a fresh read-copy entry.
    ///
    /// Needed when the source entry is not registered with the device, or
    /// when a 128-byte-aligned staging buffer is required for in-order
    /// device reads.
    pub fn clone_into_readcopy(&mut self, src: PktId) -> Option<PktId> {
        let dst = self.alloc(PoolKind::ReadCopy)?;
        let (frame, len, ope, addr, flags) = {
            let entry = self.entry(src);
            (
                entry.frame().to_vec(),
                entry.len,
                entry.ope,
                entry.addr,
                entry.flags,
            )
        };
        let dst_entry = &mut self.slots[dst.0 as usize].entry;
        dst_entry.buf.as_mut().expect("fresh entry has buffer")[..len].copy_from_slice(&frame);
        dst_entry.len = len;
        dst_entry.ope = ope;
        dst_entry.addr = addr;
        dst_entry.flags = flags;
        Some(dst)
    }

    /// Clone into the given pool kind (unexpected / out-of-order stashes).
    pub fn clone_into(&mut self, src: PktId, kind: PoolKind) -> Option<PktId> {
        let dst = self.alloc(kind)?;
        let (frame, len, ope, addr, flags) = {
            let entry = self.entry(src);
            (
                entry.frame().to_vec(),
                entry.len,
                entry.ope,
                entry.addr,
                entry.flags,
            )
        };
        let dst_entry = &mut self.slots[dst.0 as usize].entry;
        dst_entry.buf.as_mut().expect("fresh entry has buffer")[..len].copy_from_slice(&frame);
        dst_entry.len = len;
        dst_entry.ope = ope;
        dst_entry.addr = addr;
        dst_entry.flags = flags;
        Some(dst)
    }

    pub fn entry(&self, id: PktId) -> &PktEntry {
        debug_assert!(self.slots[id.0 as usize].in_use);
        &self.slots[id.0 as usize].entry
    }

    pub fn entry_mut(&mut self, id: PktId) -> &mut PktEntry {
        debug_assert!(self.slots[id.0 as usize].in_use);
        &mut self.slots[id.0 as usize].entry
    }

    /// Detach the buffer for posting to the device.
    pub fn take_buf(&mut self, id: PktId) -> Box<[u8]> {
        self.slots[id.0 as usize]
            .entry
            .buf
            .take()
            .expect("buffer already posted")
    }

    /// Reattach a buffer returned by a device completion.
    pub fn put_buf(&mut self, id: PktId, buf: Box<[u8]>, len: usize) {
        let entry = &mut self.slots[id.0 as usize].entry;
        debug_assert!(entry.buf.is_none());
        entry.buf = Some(buf);
        entry.len = len;
    }

    pub fn free_count(&self, kind: PoolKind) -> usize {
        self.pools[kind.index()].free.len()
    }
}
