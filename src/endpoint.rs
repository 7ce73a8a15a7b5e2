//! The RDM endpoint: user API surface and operation construction.
//!
//! One endpoint is owned by one cooperative executor at a time; every
//! entry point takes `&mut self` and runs the progress engine before
//! returning when it had to report resource pressure. Multiple endpoints
//! may run in parallel; they share nothing but the domain, whose lock is
//! ordered strictly below the endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::av::{Addr, AddressVector};
use crate::cq::{
    CQ_ATOMIC, CQ_MSG, CQ_READ, CQ_RECV, CQ_RMA, CQ_TAGGED, CQ_TRANSMIT, CQ_WRITE,
    CompletionQueue, Counters, CqEntry, CqErrEntry, CqFlags, EndpointEvent,
};
use crate::domain::{AtomicMath, Domain, MrDesc};
use crate::env::{Config, MemIface};
use crate::error::{RdmError, RdmResult};
use crate::nic::NicDevice;
use crate::ope::{
    DataVec, OP_CLAIM, OP_COMPLETION, OP_DELIVERY_COMPLETE, OP_INJECT, OP_MULTI_RECV, OP_PEEK,
    OPE_DELIVERY_COMPLETE_REQUESTED, OPE_NO_COMPLETION, OPE_NO_COUNTER, OpFlags, OpKind, OpeArena,
    OpeId, OpeState, OpeType, total_iov_len,
};
use crate::peer::{PEER_IN_BACKOFF, PEER_IS_LOCAL, Peer, PeerTable};
use crate::pkt::RmaVec;
use crate::pool::{PktStore, PoolKind};
use crate::shm::{ShmAtomic, ShmRma, ShmSend, ShmTransport, rewrite_offsets};
use crate::srx::PeerSrx;
use crate::time::TimeProvider;

/// External collaborators wired into an endpoint at creation.
pub struct Collaborators {
    pub nic: Box<dyn NicDevice>,
    pub av: Box<dyn AddressVector>,
    pub domain: Arc<Domain>,
    pub time: Arc<dyn TimeProvider>,
    pub amo: Arc<dyn AtomicMath>,
    pub shm: Option<Box<dyn ShmTransport>>,
    pub srx: Option<Box<dyn PeerSrx>>,
}

/// Full-control send description (`sendmsg` shape).
pub struct SendDesc {
    pub addr: Addr,
    pub iov: DataVec,
    pub desc: SmallVec<[Option<MrDesc>; 4]>,
    pub context: u64,
    pub cq_data: Option<u64>,
    pub tag: Option<u64>,
    pub flags: OpFlags,
}

/// Full-control receive description (`recvmsg` shape).
pub struct RecvDesc {
    /// Directed receive source; `None` matches any peer.
    pub addr: Option<Addr>,
    pub iov: DataVec,
    pub desc: SmallVec<[Option<MrDesc>; 4]>,
    pub context: u64,
    pub tag: u64,
    pub ignore: u64,
    pub flags: OpFlags,
}

/// Full-control one-sided description.
pub struct RmaDesc {
    pub addr: Addr,
    pub iov: DataVec,
    pub desc: SmallVec<[Option<MrDesc>; 4]>,
    pub rma_iov: RmaVec,
    pub context: u64,
    pub cq_data: Option<u64>,
    pub flags: OpFlags,
}

/// Atomic operation description.
pub struct AtomicDesc {
    pub addr: Addr,
    pub op: u32,
    pub dtype: u32,
    pub operand: Vec<u8>,
    /// Compare buffer for compare-swap.
    pub compare: Option<Vec<u8>>,
    /// Result buffer for fetch/compare, returned in the completion.
    pub result: Option<Vec<u8>>,
    pub rma_iov: RmaVec,
    pub context: u64,
    pub flags: OpFlags,
}

pub struct Endpoint {
    pub(crate) cfg: Config,
    pub(crate) host_id: u64,
    pub(crate) nic: Box<dyn NicDevice>,
    pub(crate) av: Box<dyn AddressVector>,
    pub(crate) domain: Arc<Domain>,
    pub(crate) time: Arc<dyn TimeProvider>,
    pub(crate) amo: Arc<dyn AtomicMath>,
    pub(crate) shm: Option<Box<dyn ShmTransport>>,
    pub(crate) srx: Option<Box<dyn PeerSrx>>,

    pub(crate) pkts: PktStore,
    pub(crate) opes: OpeArena,
    pub(crate) peers: PeerTable,

    pub(crate) tx_cq: CompletionQueue,
    pub(crate) rx_cq: CompletionQueue,
    pub(crate) events: VecDeque<EndpointEvent>,
    pub(crate) counters: Counters,

    /// Posted receives, oldest first.
    pub(crate) rx_list: VecDeque<OpeId>,
    pub(crate) rx_tagged_list: VecDeque<OpeId>,
    /// Endpoint-wide unexpected queues (peers hold their own views).
    pub(crate) rx_unexp_list: VecDeque<OpeId>,
    pub(crate) rx_unexp_tagged_list: VecDeque<OpeId>,

    /// Queued work, serviced by the progress engine.
    pub(crate) ope_queued_rnr: Vec<OpeId>,
    pub(crate) ope_queued_ctrl: Vec<OpeId>,
    pub(crate) ope_queued_read: Vec<OpeId>,
    pub(crate) ope_longcts_send: Vec<OpeId>,

    /// Claimed unexpected entries keyed by the claiming context.
    pub(crate) claimed: HashMap<u64, OpeId>,

    pub(crate) outstanding_tx: usize,
    pub(crate) rx_pkts_posted: usize,
    pub(crate) more_batch_open: bool,
    /// Completion is written by default unless the CQ was bound
    /// selectively and the operation lacks `OP_COMPLETION`.
    pub(crate) selective_completion: bool,
    pub(crate) failed: bool,
}

impl Endpoint {
    pub fn new(cfg: Config, mut parts: Collaborators) -> RdmResult<Self> {
        if cfg.rnr_retry > crate::env::RNR_INFINITE_RETRY {
            return Err(RdmError::Invalid);
        }
        if cfg.mtu_size == 0 || cfg.mtu_size > parts.nic.mtu() {
            return Err(RdmError::Invalid);
        }
        parts.nic.configure_rnr_retry(cfg.rnr_retry);

        let host_id = cfg.host_id();
        let pkts = PktStore::new(
            cfg.mtu_size,
            &[
                (PoolKind::DeviceTx, cfg.tx_queue_size.max(1), 4),
                (PoolKind::DeviceRx, cfg.rx_pool_chunk_size.max(1), 64),
                (PoolKind::Unexpected, cfg.unexp_pool_chunk_size.max(1), 16),
                (PoolKind::OutOfOrder, cfg.ooo_pool_chunk_size.max(1), 16),
                (PoolKind::ReadCopy, cfg.readcopy_pool_size.max(1), 1),
            ],
        );
        let cq_size = cfg.cq_size;
        Ok(Self {
            host_id,
            nic: parts.nic,
            av: parts.av,
            domain: parts.domain,
            time: parts.time,
            amo: parts.amo,
            shm: parts.shm,
            srx: parts.srx,
            pkts,
            opes: OpeArena::new(65536),
            peers: PeerTable::new(),
            tx_cq: CompletionQueue::new(cq_size),
            rx_cq: CompletionQueue::new(cq_size),
            events: VecDeque::new(),
            counters: Counters::default(),
            rx_list: VecDeque::new(),
            rx_tagged_list: VecDeque::new(),
            rx_unexp_list: VecDeque::new(),
            rx_unexp_tagged_list: VecDeque::new(),
            ope_queued_rnr: Vec::new(),
            ope_queued_ctrl: Vec::new(),
            ope_queued_read: Vec::new(),
            ope_longcts_send: Vec::new(),
            claimed: HashMap::new(),
            outstanding_tx: 0,
            rx_pkts_posted: 0,
            more_batch_open: false,
            selective_completion: false,
            failed: false,
            cfg,
        })
    }

    /// Bind completion reporting selectively: operations only produce a
    /// completion when posted with `OP_COMPLETION`.
    pub fn set_selective_completion(&mut self, on: bool) {
        self.selective_completion = on;
    }

    pub fn host_id(&self) -> u64 {
        self.host_id
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn pop_tx_completion(&mut self) -> Option<Result<CqEntry, CqErrEntry>> {
        self.tx_cq.pop()
    }

    pub fn pop_rx_completion(&mut self) -> Option<Result<CqEntry, CqErrEntry>> {
        self.rx_cq.pop()
    }

    pub fn pop_event(&mut self) -> Option<EndpointEvent> {
        self.events.pop_front()
    }

    // ---- send surfaces -------------------------------------------------

    pub fn send(&mut self, addr: Addr, buf: Vec<u8>, context: u64) -> RdmResult<()> {
        let mut iov = DataVec::new();
        iov.push(buf);
        self.sendmsg(SendDesc {
            addr,
            iov,
            desc: SmallVec::new(),
            context,
            cq_data: None,
            tag: None,
            flags: OpFlags(OP_COMPLETION),
        })
    }

    pub fn sendv(&mut self, addr: Addr, iov: DataVec, context: u64) -> RdmResult<()> {
        self.sendmsg(SendDesc {
            addr,
            iov,
            desc: SmallVec::new(),
            context,
            cq_data: None,
            tag: None,
            flags: OpFlags(OP_COMPLETION),
        })
    }

    /// Small fire-and-forget send: the buffer is captured before return
    /// and no completion is produced.
    pub fn inject(&mut self, addr: Addr, buf: &[u8]) -> RdmResult<()> {
        if buf.len() > self.cfg.inject_size {
            return Err(RdmError::Invalid);
        }
        let mut iov = DataVec::new();
        iov.push(buf.to_vec());
        self.sendmsg(SendDesc {
            addr,
            iov,
            desc: SmallVec::new(),
            context: 0,
            cq_data: None,
            tag: None,
            flags: OpFlags(OP_INJECT),
        })
    }

    pub fn tsend(&mut self, addr: Addr, buf: Vec<u8>, tag: u64, context: u64) -> RdmResult<()> {
        let mut iov = DataVec::new();
        iov.push(buf);
        self.sendmsg(SendDesc {
            addr,
            iov,
            desc: SmallVec::new(),
            context,
            cq_data: None,
            tag: Some(tag),
            flags: OpFlags(OP_COMPLETION),
        })
    }

    pub fn tsendv(&mut self, addr: Addr, iov: DataVec, tag: u64, context: u64) -> RdmResult<()> {
        self.sendmsg(SendDesc {
            addr,
            iov,
            desc: SmallVec::new(),
            context,
            cq_data: None,
            tag: Some(tag),
            flags: OpFlags(OP_COMPLETION),
        })
    }

    pub fn tinject(&mut self, addr: Addr, buf: &[u8], tag: u64) -> RdmResult<()> {
        if buf.len() > self.cfg.inject_size {
            return Err(RdmError::Invalid);
        }
        let mut iov = DataVec::new();
        iov.push(buf.to_vec());
        self.sendmsg(SendDesc {
            addr,
            iov,
            desc: SmallVec::new(),
            context: 0,
            cq_data: None,
            tag: Some(tag),
            flags: OpFlags(OP_INJECT),
        })
    }

    pub fn sendmsg(&mut self, msg: SendDesc) -> RdmResult<()> {
        if self.failed {
            return Err(RdmError::Invalid);
        }
        if msg.iov.len() > 4 || msg.iov.is_empty() {
            return Err(RdmError::Invalid);
        }
        let kind = if msg.tag.is_some() {
            OpKind::Tagged
        } else {
            OpKind::Msg
        };

        self.ensure_peer(msg.addr)?;
        let peer = self.peers.get(msg.addr).expect("peer just ensured");
        if peer.has_flag(PEER_IN_BACKOFF) {
            return Err(RdmError::TryAgain);
        }

        if self.shm_eligible(msg.addr) {
            return self.shm_forward_send(msg);
        }

        let txe = self.alloc_txe(
            kind,
            msg.addr,
            msg.iov,
            msg.desc,
            msg.context,
            msg.cq_data,
            msg.tag.unwrap_or(0),
            msg.flags,
        )?;

        // The message id is consumed only if dispatch succeeds.
        let msg_id = self.peers.get(msg.addr).expect("peer").next_msg_id;
        self.opes.get_mut(txe).expect("fresh txe").msg_id = msg_id;

        match self.post_rtm(txe) {
            Ok(()) => {
                let peer = self.peers.get_mut(msg.addr).expect("peer");
                peer.next_msg_id = peer.next_msg_id.wrapping_add(1);
                Ok(())
            }
            Err(err) => {
                self.release_txe(txe);
                self.progress();
                Err(err)
            }
        }
    }

    // ---- receive surfaces ----------------------------------------------

    pub fn recv(&mut self, buf: Vec<u8>, context: u64) -> RdmResult<()> {
        let mut iov = DataVec::new();
        iov.push(buf);
        self.recvmsg(RecvDesc {
            addr: None,
            iov,
            desc: SmallVec::new(),
            context,
            tag: 0,
            ignore: !0,
            flags: OpFlags(OP_COMPLETION),
        })
    }

    pub fn recvv(&mut self, iov: DataVec, context: u64) -> RdmResult<()> {
        self.recvmsg(RecvDesc {
            addr: None,
            iov,
            desc: SmallVec::new(),
            context,
            tag: 0,
            ignore: !0,
            flags: OpFlags(OP_COMPLETION),
        })
    }

    pub fn trecv(&mut self, buf: Vec<u8>, tag: u64, ignore: u64, context: u64) -> RdmResult<()> {
        let mut iov = DataVec::new();
        iov.push(buf);
        self.trecvmsg(RecvDesc {
            addr: None,
            iov,
            desc: SmallVec::new(),
            context,
            tag,
            ignore,
            flags: OpFlags(OP_COMPLETION),
        })
    }

    pub fn recvmsg(&mut self, msg: RecvDesc) -> RdmResult<()> {
        if self.failed {
            return Err(RdmError::Invalid);
        }
        if msg.flags.has(OP_MULTI_RECV) {
            return self.post_multi_recv(msg);
        }
        self.generic_recv(msg, false)
    }

    pub fn trecvmsg(&mut self, msg: RecvDesc) -> RdmResult<()> {
        if self.failed {
            return Err(RdmError::Invalid);
        }
        if msg.flags.has(OP_PEEK) {
            return self.peek_trecv(msg);
        }
        if msg.flags.has(OP_CLAIM) {
            return self.claim_trecv(msg);
        }
        if msg.flags.has(OP_MULTI_RECV) {
            // Tagged receives cannot ride a multi-recv buffer.
            return Err(RdmError::Invalid);
        }
        self.generic_recv(msg, true)
    }

    // ---- one-sided surfaces --------------------------------------------

    pub fn write(
        &mut self,
        addr: Addr,
        buf: Vec<u8>,
        remote: crate::nic::RemoteSlice,
        context: u64,
    ) -> RdmResult<()> {
        let mut iov = DataVec::new();
        iov.push(buf);
        let mut rma_iov = RmaVec::new();
        rma_iov.push(remote);
        self.writemsg(RmaDesc {
            addr,
            iov,
            desc: SmallVec::new(),
            rma_iov,
            context,
            cq_data: None,
            flags: OpFlags(OP_COMPLETION),
        })
    }

    pub fn writemsg(&mut self, msg: RmaDesc) -> RdmResult<()> {
        self.rma_common(msg, OpKind::Write)
    }

    pub fn read(
        &mut self,
        addr: Addr,
        into: Vec<u8>,
        remote: crate::nic::RemoteSlice,
        context: u64,
    ) -> RdmResult<()> {
        let mut iov = DataVec::new();
        iov.push(into);
        let mut rma_iov = RmaVec::new();
        rma_iov.push(remote);
        self.readmsg(RmaDesc {
            addr,
            iov,
            desc: SmallVec::new(),
            rma_iov,
            context,
            cq_data: None,
            flags: OpFlags(OP_COMPLETION),
        })
    }

    pub fn readmsg(&mut self, msg: RmaDesc) -> RdmResult<()> {
        self.rma_common(msg, OpKind::Read)
    }

    fn rma_common(&mut self, msg: RmaDesc, kind: OpKind) -> RdmResult<()> {
        if self.failed {
            return Err(RdmError::Invalid);
        }
        if msg.iov.is_empty() || msg.iov.len() > 4 || msg.rma_iov.is_empty() {
            return Err(RdmError::Invalid);
        }
        self.ensure_peer(msg.addr)?;
        if self
            .peers
            .get(msg.addr)
            .expect("peer")
            .has_flag(PEER_IN_BACKOFF)
        {
            return Err(RdmError::TryAgain);
        }

        if self.shm_eligible(msg.addr) {
            return self.shm_forward_rma(msg, kind);
        }

        let txe = self.alloc_txe(
            kind,
            msg.addr,
            msg.iov,
            msg.desc,
            msg.context,
            msg.cq_data,
            0,
            msg.flags,
        )?;
        self.opes.get_mut(txe).expect("fresh txe").rma_iov = msg.rma_iov;

        let res = match kind {
            OpKind::Write => self.start_remote_write(txe),
            OpKind::Read => self.start_remote_read(txe),
            _ => unreachable!(),
        };
        if let Err(err) = res {
            self.release_txe(txe);
            self.progress();
            return Err(err);
        }
        Ok(())
    }

    // ---- atomic surfaces -----------------------------------------------

    pub fn atomic(&mut self, msg: AtomicDesc) -> RdmResult<()> {
        if self.failed {
            return Err(RdmError::Invalid);
        }
        if msg.operand.is_empty() || msg.rma_iov.is_empty() {
            return Err(RdmError::Invalid);
        }
        let kind = if msg.compare.is_some() {
            OpKind::AtomicCompare
        } else if msg.result.is_some() {
            OpKind::AtomicFetch
        } else {
            OpKind::AtomicWrite
        };
        if kind == OpKind::AtomicCompare && msg.result.is_none() {
            return Err(RdmError::Invalid);
        }

        self.ensure_peer(msg.addr)?;
        if self
            .peers
            .get(msg.addr)
            .expect("peer")
            .has_flag(PEER_IN_BACKOFF)
        {
            return Err(RdmError::TryAgain);
        }

        if self.shm_eligible(msg.addr) {
            return self.shm_forward_atomic(msg, kind);
        }

        let mut iov = DataVec::new();
        iov.push(msg.operand);
        if let Some(compare) = msg.compare {
            iov.push(compare);
        }
        let txe = self.alloc_txe(
            kind,
            msg.addr,
            iov,
            SmallVec::new(),
            msg.context,
            None,
            0,
            msg.flags,
        )?;
        {
            let ope = self.opes.get_mut(txe).expect("fresh txe");
            ope.rma_iov = msg.rma_iov;
            ope.atomic_op = msg.op;
            ope.atomic_dtype = msg.dtype;
            if let Some(result) = msg.result {
                ope.atomrsp = result;
            }
            if kind == OpKind::AtomicCompare {
                // Only the operand counts toward the transfer length.
                ope.total_len = ope.iov[0].len() as u64;
                ope.cq.len = ope.total_len;
            }
        }

        let msg_id = self.peers.get(msg.addr).expect("peer").next_msg_id;
        self.opes.get_mut(txe).expect("txe").msg_id = msg_id;

        match self.start_atomic(txe) {
            Ok(()) => {
                let peer = self.peers.get_mut(msg.addr).expect("peer");
                peer.next_msg_id = peer.next_msg_id.wrapping_add(1);
                Ok(())
            }
            Err(err) => {
                self.release_txe(txe);
                self.progress();
                Err(err)
            }
        }
    }

    // ---- construction helpers ------------------------------------------

    /// Look up the peer for a handle, creating its state on first use.
    pub(crate) fn ensure_peer(&mut self, addr: Addr) -> RdmResult<()> {
        if self.peers.contains(addr) {
            return Ok(());
        }
        let dest = self.av.resolve(addr).ok_or(RdmError::Invalid)?;
        let is_local = self.av.is_local(addr);
        debug!(peer = %addr, qpn = dest.qpn, is_local, "new peer");
        // Message ids are a plain wrapping counter; both ends start at
        // zero and the max value wraps to zero legally.
        self.peers.insert(Peer::new(addr, dest, 0, is_local));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn alloc_txe(
        &mut self,
        kind: OpKind,
        addr: Addr,
        mut iov: DataVec,
        desc: SmallVec<[Option<MrDesc>; 4]>,
        context: u64,
        cq_data: Option<u64>,
        tag: u64,
        flags: OpFlags,
    ) -> RdmResult<OpeId> {
        let prefix = self.cfg.msg_prefix_size as u64;
        if prefix > 0 && (iov[0].len() as u64) < prefix {
            return Err(RdmError::Invalid);
        }

        let id = self.opes.alloc().ok_or_else(|| {
            warn!("operation entries exhausted");
            RdmError::TryAgain
        })?;

        let delivery_complete = flags.has(OP_DELIVERY_COMPLETE) && !flags.has(OP_INJECT);
        let total = total_iov_len(&iov).saturating_sub(prefix);

        let ope = self.opes.get_mut(id).expect("fresh ope");
        ope.ty = OpeType::Tx;
        ope.state = OpeState::TxReq;
        ope.kind = kind;
        ope.addr = Some(addr);
        ope.iov = std::mem::take(&mut iov);
        ope.desc = desc;
        ope.prefix_len = prefix;
        ope.total_len = total;
        ope.tag = tag;
        ope.op_flags = flags;
        ope.cq.context = context;
        ope.cq.data = cq_data;
        ope.cq.tag = tag;
        ope.cq.len = total;
        ope.cq.flags = tx_cq_flags(kind);
        if delivery_complete {
            ope.set_flag(OPE_DELIVERY_COMPLETE_REQUESTED);
        }
        if flags.has(OP_INJECT) {
            ope.set_flag(OPE_NO_COMPLETION);
            ope.set_flag(OPE_NO_COUNTER);
        }

        self.peers
            .get_mut(addr)
            .expect("peer exists")
            .txe_list
            .push(id);
        Ok(id)
    }

    pub(crate) fn alloc_rxe(
        &mut self,
        kind: OpKind,
        addr: Option<Addr>,
        iov: DataVec,
        desc: SmallVec<[Option<MrDesc>; 4]>,
        context: u64,
        tag: u64,
        ignore: u64,
        flags: OpFlags,
    ) -> RdmResult<OpeId> {
        let id = self.opes.alloc().ok_or(RdmError::TryAgain)?;
        let prefix = self.cfg.msg_prefix_size as u64;
        let buffered = total_iov_len(&iov).saturating_sub(prefix);
        let ope = self.opes.get_mut(id).expect("fresh ope");
        ope.ty = OpeType::Rx;
        ope.state = OpeState::RxInit;
        ope.kind = kind;
        ope.addr = addr;
        ope.iov = iov;
        ope.desc = desc;
        ope.prefix_len = prefix;
        ope.tag = tag;
        ope.ignore = ignore;
        ope.op_flags = flags;
        ope.cq.context = context;
        ope.cq.tag = tag;
        ope.cq.len = buffered;
        ope.cq.flags = CqFlags(CQ_RECV | CQ_MSG);
        if kind == OpKind::Tagged {
            ope.cq.flags = ope.cq.flags.with(CQ_TAGGED);
        }
        if let Some(addr) = addr {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.rxe_list.push(id);
            }
        }
        Ok(id)
    }

    pub(crate) fn shm_eligible(&self, addr: Addr) -> bool {
        if !self.cfg.enable_shm_transfer || self.shm.is_none() {
            return false;
        }
        self.peers
            .get(addr)
            .is_some_and(|p| p.has_flag(PEER_IS_LOCAL) && p.shm_addr.is_some())
    }

    fn shm_forward_send(&mut self, msg: SendDesc) -> RdmResult<()> {
        let peer = self.peers.get(msg.addr).expect("peer");
        let shm_addr = peer.shm_addr.expect("checked by shm_eligible");
        let shm_desc = msg
            .desc
            .iter()
            .map(|d| d.as_ref().and_then(|d| d.shm_desc))
            .collect();
        let shm = self.shm.as_mut().expect("checked by shm_eligible");
        shm.send(ShmSend {
            shm_addr,
            data: msg.iov,
            desc: shm_desc,
            context: msg.context,
            tag: msg.tag,
            cq_data: msg.cq_data,
            inject: msg.flags.has(OP_INJECT),
        })
    }

    fn shm_forward_rma(&mut self, msg: RmaDesc, kind: OpKind) -> RdmResult<()> {
        let peer = self.peers.get(msg.addr).expect("peer");
        let shm_addr = peer.shm_addr.expect("checked by shm_eligible");
        let shm_desc = msg
            .desc
            .iter()
            .map(|d| d.as_ref().and_then(|d| d.shm_desc))
            .collect();
        let shm = self.shm.as_mut().expect("checked by shm_eligible");
        let rma_iov = if shm.offset_addressing() {
            rewrite_offsets(&msg.rma_iov)
        } else {
            msg.rma_iov
        };
        let op = ShmRma {
            shm_addr,
            data: msg.iov,
            desc: shm_desc,
            rma_iov,
            context: msg.context,
            cq_data: msg.cq_data,
        };
        match kind {
            OpKind::Write => shm.write(op),
            OpKind::Read => shm.read(op),
            _ => unreachable!(),
        }
    }

    fn shm_forward_atomic(&mut self, msg: AtomicDesc, _kind: OpKind) -> RdmResult<()> {
        let peer = self.peers.get(msg.addr).expect("peer");
        let shm_addr = peer.shm_addr.expect("checked by shm_eligible");
        let shm = self.shm.as_mut().expect("checked by shm_eligible");
        let rma_iov = if shm.offset_addressing() {
            rewrite_offsets(&msg.rma_iov)
        } else {
            msg.rma_iov
        };
        shm.atomic(ShmAtomic {
            shm_addr,
            op: msg.op,
            dtype: msg.dtype,
            operand: msg.operand,
            compare: msg.compare,
            fetch_into: msg.result,
            rma_iov,
            context: msg.context,
        })
    }

    /// Register a peer's SHM address, enabling the shortcut for it.
    pub fn set_peer_shm_addr(&mut self, addr: Addr, shm_addr: u64) -> RdmResult<()> {
        self.ensure_peer(addr)?;
        let peer = self.peers.get_mut(addr).expect("peer");
        peer.shm_addr = Some(shm_addr);
        Ok(())
    }

    pub(crate) fn iface_of(desc: &[Option<MrDesc>]) -> MemIface {
        desc.first()
            .and_then(|d| d.as_ref())
            .map(|d| d.iface)
            .unwrap_or(MemIface::System)
    }

    /// Per-peer in-flight packet budget: an equal share of the TX queue
    /// with a configured floor.
    pub(crate) fn peer_credit_limit(&self) -> usize {
        let share = self.cfg.tx_queue_size / self.peers.len().max(1);
        share.max(self.cfg.tx_min_credits)
    }
}

pub(crate) fn tx_cq_flags(kind: OpKind) -> CqFlags {
    CqFlags(match kind {
        OpKind::Msg => CQ_TRANSMIT | CQ_MSG,
        OpKind::Tagged => CQ_TRANSMIT | CQ_MSG | CQ_TAGGED,
        OpKind::Write => CQ_RMA | CQ_WRITE,
        OpKind::Read => CQ_RMA | CQ_READ,
        OpKind::AtomicWrite => CQ_WRITE | CQ_ATOMIC,
        OpKind::AtomicFetch | OpKind::AtomicCompare => CQ_READ | CQ_ATOMIC,
    })
}
