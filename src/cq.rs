//! User-facing completion queue, counters and the endpoint event queue.

use std::collections::VecDeque;

use crate::av::Addr;
use crate::error::RdmError;
use crate::ope::DataVec;

/// Completion flag bits, combined per operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CqFlags(pub u32);

pub const CQ_TRANSMIT: u32 = 1 << 0;
pub const CQ_RECV: u32 = 1 << 1;
pub const CQ_MSG: u32 = 1 << 2;
pub const CQ_TAGGED: u32 = 1 << 3;
pub const CQ_RMA: u32 = 1 << 4;
pub const CQ_READ: u32 = 1 << 5;
pub const CQ_WRITE: u32 = 1 << 6;
pub const CQ_ATOMIC: u32 = 1 << 7;
pub const CQ_REMOTE_WRITE: u32 = 1 << 8;
pub const CQ_REMOTE_CQ_DATA: u32 = 1 << 9;
pub const CQ_MULTI_RECV: u32 = 1 << 10;

impl CqFlags {
    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(self, bit: u32) -> Self {
        CqFlags(self.0 | bit)
    }
}

/// One successful completion.
#[derive(Debug)]
pub struct CqEntry {
    pub context: u64,
    pub flags: CqFlags,
    pub len: u64,
    /// Buffers handed back to the application (receive data, fetched
    /// atomic results, read results).
    pub buf: DataVec,
    pub data: Option<u64>,
    pub tag: u64,
    pub src_addr: Option<Addr>,
}

/// One error completion.
#[derive(Debug)]
pub struct CqErrEntry {
    pub context: u64,
    pub flags: CqFlags,
    /// Bytes actually placed for a truncated receive.
    pub len: u64,
    /// Original message length for a truncated receive.
    pub olen: u64,
    pub buf: DataVec,
    pub data: Option<u64>,
    pub tag: u64,
    pub err: RdmError,
}

/// Events with no owning operation (handshake send failures, malformed
/// packets, CQ overflows).
#[derive(Debug)]
pub struct EndpointEvent {
    pub err: RdmError,
    pub fatal: bool,
    pub detail: &'static str,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub tx: u64,
    pub rx: u64,
    pub read: u64,
    pub write: u64,
    pub remote_write: u64,
    pub tx_err: u64,
    pub rx_err: u64,
}

/// Bounded completion queue. A full queue fails the write; the caller
/// escalates to the event queue.
pub struct CompletionQueue {
    entries: VecDeque<Result<CqEntry, CqErrEntry>>,
    cap: usize,
}

impl CompletionQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap,
        }
    }

    pub fn push_ok(&mut self, entry: CqEntry) -> Result<(), CqEntry> {
        if self.entries.len() >= self.cap {
            return Err(entry);
        }
        self.entries.push_back(Ok(entry));
        Ok(())
    }

    pub fn push_err(&mut self, entry: CqErrEntry) -> Result<(), CqErrEntry> {
        if self.entries.len() >= self.cap {
            return Err(entry);
        }
        self.entries.push_back(Err(entry));
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Result<CqEntry, CqErrEntry>> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_rejects_write() {
        let mut cq = CompletionQueue::new(1);
        cq.push_ok(CqEntry {
            context: 1,
            flags: CqFlags(CQ_TRANSMIT),
            len: 0,
            buf: DataVec::new(),
            data: None,
            tag: 0,
            src_addr: None,
        })
        .unwrap();
        let overflow = cq.push_ok(CqEntry {
            context: 2,
            flags: CqFlags(CQ_TRANSMIT),
            len: 0,
            buf: DataVec::new(),
            data: None,
            tag: 0,
            src_addr: None,
        });
        assert!(overflow.is_err());
        assert_eq!(cq.len(), 1);
    }
}

use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::ope::{
    OP_COMPLETION, OPE_CANCELLED, OPE_DELIVERY_COMPLETE_REQUESTED, OPE_EOR_IN_FLIGHT,
    OPE_ERRORED, OPE_LONGCTS_SENDING, OPE_MULTI_RECV_CONSUMER, OPE_NO_COMPLETION, OPE_NO_COUNTER,
    OPE_QUEUED_CTRL, OPE_QUEUED_READ, OPE_QUEUED_RNR, OpKind, OpeId, OpeState, OpeType,
};
use crate::pkt::PacketType;

impl Endpoint {
    pub(crate) fn write_event(&mut self, err: RdmError, fatal: bool, detail: &'static str) {
        warn!(?err, fatal, detail, "endpoint event");
        self.events.push_back(EndpointEvent { err, fatal, detail });
        if fatal {
            self.failed = true;
        }
    }

    fn should_write_completion(&self, ope_id: OpeId) -> bool {
        let Some(ope) = self.opes.get(ope_id) else {
            return false;
        };
        if ope.has_flag(OPE_NO_COMPLETION) || ope.has_flag(OPE_ERRORED) {
            return false;
        }
        !self.selective_completion || ope.op_flags.has(OP_COMPLETION)
    }

    fn bump_counter(&mut self, flags: CqFlags, error: bool, tx: bool) {
        if error {
            if tx {
                self.counters.tx_err += 1;
            } else {
                self.counters.rx_err += 1;
            }
            return;
        }
        if flags.has(CQ_READ) {
            self.counters.read += 1;
        } else if flags.has(CQ_WRITE) {
            self.counters.write += 1;
        } else if tx {
            self.counters.tx += 1;
        } else {
            self.counters.rx += 1;
        }
    }

    /// Write the success completion for a TX-side operation.
    pub(crate) fn report_tx_completion(&mut self, ope_id: OpeId) {
        let write = self.should_write_completion(ope_id);
        let (flags, no_counter) = {
            let ope = self.opes.get(ope_id).expect("ope");
            (ope.cq.flags, ope.has_flag(OPE_NO_COUNTER))
        };
        if write {
            let ope = self.opes.get_mut(ope_id).expect("ope");
            let mut buf = std::mem::take(&mut ope.iov);
            if matches!(ope.kind, OpKind::AtomicFetch | OpKind::AtomicCompare) {
                buf.push(std::mem::take(&mut ope.atomrsp));
            }
            let entry = CqEntry {
                context: ope.cq.context,
                flags: ope.cq.flags,
                len: ope.cq.len,
                buf,
                data: ope.cq.data,
                tag: ope.cq.tag,
                src_addr: None,
            };
            ope.set_flag(OPE_NO_COMPLETION);
            debug!(ope = %ope_id, "send completion");
            if self.tx_cq.push_ok(entry).is_err() {
                self.write_event(RdmError::OutOfResources, false, "tx cq overflow");
            }
        }
        if !no_counter {
            self.bump_counter(flags, false, true);
        }
    }

    /// Write the success (or truncation / cancellation) completion for a
    /// receive.
    pub(crate) fn report_rx_completion(&mut self, ope_id: OpeId) {
        let (truncated, cancelled, flags) = {
            let ope = self.opes.get(ope_id).expect("ope");
            (
                ope.total_len > ope.cq.len,
                ope.has_flag(OPE_CANCELLED),
                ope.cq.flags,
            )
        };

        if cancelled || truncated {
            let ope = self.opes.get_mut(ope_id).expect("ope");
            if ope.has_flag(OPE_NO_COMPLETION) || ope.has_flag(OPE_ERRORED) {
                return;
            }
            let err = if cancelled {
                RdmError::Cancelled
            } else {
                RdmError::Truncated
            };
            if truncated {
                warn!(
                    incoming = ope.total_len,
                    buffer = ope.cq.len,
                    "message truncated"
                );
            }
            let entry = CqErrEntry {
                context: ope.cq.context,
                flags: ope.cq.flags,
                len: ope.cq.len,
                olen: ope.total_len,
                buf: std::mem::take(&mut ope.iov),
                data: ope.cq.data,
                tag: ope.cq.tag,
                err,
            };
            // Suppress any second report for this entry.
            ope.set_flag(OPE_NO_COMPLETION);
            if self.rx_cq.push_err(entry).is_err() {
                self.write_event(RdmError::OutOfResources, false, "rx cq overflow");
            }
            self.bump_counter(flags, true, false);
            return;
        }

        let multi_recv_final = flags.has(CQ_MULTI_RECV);
        if self.should_write_completion(ope_id) || multi_recv_final {
            let ope = self.opes.get_mut(ope_id).expect("ope");
            let entry = CqEntry {
                context: ope.cq.context,
                flags: ope.cq.flags,
                len: ope.cq.len,
                buf: std::mem::take(&mut ope.iov),
                data: ope.cq.data,
                tag: ope.cq.tag,
                src_addr: ope.addr,
            };
            ope.set_flag(OPE_NO_COMPLETION);
            debug!(ope = %ope_id, "recv completion");
            if self.rx_cq.push_ok(entry).is_err() {
                self.write_event(RdmError::OutOfResources, false, "rx cq overflow");
                return;
            }
        }
        self.bump_counter(flags, false, false);
    }

    /// All data of a sending operation is accounted for.
    pub(crate) fn handle_send_completed(&mut self, ope_id: OpeId) {
        let Some(ope) = self.opes.get_mut(ope_id) else {
            return;
        };
        let was_longcts = ope.has_flag(OPE_LONGCTS_SENDING);
        ope.clear_flag(OPE_LONGCTS_SENDING);
        let (ty, flags) = (ope.ty, ope.cq.flags);
        if was_longcts {
            self.ope_longcts_send.retain(|&id| id != ope_id);
        }
        if ty == OpeType::Rx {
            // Responder side of an emulated read; nothing to report.
            debug_assert!(flags.has(CQ_READ));
            self.release_rxe(ope_id);
            return;
        }
        self.report_tx_completion(ope_id);
        self.release_txe(ope_id);
    }

    /// All data of a receiving operation has arrived.
    pub(crate) fn handle_recv_completed(&mut self, ope_id: OpeId) {
        let (ty, kind) = {
            let Some(ope) = self.opes.get(ope_id) else {
                return;
            };
            (ope.ty, ope.kind)
        };

        if ty == OpeType::Rx && kind == OpKind::Write {
            // Target side of an emulated write.
            let (cq_data, total, dc, eor) = {
                let ope = self.opes.get(ope_id).expect("ope");
                (
                    ope.cq.data,
                    ope.total_len,
                    ope.has_flag(OPE_DELIVERY_COMPLETE_REQUESTED),
                    ope.has_flag(OPE_EOR_IN_FLIGHT),
                )
            };
            if cq_data.is_some() {
                self.write_remote_write_completion(cq_data, total);
            }
            if dc {
                if let Err(err) = self.post_or_queue_ctrl(ope_id, PacketType::Receipt) {
                    self.rxe_handle_error(ope_id, err);
                    self.release_rxe(ope_id);
                }
                return;
            }
            if eor {
                return;
            }
            self.release_rxe(ope_id);
            return;
        }

        if ty == OpeType::Tx {
            // Read requester: the "receive" side of a read.
            self.report_tx_completion(ope_id);
            self.release_txe(ope_id);
            return;
        }

        if self
            .opes
            .get(ope_id)
            .is_some_and(|o| o.has_flag(OPE_MULTI_RECV_CONSUMER))
        {
            let buffer_released = self.multi_recv_consumer_done(ope_id);
            if buffer_released {
                let ope = self.opes.get_mut(ope_id).expect("ope");
                ope.cq.flags = ope.cq.flags.with(CQ_MULTI_RECV);
            }
        }

        self.report_rx_completion(ope_id);

        // Completion first, acknowledgment second: posting the receipt can
        // release the entry from under us otherwise.
        if self
            .opes
            .get(ope_id)
            .is_some_and(|o| o.has_flag(OPE_DELIVERY_COMPLETE_REQUESTED))
        {
            if let Err(err) = self.post_or_queue_ctrl(ope_id, PacketType::Receipt) {
                warn!(?err, "failed to post receipt");
                self.rxe_handle_error(ope_id, err);
                self.release_rxe(ope_id);
            }
            return;
        }

        if self
            .opes
            .get(ope_id)
            .is_some_and(|o| o.has_flag(OPE_EOR_IN_FLIGHT))
        {
            return;
        }
        self.release_rxe(ope_id);
    }

    /// Report a failed TX operation. The entry itself stays alive; late
    /// completions for it may still arrive.
    pub(crate) fn txe_handle_error(&mut self, ope_id: OpeId, err: RdmError) {
        let Some(ope) = self.opes.get_mut(ope_id) else {
            return;
        };
        if ope.has_flag(OPE_ERRORED) {
            return;
        }
        let entry = CqErrEntry {
            context: ope.cq.context,
            flags: ope.cq.flags,
            len: 0,
            olen: 0,
            buf: std::mem::take(&mut ope.iov),
            data: ope.cq.data,
            tag: ope.cq.tag,
            err,
        };
        let flags = ope.cq.flags;
        ope.set_flag(OPE_ERRORED);
        self.detach_from_work_queues(ope_id);
        warn!(ope = %ope_id, ?err, "tx operation failed");
        if self.tx_cq.push_err(entry).is_err() {
            self.write_event(err, false, "tx cq overflow on error");
        }
        self.bump_counter(flags, true, true);
    }

    /// Report a failed RX operation.
    pub(crate) fn rxe_handle_error(&mut self, ope_id: OpeId, err: RdmError) {
        let Some(ope) = self.opes.get_mut(ope_id) else {
            return;
        };
        if ope.has_flag(OPE_ERRORED) {
            return;
        }
        let entry = CqErrEntry {
            context: ope.cq.context,
            flags: ope.cq.flags,
            len: 0,
            olen: ope.total_len,
            buf: std::mem::take(&mut ope.iov),
            data: ope.cq.data,
            tag: ope.cq.tag,
            err,
        };
        let flags = ope.cq.flags;
        ope.set_flag(OPE_ERRORED);
        if let Some(pkt) = ope.unexp_pkt.take() {
            self.pkts.release(pkt);
        }
        self.detach_from_work_queues(ope_id);
        warn!(ope = %ope_id, ?err, "rx operation failed");
        if self.rx_cq.push_err(entry).is_err() {
            self.write_event(err, false, "rx cq overflow on error");
        }
        self.bump_counter(flags, true, false);
    }

    fn detach_from_work_queues(&mut self, ope_id: OpeId) {
        let Some(ope) = self.opes.get_mut(ope_id) else {
            return;
        };
        let queued: Vec<crate::pool::PktId> = ope.queued_pkts.drain(..).collect();
        let had_rnr = ope.has_flag(OPE_QUEUED_RNR);
        let had_ctrl = ope.has_flag(OPE_QUEUED_CTRL);
        let had_read = ope.has_flag(OPE_QUEUED_READ);
        let had_longcts = ope.has_flag(OPE_LONGCTS_SENDING);
        ope.clear_flag(OPE_QUEUED_RNR);
        ope.clear_flag(OPE_QUEUED_CTRL);
        ope.clear_flag(OPE_QUEUED_READ);
        ope.clear_flag(OPE_LONGCTS_SENDING);
        for pkt in queued {
            self.pkts.release(pkt);
        }
        if had_rnr {
            self.ope_queued_rnr.retain(|&id| id != ope_id);
        }
        if had_ctrl {
            self.ope_queued_ctrl.retain(|&id| id != ope_id);
        }
        if had_read {
            self.ope_queued_read.retain(|&id| id != ope_id);
        }
        if had_longcts {
            self.ope_longcts_send.retain(|&id| id != ope_id);
        }
    }

    pub(crate) fn release_txe(&mut self, ope_id: OpeId) {
        self.release_common(ope_id);
    }

    pub(crate) fn release_rxe(&mut self, ope_id: OpeId) {
        self.release_common(ope_id);
    }

    fn release_common(&mut self, ope_id: OpeId) {
        let Some(ope) = self.opes.get(ope_id) else {
            return;
        };
        let addr = ope.addr;
        let ty = ope.ty;
        let state = ope.state;
        let tagged = ope.kind == OpKind::Tagged;
        let keys: Vec<u64> = ope.registered_keys.iter().copied().collect();
        for key in keys {
            self.domain.deregister(key);
        }
        self.detach_from_work_queues(ope_id);
        {
            let ope = self.opes.get_mut(ope_id).expect("ope");
            let unexp = ope.unexp_pkt.take();
            let frags: Vec<crate::pool::PktId> = ope.unexp_frags.drain(..).collect();
            if let Some(pkt) = unexp {
                self.pkts.release(pkt);
            }
            for pkt in frags {
                self.pkts.release(pkt);
            }
        }
        {
            let ope = self.opes.get_mut(ope_id).expect("ope");
            if let Some(pkt) = ope.local_read_pkt.take() {
                self.pkts.release(pkt);
            }
        }
        if state == OpeState::RxUnexp {
            let list = if tagged {
                &mut self.rx_unexp_tagged_list
            } else {
                &mut self.rx_unexp_list
            };
            list.retain(|&id| id != ope_id);
        }
        if state == OpeState::RxInit {
            let list = if tagged {
                &mut self.rx_tagged_list
            } else {
                &mut self.rx_list
            };
            list.retain(|&id| id != ope_id);
        }
        if let Some(addr) = addr {
            if let Some(peer) = self.peers.get_mut(addr) {
                if ty == OpeType::Tx {
                    peer.txe_list.retain(|&id| id != ope_id);
                } else {
                    peer.rxe_list.retain(|&id| id != ope_id);
                    peer.unexp_list.retain(|&id| id != ope_id);
                    peer.unexp_tagged_list.retain(|&id| id != ope_id);
                    peer.mulreq_rxe.retain(|_, &mut id| id != ope_id);
                }
            }
        }
        self.opes.release(ope_id);
    }
}
