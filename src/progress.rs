//! The progress engine.
//!
//! Runs on every user API entry and on explicit calls. One pass drains a
//! bounded number of device completions, replenishes receive buffers,
//! expires backoff, and services every queued-work list. It never
//! blocks, sleeps or yields.

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{RdmError, RdmResult};
use crate::nic::{NicCompletion, NicRecvMeta, RecvPostError};
use crate::ope::{OPE_QUEUED_CTRL, OPE_QUEUED_READ, OPE_QUEUED_RNR, OpeType};
use crate::peer::{PEER_HANDSHAKE_QUEUED, PEER_HANDSHAKE_RECEIVED, PEER_IN_BACKOFF};
use crate::pkt::{PacketType, parse_frame};
use crate::pool::{PktId, PoolKind};

impl Endpoint {
    /// Drive the endpoint forward. Bounded work per call: at most
    /// `cq_read_size` device completions are consumed so a caller is
    /// never starved.
    pub fn progress(&mut self) {
        self.poll_device_cq(self.cfg.cq_read_size);
        self.replenish_rx_pkts();
        self.check_peer_backoff();
        self.flush_queued_handshakes();
        self.flush_queued_rnr();
        self.flush_queued_ctrl();
        self.drain_longcts_data();
        self.drain_queued_reads();
        if self.more_batch_open {
            if self.nic.flush().is_err() {
                self.write_event(RdmError::TryAgain, false, "device batch flush failed");
            }
            self.more_batch_open = false;
        }
    }

    fn poll_device_cq(&mut self, budget: usize) {
        for _ in 0..budget {
            let Some(completion) = self.nic.poll_cq() else {
                break;
            };
            match completion {
                NicCompletion::SendOk { wr_id } => {
                    self.handle_send_completion(PktId(wr_id as u32));
                }
                NicCompletion::RecvOk {
                    wr_id,
                    buf,
                    len,
                    meta,
                } => {
                    let pkt_id = PktId(wr_id as u32);
                    self.pkts.put_buf(pkt_id, buf, len);
                    self.resolve_rx_source(pkt_id, meta);
                    self.handle_recv_completion(pkt_id);
                }
                NicCompletion::ReadOk { wr_id, data } => {
                    self.handle_read_completion(PktId(wr_id as u32), data);
                }
                NicCompletion::WriteOk { wr_id } => {
                    self.handle_write_completion(PktId(wr_id as u32));
                }
                NicCompletion::RecvRdmaImm {
                    wr_id, buf, imm, ..
                } => {
                    let pkt_id = PktId(wr_id as u32);
                    self.pkts.put_buf(pkt_id, buf, 0);
                    self.handle_recv_imm_completion(pkt_id, imm);
                }
                NicCompletion::SendErr { wr_id, err } => {
                    self.handle_send_error(PktId(wr_id as u32), err);
                }
                NicCompletion::RecvErr { wr_id, buf, err } => {
                    let pkt_id = PktId(wr_id as u32);
                    self.pkts.put_buf(pkt_id, buf, 0);
                    self.handle_recv_failure(pkt_id, err);
                }
            }
        }
    }

    /// Figure out who sent a frame: reverse-lookup by completion source,
    /// falling back to the raw address some REQ headers carry.
    fn resolve_rx_source(&mut self, pkt_id: PktId, meta: NicRecvMeta) {
        let (connid, raw) = match parse_frame(self.pkts.entry(pkt_id).frame()) {
            Ok(parsed) => (
                parsed
                    .opt
                    .connid
                    .or(parsed.opt.raw_addr.as_ref().map(|r| r.connid)),
                parsed.opt.raw_addr,
            ),
            Err(_) => (None, None),
        };
        let mut addr = self
            .av
            .reverse_lookup(meta.src_qpn, meta.src_locator, connid);
        if addr.is_none() {
            if let Some(raw) = raw {
                addr = self.av.insert(&raw).ok();
            }
        }
        if let Some(addr) = addr {
            if self.ensure_peer(addr).is_err() {
                self.pkts.entry_mut(pkt_id).addr = None;
                return;
            }
        }
        self.pkts.entry_mut(pkt_id).addr = addr;
    }

    /// Keep receive buffers posted. In zero-copy mode exactly one
    /// internal buffer stays posted so handshakes and CTS can always
    /// land without consuming a user buffer.
    fn replenish_rx_pkts(&mut self) {
        if self.cfg.use_zcpy_rx {
            if self.rx_pkts_posted == 0 {
                let _ = self.post_one_rx_pkt();
            }
            return;
        }
        if self.pkts.is_unallocated(PoolKind::DeviceRx) {
            // First tick on this endpoint: force the initial chunk of
            // every receive-side pool, so co-located processes pay their
            // allocation spikes at the same time instead of serially.
            if let Err(err) = self.grow_rx_pools() {
                self.write_event(err, false, "rx pool allocation failed");
                return;
            }
        }
        let target = self.cfg.rx_size;
        while self.rx_pkts_posted < target {
            if self.post_one_rx_pkt().is_err() {
                break;
            }
        }
    }

    pub(crate) fn grow_rx_pools(&mut self) -> RdmResult<()> {
        for kind in [
            PoolKind::DeviceRx,
            PoolKind::Unexpected,
            PoolKind::OutOfOrder,
            PoolKind::ReadCopy,
        ] {
            if self.pkts.is_unallocated(kind) {
                self.pkts.grow(kind)?;
            }
        }
        Ok(())
    }

    fn post_one_rx_pkt(&mut self) -> RdmResult<()> {
        let pkt_id = self
            .pkts
            .alloc(PoolKind::DeviceRx)
            .ok_or(RdmError::OutOfResources)?;
        let buf = self.pkts.take_buf(pkt_id);
        match self.nic.post_recv(pkt_id.0 as u64, buf) {
            Ok(()) => {
                self.rx_pkts_posted += 1;
                Ok(())
            }
            Err(RecvPostError::QueueFull(buf)) => {
                self.pkts.put_buf(pkt_id, buf, 0);
                self.pkts.release(pkt_id);
                Err(RdmError::TryAgain)
            }
        }
    }

    fn check_peer_backoff(&mut self) {
        if self.peers.backoff_list.is_empty() {
            return;
        }
        let now = self.time.now_micros();
        let entries = std::mem::take(&mut self.peers.backoff_list);
        for addr in entries {
            let Some(peer) = self.peers.get_mut(addr) else {
                continue;
            };
            if peer.backoff_expired(now) {
                peer.clear_flag(PEER_IN_BACKOFF);
                debug!(peer = %addr, "peer left rnr backoff");
            } else {
                self.peers.backoff_list.push(addr);
            }
        }
    }

    /// Resend handshakes whose first post failed.
    fn flush_queued_handshakes(&mut self) {
        let count = self.peers.handshake_queue.len();
        for _ in 0..count {
            let Some(addr) = self.peers.handshake_queue.pop_front() else {
                break;
            };
            let Some(peer) = self.peers.get(addr) else {
                continue;
            };
            if peer.has_flag(PEER_IN_BACKOFF) {
                self.peers.handshake_queue.push_back(addr);
                continue;
            }
            match self.post_handshake(addr) {
                Ok(()) => {
                    self.peers
                        .get_mut(addr)
                        .expect("peer")
                        .clear_flag(PEER_HANDSHAKE_QUEUED);
                }
                Err(RdmError::TryAgain) => {
                    self.peers.handshake_queue.push_back(addr);
                    break;
                }
                Err(err) => {
                    self.peers
                        .get_mut(addr)
                        .expect("peer")
                        .clear_flag(PEER_HANDSHAKE_QUEUED);
                    self.write_event(err, false, "handshake retry failed");
                }
            }
        }
    }

    /// Resend packets parked by RNR, skipping peers still in backoff.
    fn flush_queued_rnr(&mut self) {
        let list: Vec<_> = self.ope_queued_rnr.clone();
        for ope_id in list {
            let Some(ope) = self.opes.get(ope_id) else {
                self.ope_queued_rnr.retain(|&id| id != ope_id);
                continue;
            };
            let ty = ope.ty;
            let in_backoff = ope
                .addr
                .and_then(|a| self.peers.get(a))
                .is_some_and(|p| p.has_flag(PEER_IN_BACKOFF));
            if in_backoff {
                continue;
            }
            match self.send_queued_pkts(ope_id) {
                Ok(()) => {
                    self.opes
                        .get_mut(ope_id)
                        .expect("ope")
                        .clear_flag(OPE_QUEUED_RNR);
                    self.ope_queued_rnr.retain(|&id| id != ope_id);
                }
                Err(RdmError::TryAgain) => break,
                Err(err) => {
                    if ty == OpeType::Rx {
                        self.rxe_handle_error(ope_id, err);
                    } else {
                        self.txe_handle_error(ope_id, err);
                    }
                    return;
                }
            }
        }
    }

    /// Post control packets whose first attempt ran out of resources.
    fn flush_queued_ctrl(&mut self) {
        let list: Vec<_> = self.ope_queued_ctrl.clone();
        for ope_id in list {
            let Some(ope) = self.opes.get(ope_id) else {
                // The entry released itself during an earlier retry.
                self.ope_queued_ctrl.retain(|&id| id != ope_id);
                continue;
            };
            let ty = ope.ty;
            let Some(ptype) = ope.queued_ctrl_type else {
                self.ope_queued_ctrl.retain(|&id| id != ope_id);
                continue;
            };
            let in_backoff = ope
                .addr
                .and_then(|a| self.peers.get(a))
                .is_some_and(|p| p.has_flag(PEER_IN_BACKOFF));
            if in_backoff {
                continue;
            }
            match self.post_pkts(ope_id, ptype) {
                Ok(()) => {
                    if let Some(ope) = self.opes.get_mut(ope_id) {
                        ope.clear_flag(OPE_QUEUED_CTRL);
                        ope.queued_ctrl_type = None;
                    }
                    self.ope_queued_ctrl.retain(|&id| id != ope_id);
                }
                Err(RdmError::TryAgain) => break,
                Err(err) => {
                    if ty == OpeType::Rx {
                        self.rxe_handle_error(ope_id, err);
                    } else {
                        self.txe_handle_error(ope_id, err);
                    }
                    return;
                }
            }
        }
    }

    /// Stream DATA for every windowed sender, within the device budget.
    /// DATA never goes out before the peer's handshake arrived: its
    /// optional subheaders would be ambiguous to an older peer.
    fn drain_longcts_data(&mut self) {
        let list: Vec<_> = self.ope_longcts_send.clone();
        for ope_id in list {
            loop {
                let Some(ope) = self.opes.get(ope_id) else {
                    self.ope_longcts_send.retain(|&id| id != ope_id);
                    break;
                };
                if ope.window == 0 || ope.bytes_sent >= ope.total_len {
                    break;
                }
                let Some(addr) = ope.addr else {
                    break;
                };
                let Some(peer) = self.peers.get(addr) else {
                    break;
                };
                if peer.has_flag(PEER_IN_BACKOFF) || !peer.has_flag(PEER_HANDSHAKE_RECEIVED) {
                    break;
                }
                let budget = self.tx_budget_available();
                if budget == 0 {
                    return;
                }
                let remaining_after = {
                    let ope = self.opes.get(ope_id).expect("ope");
                    let room = (self.cfg.mtu_size - crate::pkt::DATA_HDR_SIZE) as u64;
                    let payload = room.min(ope.window).min(ope.total_len - ope.bytes_sent);
                    (ope.window - payload).min(ope.total_len - ope.bytes_sent - payload)
                };
                let more = remaining_after > 0 && budget > 1;
                match self.post_pkt_one(ope_id, PacketType::Data, more) {
                    Ok(()) => {}
                    Err(RdmError::TryAgain) => return,
                    Err(err) => {
                        self.txe_handle_error(ope_id, err);
                        return;
                    }
                }
            }
        }
    }

    /// Drain queued one-sided reads under the same device budget.
    fn drain_queued_reads(&mut self) {
        let list: Vec<_> = self.ope_queued_read.clone();
        for ope_id in list {
            let Some(ope) = self.opes.get(ope_id) else {
                self.ope_queued_read.retain(|&id| id != ope_id);
                continue;
            };
            let ty = ope.ty;
            // A missing peer is fine here: local reads have no peer.
            let in_backoff = ope
                .addr
                .and_then(|a| self.peers.get(a))
                .is_some_and(|p| p.has_flag(PEER_IN_BACKOFF));
            if in_backoff {
                continue;
            }
            if self.tx_budget_available() == 0 {
                return;
            }
            match self.post_read_segments(ope_id) {
                Ok(()) => {
                    if let Some(ope) = self.opes.get_mut(ope_id) {
                        ope.clear_flag(OPE_QUEUED_READ);
                    }
                    self.ope_queued_read.retain(|&id| id != ope_id);
                }
                Err(RdmError::TryAgain) => break,
                Err(err) => {
                    if ty == OpeType::Rx {
                        self.rxe_handle_error(ope_id, err);
                    } else {
                        self.txe_handle_error(ope_id, err);
                    }
                    return;
                }
            }
        }
    }
}
