//! Receive path: ordered delivery, matching, reassembly and the
//! per-packet-type receive handlers.

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::av::Addr;
use crate::cq::{CQ_REMOTE_CQ_DATA, CQ_REMOTE_WRITE, CQ_RMA, CqEntry, CqFlags};
use crate::endpoint::{Endpoint, RecvDesc};
use crate::error::{RdmError, RdmResult};
use crate::ope::{
    DataVec, OP_CLAIM, OP_DISCARD, OPE_CANCELLED, OPE_DELIVERY_COMPLETE_REQUESTED,
    OPE_MULTI_RECV_CONSUMER, OPE_MULTI_RECV_POSTED, OPE_FOR_PEER_SRX, OpFlags, OpKind, OpeId,
    OpeState, OpeType,
};
use crate::peer::{PEER_IS_LOCAL, Reorder};
use crate::pkt::{
    PROTOCOL_VERSION, PacketType, PktBody, RETIRED_CONNACK, RETIRED_RTS, RmaVec, RtmDetail,
    RtwDetail, parse_frame, peek_base,
};
use crate::pool::{PktId, PoolKind};
use crate::srx::{SrxHandle, SrxMsgInfo};

/// Owned summary of an RTM header, detached from the pool buffer.
#[derive(Debug, Clone)]
pub(crate) struct RtmView {
    pub ptype: PacketType,
    pub msg_id: u32,
    pub tag: Option<u64>,
    pub cq_data: Option<u64>,
    pub total_len: u64,
    pub seg_offset: u64,
    pub runt_length: u64,
    pub send_id: Option<u32>,
    pub source: RmaVec,
    pub payload_start: usize,
    pub payload_len: usize,
}

impl Endpoint {
    /// Entry point for every received frame, after source resolution.
    pub(crate) fn handle_recv_completion(&mut self, pkt_id: PktId) {
        let kind = self.pkts.entry(pkt_id).kind;
        if matches!(kind, PoolKind::DeviceRx | PoolKind::UserBuffer) {
            self.rx_pkts_posted = self.rx_pkts_posted.saturating_sub(1);
        }

        let base = match peek_base(self.pkts.entry(pkt_id).frame()) {
            Ok(base) => base,
            Err(_) => {
                self.write_event(RdmError::Invalid, false, "runt frame received");
                self.pkts.release(pkt_id);
                return;
            }
        };
        if base.raw_type == RETIRED_RTS || base.raw_type == RETIRED_CONNACK {
            self.write_event(RdmError::Invalid, true, "retired packet type received");
            self.failed = true;
            self.pkts.release(pkt_id);
            return;
        }
        if base.version < PROTOCOL_VERSION {
            self.write_event(
                RdmError::Invalid,
                true,
                "peer speaks an unsupported protocol version",
            );
            self.failed = true;
            self.pkts.release(pkt_id);
            return;
        }
        if PacketType::from_wire(base.raw_type).is_err() {
            self.write_event(RdmError::Invalid, false, "unknown packet type received");
            self.pkts.release(pkt_id);
            return;
        }

        let Some(addr) = self.pkts.entry(pkt_id).addr else {
            warn!("ignoring a received packet from a removed address");
            self.pkts.release(pkt_id);
            return;
        };
        if self.peers.get(addr).is_none() {
            self.pkts.release(pkt_id);
            return;
        }

        // The remote chose the device path even though it is co-located;
        // stop short-circuiting through shared memory for it.
        if self.peers.get(addr).is_some_and(|p| p.has_flag(PEER_IS_LOCAL)) {
            self.peers
                .get_mut(addr)
                .expect("peer")
                .clear_flag(PEER_IS_LOCAL);
        }

        self.post_handshake_or_queue(addr);

        if kind == PoolKind::UserBuffer {
            self.handle_zcpy_recv(pkt_id);
            return;
        }
        self.proc_received(pkt_id);
    }

    fn proc_received(&mut self, pkt_id: PktId) {
        let ptype = PacketType::from_wire(self.pkts.entry(pkt_id).frame()[1]).expect("checked");
        match ptype {
            PacketType::Handshake => self.handle_handshake_recv(pkt_id),
            PacketType::Cts => self.handle_cts_recv(pkt_id),
            PacketType::Data => self.handle_data_recv(pkt_id),
            PacketType::Readrsp => self.handle_readrsp_recv(pkt_id),
            PacketType::Eor => self.handle_eor_recv(pkt_id),
            PacketType::Receipt => self.handle_receipt_recv(pkt_id),
            PacketType::Atomrsp => self.handle_atomrsp_recv(pkt_id),
            t if t.is_rtm() || t.is_rta() => self.handle_rtm_rta_recv(pkt_id),
            t if t.is_rtw() => self.handle_rtw_recv(pkt_id),
            t if t.is_rtr() => self.handle_rtr_recv(pkt_id),
            _ => {
                self.write_event(RdmError::Invalid, false, "unhandled packet type");
                self.pkts.release(pkt_id);
            }
        }
    }

    // ---- ordered RTM/RTA delivery --------------------------------------

    fn handle_rtm_rta_recv(&mut self, pkt_id: PktId) {
        let addr = self.pkts.entry(pkt_id).addr.expect("resolved");
        let (ptype, msg_id) = {
            let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.write_event(err, false, "malformed request packet");
                    self.pkts.release(pkt_id);
                    return;
                }
            };
            let msg_id = match &parsed.body {
                PktBody::Rtm { msg_id, .. } => *msg_id,
                PktBody::Rta { msg_id, .. } => *msg_id,
                _ => unreachable!(),
            };
            (parsed.ptype, msg_id)
        };

        // A later fragment of an in-progress multi-request message.
        if ptype.is_mulreq() {
            let existing = self
                .peers
                .get(addr)
                .and_then(|p| p.mulreq_rxe.get(&msg_id).copied());
            if let Some(rxe) = existing {
                self.deliver_mulreq_fragment(rxe, pkt_id);
                return;
            }
        }

        let recvwin = self.cfg.recvwin_size as u32;
        let peer = self.peers.get_mut(addr).expect("peer");
        match peer.reorder(msg_id, recvwin) {
            Reorder::InOrder => {
                self.proc_rtm_now(pkt_id);
                self.drain_ooo(addr);
            }
            Reorder::Buffer => {
                let Some(stash) = self.pkts.clone_into(pkt_id, PoolKind::OutOfOrder) else {
                    self.write_event(
                        RdmError::OutOfResources,
                        false,
                        "out-of-order pool exhausted",
                    );
                    self.pkts.release(pkt_id);
                    return;
                };
                self.pkts.release(pkt_id);
                self.peers
                    .get_mut(addr)
                    .expect("peer")
                    .ooo_pkts
                    .entry(msg_id)
                    .or_default()
                    .push(stash);
                debug!(peer = %addr, msg_id, "buffered out-of-order request");
            }
            Reorder::Duplicate => {
                debug!(peer = %addr, msg_id, "dropping duplicate request");
                self.pkts.release(pkt_id);
            }
            Reorder::Overflow => {
                self.write_event(RdmError::OutOfResources, false, "receive window overflow");
                self.pkts.release(pkt_id);
            }
        }
    }

    fn drain_ooo(&mut self, addr: Addr) {
        loop {
            let next = {
                let Some(peer) = self.peers.get_mut(addr) else {
                    return;
                };
                let expected = peer.next_expected_msg_id;
                peer.ooo_pkts.remove(&expected)
            };
            let Some(pkts) = next else {
                return;
            };
            let mut pkts = pkts.into_iter();
            if let Some(first) = pkts.next() {
                self.proc_rtm_now(first);
            }
            // Further packets under the same id are fragments of an
            // in-progress multi-request message.
            for pkt_id in pkts {
                let msg_id = match self.rtm_view(pkt_id) {
                    Ok(view) => view.msg_id,
                    Err(_) => {
                        self.pkts.release(pkt_id);
                        continue;
                    }
                };
                let rxe = self
                    .peers
                    .get(addr)
                    .and_then(|p| p.mulreq_rxe.get(&msg_id).copied());
                match rxe {
                    Some(rxe) => self.deliver_mulreq_fragment(rxe, pkt_id),
                    None => {
                        self.pkts.release(pkt_id);
                    }
                }
            }
        }
    }

    /// Process one in-order request and advance the expected id.
    fn proc_rtm_now(&mut self, pkt_id: PktId) {
        let addr = self.pkts.entry(pkt_id).addr.expect("resolved");
        {
            let peer = self.peers.get_mut(addr).expect("peer");
            peer.next_expected_msg_id = peer.next_expected_msg_id.wrapping_add(1);
        }
        let ptype = PacketType::from_wire(self.pkts.entry(pkt_id).frame()[1]).expect("checked");
        if ptype.is_rta() {
            self.handle_rta_recv(pkt_id);
        } else {
            self.match_rtm(pkt_id);
        }
    }

    pub(crate) fn rtm_view(&self, pkt_id: PktId) -> RdmResult<RtmView> {
        let parsed = parse_frame(self.pkts.entry(pkt_id).frame())?;
        let PktBody::Rtm {
            msg_id,
            tag,
            detail,
        } = parsed.body
        else {
            return Err(RdmError::Invalid);
        };
        let payload_len = parsed.payload.end - parsed.payload.start;
        let mut view = RtmView {
            ptype: parsed.ptype,
            msg_id,
            tag,
            cq_data: parsed.opt.cq_data,
            total_len: payload_len as u64,
            seg_offset: 0,
            runt_length: 0,
            send_id: None,
            source: RmaVec::new(),
            payload_start: parsed.payload.start,
            payload_len,
        };
        match detail {
            RtmDetail::Eager { send_id } => view.send_id = send_id,
            RtmDetail::Medium {
                msg_length,
                seg_offset,
                send_id,
            } => {
                view.total_len = msg_length;
                view.seg_offset = seg_offset;
                view.send_id = send_id;
            }
            RtmDetail::LongCts {
                msg_length,
                send_id,
            } => {
                view.total_len = msg_length;
                view.send_id = Some(send_id);
            }
            RtmDetail::LongRead {
                msg_length,
                send_id,
                source,
            } => {
                view.total_len = msg_length;
                view.send_id = Some(send_id);
                view.source = source;
            }
            RtmDetail::RuntRead {
                msg_length,
                send_id,
                seg_offset,
                runt_length,
                source,
            } => {
                view.total_len = msg_length;
                view.send_id = Some(send_id);
                view.seg_offset = seg_offset;
                view.runt_length = runt_length;
                view.source = source;
            }
        }
        Ok(view)
    }

    fn match_rtm(&mut self, pkt_id: PktId) {
        let addr = self.pkts.entry(pkt_id).addr.expect("resolved");
        let view = match self.rtm_view(pkt_id) {
            Ok(view) => view,
            Err(err) => {
                self.write_event(err, false, "malformed message request");
                self.pkts.release(pkt_id);
                return;
            }
        };

        if self.srx.is_some() {
            self.srx_enqueue(pkt_id, addr, view);
            return;
        }

        let tagged = view.ptype.is_tagged();
        match self.find_posted_recv(tagged, view.tag.unwrap_or(0), addr) {
            Some(posted) => {
                let is_master = self
                    .opes
                    .get(posted)
                    .is_some_and(|o| o.has_flag(OPE_MULTI_RECV_POSTED));
                let rxe = if is_master {
                    match self.split_multi_recv(posted, view.total_len, addr) {
                        Some(consumer) => consumer,
                        None => {
                            self.stash_unexpected(pkt_id, addr, view);
                            return;
                        }
                    }
                } else {
                    self.detach_posted(posted, tagged);
                    posted
                };
                self.update_rxe_from_view(rxe, addr, &view);
                self.run_rtm_protocol(rxe, pkt_id, view);
            }
            None => self.stash_unexpected(pkt_id, addr, view),
        }
    }

    /// First-match FIFO walk of the posted receive list.
    fn find_posted_recv(&self, tagged: bool, tag: u64, addr: Addr) -> Option<OpeId> {
        let list = if tagged {
            &self.rx_tagged_list
        } else {
            &self.rx_list
        };
        for &id in list {
            let Some(ope) = self.opes.get(id) else {
                continue;
            };
            if ope.state != OpeState::RxInit {
                continue;
            }
            if let Some(expected_addr) = ope.addr {
                if expected_addr != addr {
                    continue;
                }
            }
            if tagged && (tag & !ope.ignore) != (ope.tag & !ope.ignore) {
                continue;
            }
            return Some(id);
        }
        None
    }

    fn detach_posted(&mut self, rxe: OpeId, tagged: bool) {
        let list = if tagged {
            &mut self.rx_tagged_list
        } else {
            &mut self.rx_list
        };
        if let Some(pos) = list.iter().position(|&id| id == rxe) {
            list.remove(pos);
        }
    }

    pub(crate) fn update_rxe_from_view(&mut self, rxe: OpeId, addr: Addr, view: &RtmView) {
        let buffer = self.opes.get(rxe).expect("rxe").buffer_len();
        let ope = self.opes.get_mut(rxe).expect("rxe");
        ope.state = OpeState::RxMatched;
        ope.addr = Some(addr);
        ope.msg_id = view.msg_id;
        ope.total_len = view.total_len;
        ope.remote_id = view.send_id;
        ope.cq.len = view.total_len.min(buffer);
        if let Some(tag) = view.tag {
            ope.cq.tag = tag;
            ope.tag = tag;
        }
        if let Some(cq_data) = view.cq_data {
            ope.cq.data = Some(cq_data);
            ope.cq.flags = ope.cq.flags.with(CQ_REMOTE_CQ_DATA);
        }
        if view.ptype.is_dc() {
            ope.set_flag(OPE_DELIVERY_COMPLETE_REQUESTED);
        }
    }

    /// Run the protocol machinery for a freshly matched message. Consumes
    /// the packet.
    pub(crate) fn run_rtm_protocol(&mut self, rxe: OpeId, pkt_id: PktId, view: RtmView) {
        let addr = self.pkts.entry(pkt_id).addr.expect("resolved");
        match view.ptype {
            t if t.is_eager_rtm() => {
                let copied = self.copy_frame_to_ope(
                    rxe,
                    0,
                    pkt_id,
                    view.payload_start..view.payload_start + view.payload_len,
                );
                let ope = self.opes.get_mut(rxe).expect("rxe");
                ope.bytes_received += view.payload_len as u64;
                ope.bytes_copied += copied as u64;
                self.pkts.release(pkt_id);
                self.handle_recv_completed(rxe);
            }
            t if t.is_medium() => {
                self.peers
                    .get_mut(addr)
                    .expect("peer")
                    .mulreq_rxe
                    .insert(view.msg_id, rxe);
                self.opes.get_mut(rxe).expect("rxe").state = OpeState::RxRecv;
                self.deliver_mulreq_fragment(rxe, pkt_id);
            }
            t if t.is_longcts() => {
                let grant = self.cfg.cts_window_size.min(view.total_len);
                let ope = self.opes.get_mut(rxe).expect("rxe");
                ope.state = OpeState::RxRecv;
                ope.window = grant;
                self.pkts.release(pkt_id);
                if let Err(err) = self.post_or_queue_ctrl(rxe, PacketType::Cts) {
                    self.rxe_handle_error(rxe, err);
                }
            }
            t if t.is_longread() => {
                let ope = self.opes.get_mut(rxe).expect("rxe");
                ope.state = OpeState::RxRecv;
                ope.rma_iov = view.source.clone();
                self.pkts.release(pkt_id);
                self.prepare_to_post_read(rxe);
                if let Err(err) = self.post_read_or_queue(rxe) {
                    self.rxe_handle_error(rxe, err);
                }
            }
            t if t.is_runtread() => {
                {
                    let ope = self.opes.get_mut(rxe).expect("rxe");
                    ope.state = OpeState::RxRecv;
                    ope.bytes_runt = view.runt_length;
                    ope.rma_iov = view.source.clone();
                }
                self.peers
                    .get_mut(addr)
                    .expect("peer")
                    .mulreq_rxe
                    .insert(view.msg_id, rxe);
                self.prepare_to_post_read(rxe);
                if let Err(err) = self.post_read_or_queue(rxe) {
                    self.rxe_handle_error(rxe, err);
                }
                self.deliver_mulreq_fragment(rxe, pkt_id);
            }
            _ => {
                self.pkts.release(pkt_id);
            }
        }
    }

    fn deliver_mulreq_fragment(&mut self, rxe: OpeId, pkt_id: PktId) {
        // Fragments for a still-unexpected message are stashed and
        // replayed once a buffer shows up.
        if self
            .opes
            .get(rxe)
            .is_some_and(|o| o.state == OpeState::RxUnexp)
        {
            let Some(stash) = self.pkts.clone_into(pkt_id, PoolKind::Unexpected) else {
                self.write_event(
                    RdmError::OutOfResources,
                    false,
                    "unexpected packet pool exhausted",
                );
                self.pkts.release(pkt_id);
                return;
            };
            self.pkts.release(pkt_id);
            self.opes.get_mut(rxe).expect("rxe").unexp_frags.push(stash);
            return;
        }
        let view = match self.rtm_view(pkt_id) {
            Ok(view) => view,
            Err(err) => {
                self.write_event(err, false, "malformed fragment");
                self.pkts.release(pkt_id);
                return;
            }
        };
        let copied = self.copy_frame_to_ope(
            rxe,
            view.seg_offset,
            pkt_id,
            view.payload_start..view.payload_start + view.payload_len,
        );
        self.pkts.release(pkt_id);
        let Some(ope) = self.opes.get_mut(rxe) else {
            return;
        };
        ope.bytes_received += view.payload_len as u64;
        ope.bytes_copied += copied as u64;
        if ope.bytes_received >= recv_threshold(ope) {
            if let Some(addr) = ope.addr {
                if let Some(peer) = self.peers.get_mut(addr) {
                    peer.mulreq_rxe.remove(&view.msg_id);
                }
            }
            self.handle_recv_completed(rxe);
        }
    }

    fn stash_unexpected(&mut self, pkt_id: PktId, addr: Addr, view: RtmView) {
        let Some(stash) = self.pkts.clone_into(pkt_id, PoolKind::Unexpected) else {
            self.write_event(
                RdmError::OutOfResources,
                false,
                "unexpected packet pool exhausted",
            );
            self.pkts.release(pkt_id);
            return;
        };
        self.pkts.release(pkt_id);

        let kind = if view.ptype.is_tagged() {
            OpKind::Tagged
        } else {
            OpKind::Msg
        };
        let Ok(rxe) = self.alloc_rxe(
            kind,
            Some(addr),
            DataVec::new(),
            SmallVec::new(),
            0,
            view.tag.unwrap_or(0),
            0,
            OpFlags::default(),
        ) else {
            self.write_event(RdmError::OutOfResources, false, "rx entries exhausted");
            self.pkts.release(stash);
            return;
        };
        self.update_rxe_from_view(rxe, addr, &view);
        {
            let ope = self.opes.get_mut(rxe).expect("rxe");
            ope.state = OpeState::RxUnexp;
            ope.unexp_pkt = Some(stash);
            self.pkts.entry_mut(stash).ope = Some(rxe);
        }
        if view.ptype.is_mulreq() {
            // Later fragments must find their way to this entry.
            self.peers
                .get_mut(addr)
                .expect("peer")
                .mulreq_rxe
                .insert(view.msg_id, rxe);
        }
        debug!(peer = %addr, msg_id = view.msg_id, tagged = view.ptype.is_tagged(), "queued unexpected message");
        if view.ptype.is_tagged() {
            self.rx_unexp_tagged_list.push_back(rxe);
            self.peers
                .get_mut(addr)
                .expect("peer")
                .unexp_tagged_list
                .push_back(rxe);
        } else {
            self.rx_unexp_list.push_back(rxe);
            self.peers
                .get_mut(addr)
                .expect("peer")
                .unexp_list
                .push_back(rxe);
        }
    }

    pub(crate) fn copy_frame_to_ope(
        &mut self,
        ope_id: OpeId,
        offset: u64,
        pkt_id: PktId,
        range: std::ops::Range<usize>,
    ) -> usize {
        let Endpoint { opes, pkts, .. } = self;
        let data = &pkts.entry(pkt_id).frame()[range];
        opes.get_mut(ope_id)
            .map(|ope| ope.copy_in(offset, data))
            .unwrap_or(0)
    }

    // ---- unexpected queue consumption ----------------------------------

    /// FIFO search of the unexpected queues; claiming detaches the entry
    /// from both the endpoint-wide and the per-peer list.
    pub(crate) fn find_unexp(
        &mut self,
        tagged: bool,
        tag: u64,
        ignore: u64,
        addr: Option<Addr>,
        claim: bool,
    ) -> Option<OpeId> {
        let list = if tagged {
            &self.rx_unexp_tagged_list
        } else {
            &self.rx_unexp_list
        };
        let mut found = None;
        for &id in list {
            let Some(ope) = self.opes.get(id) else {
                continue;
            };
            if ope.state != OpeState::RxUnexp {
                continue;
            }
            if let Some(want) = addr {
                if ope.addr != Some(want) {
                    continue;
                }
            }
            if tagged && (ope.tag & !ignore) != (tag & !ignore) {
                continue;
            }
            found = Some(id);
            break;
        }
        let id = found?;
        if claim {
            self.detach_unexp(id, tagged);
        }
        Some(id)
    }

    fn detach_unexp(&mut self, rxe: OpeId, tagged: bool) {
        let list = if tagged {
            &mut self.rx_unexp_tagged_list
        } else {
            &mut self.rx_unexp_list
        };
        if let Some(pos) = list.iter().position(|&id| id == rxe) {
            list.remove(pos);
        }
        if let Some(addr) = self.opes.get(rxe).and_then(|o| o.addr) {
            if let Some(peer) = self.peers.get_mut(addr) {
                let plist = if tagged {
                    &mut peer.unexp_tagged_list
                } else {
                    &mut peer.unexp_list
                };
                if let Some(pos) = plist.iter().position(|&id| id == rxe) {
                    plist.remove(pos);
                }
            }
        }
    }

    /// Complete the match of a claimed unexpected entry against a user
    /// buffer and drive it through its protocol.
    pub(crate) fn handle_unexp_match(
        &mut self,
        rxe: OpeId,
        iov: DataVec,
        context: u64,
        flags: OpFlags,
    ) {
        let pkt = {
            let ope = self.opes.get_mut(rxe).expect("claimed rxe");
            ope.iov = iov;
            ope.prefix_len = 0;
            ope.cq.context = context;
            ope.op_flags = flags;
            ope.state = OpeState::RxMatched;
            let buffer = ope.buffer_len();
            ope.cq.len = ope.total_len.min(buffer);
            ope.unexp_pkt.take()
        };
        let Some(pkt_id) = pkt else {
            // Context entries bridged to the matching service carry their
            // packet in the peer-SRX pool; anything else must have one.
            self.rxe_handle_error(rxe, RdmError::Invalid);
            return;
        };
        let view = match self.rtm_view(pkt_id) {
            Ok(view) => view,
            Err(err) => {
                self.pkts.release(pkt_id);
                self.rxe_handle_error(rxe, err);
                return;
            }
        };
        self.run_rtm_protocol(rxe, pkt_id, view);
        // Replay any fragments that arrived while unmatched.
        let frags: Vec<PktId> = self
            .opes
            .get_mut(rxe)
            .map(|o| o.unexp_frags.drain(..).collect())
            .unwrap_or_default();
        for frag in frags {
            self.deliver_mulreq_fragment(rxe, frag);
        }
    }

    // ---- generic receive posting ---------------------------------------

    pub(crate) fn generic_recv(&mut self, msg: RecvDesc, tagged: bool) -> RdmResult<()> {
        if msg.iov.len() > 4 {
            return Err(RdmError::Invalid);
        }
        if let Some(rxe) = self.find_unexp(tagged, msg.tag, msg.ignore, msg.addr, true) {
            // Adopt the caller's matching criteria before driving it.
            {
                let ope = self.opes.get_mut(rxe).expect("rxe");
                ope.ignore = msg.ignore;
            }
            self.handle_unexp_match(rxe, msg.iov, msg.context, msg.flags);
            return Ok(());
        }

        let kind = if tagged { OpKind::Tagged } else { OpKind::Msg };
        let rxe = self.alloc_rxe(
            kind,
            msg.addr,
            msg.iov,
            msg.desc,
            msg.context,
            msg.tag,
            msg.ignore,
            msg.flags,
        )?;
        if self.cfg.use_zcpy_rx && !tagged {
            return self.post_user_recv_buf(rxe);
        }
        if tagged {
            self.rx_tagged_list.push_back(rxe);
        } else {
            self.rx_list.push_back(rxe);
        }
        Ok(())
    }

    /// Zero-copy receive: hand the user buffer straight to the device.
    fn post_user_recv_buf(&mut self, rxe: OpeId) -> RdmResult<()> {
        let buf = {
            let ope = self.opes.get_mut(rxe).expect("rxe");
            if ope.iov.len() != 1 {
                return Err(RdmError::Invalid);
            }
            ope.iov.remove(0)
        };
        let len = buf.len();
        let pkt_id = self
            .pkts
            .adopt(PoolKind::UserBuffer, buf.into_boxed_slice(), len);
        self.pkts.entry_mut(pkt_id).ope = Some(rxe);
        match self.nic.post_recv(pkt_id.0 as u64, self.pkts.take_buf(pkt_id)) {
            Ok(()) => {
                self.rx_pkts_posted += 1;
                Ok(())
            }
            Err(crate::nic::RecvPostError::QueueFull(buf)) => {
                self.pkts.put_buf(pkt_id, buf, 0);
                let returned = self.pkts.release(pkt_id).expect("user buffer");
                let mut iov = DataVec::new();
                iov.push(returned.into_vec());
                self.opes.get_mut(rxe).expect("rxe").iov = iov;
                Err(RdmError::TryAgain)
            }
        }
    }

    /// An eager untagged message landed directly in a posted user buffer.
    fn handle_zcpy_recv(&mut self, pkt_id: PktId) {
        let rxe = self.pkts.entry(pkt_id).ope;
        let ptype = PacketType::from_wire(self.pkts.entry(pkt_id).frame()[1]).expect("checked");

        if ptype != PacketType::EagerMsgRtm {
            // Not a message for this buffer: process a copy through the
            // regular path and re-arm the user buffer.
            if let Some(copy) = self.pkts.clone_into(pkt_id, PoolKind::Unexpected) {
                self.pkts.entry_mut(copy).ope = None;
                self.proc_received(copy);
            } else {
                self.write_event(RdmError::OutOfResources, false, "unexpected pool exhausted");
            }
            if let Some(rxe) = rxe {
                let buf = self.pkts.take_buf(pkt_id);
                match self.nic.post_recv(pkt_id.0 as u64, buf) {
                    Ok(()) => {
                        self.rx_pkts_posted += 1;
                        return;
                    }
                    Err(crate::nic::RecvPostError::QueueFull(buf)) => {
                        self.pkts.put_buf(pkt_id, buf, 0);
                        let returned = self.pkts.release(pkt_id).expect("user buffer");
                        let mut iov = DataVec::new();
                        iov.push(returned.into_vec());
                        if let Some(ope) = self.opes.get_mut(rxe) {
                            ope.iov = iov;
                        }
                    }
                }
            } else {
                self.pkts.release(pkt_id);
            }
            return;
        }

        let Some(rxe) = rxe else {
            self.pkts.release(pkt_id);
            return;
        };
        let addr = self.pkts.entry(pkt_id).addr.expect("resolved");
        let view = match self.rtm_view(pkt_id) {
            Ok(view) => view,
            Err(err) => {
                self.pkts.release(pkt_id);
                self.rxe_handle_error(rxe, err);
                return;
            }
        };
        // Reclaim the buffer and slide the payload to its front.
        let buf = self.pkts.release(pkt_id).expect("user buffer");
        let mut data = buf.into_vec();
        data.copy_within(
            view.payload_start..view.payload_start + view.payload_len,
            0,
        );
        {
            let ope = self.opes.get_mut(rxe).expect("rxe");
            ope.iov.push(data);
            ope.prefix_len = 0;
        }
        self.update_rxe_from_view(rxe, addr, &view);
        let ope = self.opes.get_mut(rxe).expect("rxe");
        ope.bytes_received = view.payload_len as u64;
        ope.bytes_copied = view.payload_len as u64;
        self.handle_recv_completed(rxe);
    }
}

/// Bytes that must arrive before the receive side of an operation is
/// complete. Read-based protocols only pull what the buffer can hold.
pub(crate) fn recv_threshold(ope: &crate::ope::Ope) -> u64 {
    if ope.bytes_read_total > 0 || (ope.ty == OpeType::Rx && ope.bytes_runt > 0) {
        ope.bytes_runt + ope.bytes_read_total
    } else {
        ope.total_len
    }
}

impl Endpoint {
    // ---- multi-receive -------------------------------------------------

    pub(crate) fn post_multi_recv(&mut self, msg: RecvDesc) -> RdmResult<()> {
        if msg.iov.len() != 1 {
            return Err(RdmError::Invalid);
        }
        if (msg.iov[0].len() as u64) < self.cfg.min_multi_recv_size as u64 {
            return Err(RdmError::Invalid);
        }
        let addr_filter = msg.addr;
        let master = self.alloc_rxe(
            OpKind::Msg,
            msg.addr,
            msg.iov,
            msg.desc,
            msg.context,
            0,
            !0,
            msg.flags,
        )?;
        self.opes
            .get_mut(master)
            .expect("master")
            .set_flag(OPE_MULTI_RECV_POSTED);

        // Feed queued unexpected messages out of the fresh buffer first.
        while self.multi_recv_available(master) {
            let Some(unexp) = self.find_unexp(false, 0, !0, addr_filter, true) else {
                break;
            };
            let total = self.opes.get(unexp).expect("unexp").total_len;
            let carved = self.carve_multi_recv(master, total);
            {
                let context = self.opes.get(master).expect("master").cq.context;
                let flags = self.opes.get(master).expect("master").op_flags;
                let ope = self.opes.get_mut(unexp).expect("unexp");
                ope.set_flag(OPE_MULTI_RECV_CONSUMER);
                ope.master = Some(master);
                let mut iov = DataVec::new();
                iov.push(carved);
                self.opes.get_mut(master).expect("master").consumers.push(unexp);
                self.handle_unexp_match(unexp, iov, context, flags);
            }
        }

        if !self.multi_recv_available(master) {
            if self.multi_recv_complete(master) {
                self.release_rxe(master);
            }
            return Ok(());
        }
        self.rx_list.push_back(master);
        Ok(())
    }

    /// Take up to `total` bytes off the front of the master's buffer.
    fn carve_multi_recv(&mut self, master: OpeId, total: u64) -> Vec<u8> {
        let ope = self.opes.get_mut(master).expect("master");
        let buf = &mut ope.iov[0];
        let consumed = (total as usize).min(buf.len());
        let rest = buf.split_off(consumed);
        std::mem::replace(buf, rest)
    }

    /// Slice a consumer entry out of a posted multi-recv buffer for a
    /// freshly arrived message.
    fn split_multi_recv(&mut self, master: OpeId, total: u64, addr: Addr) -> Option<OpeId> {
        let (context, flags) = {
            let ope = self.opes.get(master).expect("master");
            (ope.cq.context, ope.op_flags)
        };
        let consumer = self
            .alloc_rxe(
                OpKind::Msg,
                Some(addr),
                DataVec::new(),
                SmallVec::new(),
                context,
                0,
                !0,
                flags,
            )
            .ok()?;
        let carved = self.carve_multi_recv(master, total);
        {
            let ope = self.opes.get_mut(consumer).expect("consumer");
            ope.iov.push(carved);
            ope.set_flag(OPE_MULTI_RECV_CONSUMER);
            ope.master = Some(master);
        }
        self.opes
            .get_mut(master)
            .expect("master")
            .consumers
            .push(consumer);

        if !self.multi_recv_available(master) {
            self.detach_posted(master, false);
        }
        Some(consumer)
    }

    pub(crate) fn multi_recv_available(&self, master: OpeId) -> bool {
        self.opes.get(master).is_some_and(|ope| {
            ope.iov
                .first()
                .is_some_and(|buf| buf.len() >= self.cfg.min_multi_recv_size)
        })
    }

    pub(crate) fn multi_recv_complete(&self, master: OpeId) -> bool {
        self.opes
            .get(master)
            .is_some_and(|ope| !self.multi_recv_available(master) && ope.consumers.is_empty())
    }

    /// Consumer finished: detach it and retire the master buffer once the
    /// last consumer is gone. Returns true when this completion must
    /// carry the buffer-released flag.
    pub(crate) fn multi_recv_consumer_done(&mut self, consumer: OpeId) -> bool {
        let Some(master) = self.opes.get(consumer).and_then(|o| o.master) else {
            return false;
        };
        if let Some(m) = self.opes.get_mut(master) {
            m.consumers.retain(|&c| c != consumer);
        }
        self.opes
            .get_mut(consumer)
            .expect("consumer")
            .clear_flag(OPE_MULTI_RECV_CONSUMER);
        if self.multi_recv_complete(master) {
            self.detach_posted(master, false);
            self.release_rxe(master);
            return true;
        }
        false
    }

    // ---- peek / claim / discard ----------------------------------------

    pub(crate) fn peek_trecv(&mut self, msg: RecvDesc) -> RdmResult<()> {
        self.progress();
        let claim = msg.flags.has(OP_CLAIM) || msg.flags.has(OP_DISCARD);
        let Some(rxe) = self.find_unexp(true, msg.tag, msg.ignore, msg.addr, claim) else {
            debug!(tag = msg.tag, "peek found no unexpected message");
            let err = crate::cq::CqErrEntry {
                context: msg.context,
                flags: CqFlags(crate::cq::CQ_TAGGED | crate::cq::CQ_RECV | crate::cq::CQ_MSG),
                len: 0,
                olen: 0,
                buf: msg.iov,
                data: None,
                tag: msg.tag,
                err: RdmError::NoMessage,
            };
            if self.rx_cq.push_err(err).is_err() {
                self.write_event(RdmError::OutOfResources, false, "rx cq overflow on peek");
            }
            return Ok(());
        };

        if msg.flags.has(OP_DISCARD) {
            return self.discard_unexp(rxe, msg);
        }

        let (total, tag, data, addr) = {
            let ope = self.opes.get(rxe).expect("rxe");
            (ope.total_len, ope.tag, ope.cq.data, ope.addr)
        };
        if msg.flags.has(OP_CLAIM) {
            self.claimed.insert(msg.context, rxe);
        }
        let entry = CqEntry {
            context: msg.context,
            flags: CqFlags(crate::cq::CQ_TAGGED | crate::cq::CQ_RECV),
            len: total,
            buf: msg.iov,
            data,
            tag,
            src_addr: addr,
        };
        if self.rx_cq.push_ok(entry).is_err() {
            self.write_event(RdmError::OutOfResources, false, "rx cq overflow on peek");
        }
        Ok(())
    }

    pub(crate) fn claim_trecv(&mut self, msg: RecvDesc) -> RdmResult<()> {
        let Some(rxe) = self.claimed.remove(&msg.context) else {
            return Err(RdmError::Invalid);
        };
        if msg.flags.has(OP_DISCARD) {
            return self.discard_unexp(rxe, msg);
        }
        self.handle_unexp_match(rxe, msg.iov, msg.context, msg.flags);
        Ok(())
    }

    /// Drain a discarded message into the sink and report a cancelled
    /// completion once it has fully arrived.
    fn discard_unexp(&mut self, rxe: OpeId, msg: RecvDesc) -> RdmResult<()> {
        self.opes
            .get_mut(rxe)
            .expect("rxe")
            .set_flag(OPE_CANCELLED);
        self.handle_unexp_match(rxe, DataVec::new(), msg.context, msg.flags);
        Ok(())
    }

    // ---- peer-SRX bridge -----------------------------------------------

    fn srx_enqueue(&mut self, pkt_id: PktId, addr: Addr, view: RtmView) {
        let kind = if view.ptype.is_tagged() {
            OpKind::Tagged
        } else {
            OpKind::Msg
        };
        let Ok(rxe) = self.alloc_rxe(
            kind,
            Some(addr),
            DataVec::new(),
            SmallVec::new(),
            0,
            view.tag.unwrap_or(0),
            0,
            OpFlags::default(),
        ) else {
            self.write_event(RdmError::OutOfResources, false, "rx entries exhausted");
            self.pkts.release(pkt_id);
            return;
        };
        self.update_rxe_from_view(rxe, addr, &view);
        {
            let ope = self.opes.get_mut(rxe).expect("rxe");
            ope.state = OpeState::RxUnexp;
            ope.set_flag(OPE_FOR_PEER_SRX);
        }

        let frame = self.pkts.entry(pkt_id).frame().to_vec();
        let len = frame.len();
        let ctx_pkt = self.pkts.adopt(PoolKind::PeerSrx, frame.into_boxed_slice(), len);
        {
            let entry = self.pkts.entry_mut(ctx_pkt);
            entry.ope = Some(rxe);
            entry.addr = Some(addr);
        }
        self.opes.get_mut(rxe).expect("rxe").unexp_pkt = Some(ctx_pkt);
        self.pkts.release(pkt_id);

        let info = SrxMsgInfo {
            handle: SrxHandle(rxe),
            addr,
            len: view.total_len,
            tag: view.tag,
            cq_data: view.cq_data,
        };
        // The matching service runs outside the endpoint's critical
        // section; it must come back through srx_start_msg/srx_start_tag.
        let srx = self.srx.as_mut().expect("srx configured");
        if view.ptype.is_tagged() {
            srx.queue_tag(info);
        } else {
            srx.queue_msg(info);
        }
    }

    /// The matching service starts a previously queued untagged message.
    pub fn srx_start_msg(&mut self, handle: SrxHandle, iov: DataVec, context: u64) -> RdmResult<()> {
        self.srx_start(handle, iov, context)
    }

    /// The matching service starts a previously queued tagged message.
    pub fn srx_start_tag(&mut self, handle: SrxHandle, iov: DataVec, context: u64) -> RdmResult<()> {
        self.srx_start(handle, iov, context)
    }

    fn srx_start(&mut self, handle: SrxHandle, iov: DataVec, context: u64) -> RdmResult<()> {
        let rxe = handle.0;
        let valid = self
            .opes
            .get(rxe)
            .is_some_and(|o| o.state == OpeState::RxUnexp && o.has_flag(OPE_FOR_PEER_SRX));
        if !valid {
            return Err(RdmError::Invalid);
        }
        self.handle_unexp_match(rxe, iov, context, OpFlags(crate::ope::OP_COMPLETION));
        self.progress();
        Ok(())
    }

    // ---- control packet handlers ---------------------------------------

    fn handle_handshake_recv(&mut self, pkt_id: PktId) {
        let addr = self.pkts.entry(pkt_id).addr.expect("resolved");
        let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_event(err, false, "malformed handshake");
                self.pkts.release(pkt_id);
                return;
            }
        };
        if let PktBody::Handshake {
            nextra_p3,
            features,
            host_id,
        } = parsed.body
        {
            let peer = self.peers.get_mut(addr).expect("peer");
            peer.features = Some(features);
            peer.nextra_p3 = nextra_p3;
            if let Some(host_id) = host_id {
                peer.host_id = host_id;
            }
            peer.set_flag(crate::peer::PEER_HANDSHAKE_RECEIVED);
            debug!(peer = %addr, features, "handshake received");
        }
        self.pkts.release(pkt_id);
    }

    fn handle_cts_recv(&mut self, pkt_id: PktId) {
        let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_event(err, false, "malformed cts");
                self.pkts.release(pkt_id);
                return;
            }
        };
        if let PktBody::Cts {
            send_id,
            recv_id,
            window,
        } = parsed.body
        {
            if let Some(ope_id) = self.opes.by_wire_id(send_id) {
                let ope = self.opes.get_mut(ope_id).expect("ope");
                ope.remote_id = Some(recv_id);
                ope.window = window;
                if !ope.has_flag(crate::ope::OPE_LONGCTS_SENDING) {
                    ope.set_flag(crate::ope::OPE_LONGCTS_SENDING);
                    if ope.ty == OpeType::Tx {
                        ope.state = OpeState::TxSend;
                    }
                    self.ope_longcts_send.push(ope_id);
                }
            } else {
                warn!(send_id, "cts for unknown entry");
            }
        }
        self.pkts.release(pkt_id);
    }

    fn handle_data_recv(&mut self, pkt_id: PktId) {
        let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_event(err, false, "malformed data packet");
                self.pkts.release(pkt_id);
                return;
            }
        };
        if let PktBody::Data {
            recv_id,
            seg_offset,
            seg_length,
        } = parsed.body
        {
            let payload = parsed.payload.clone();
            self.data_common(pkt_id, recv_id, None, seg_offset, seg_length, payload);
        } else {
            self.pkts.release(pkt_id);
        }
    }

    fn handle_readrsp_recv(&mut self, pkt_id: PktId) {
        let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_event(err, false, "malformed read response");
                self.pkts.release(pkt_id);
                return;
            }
        };
        if let PktBody::Readrsp {
            send_id,
            recv_id,
            seg_offset,
            seg_length,
        } = parsed.body
        {
            let payload = parsed.payload.clone();
            self.data_common(
                pkt_id,
                recv_id,
                Some(send_id),
                seg_offset,
                seg_length,
                payload,
            );
        } else {
            self.pkts.release(pkt_id);
        }
    }

    /// Shared tail of DATA and READRSP delivery.
    fn data_common(
        &mut self,
        pkt_id: PktId,
        recv_id: u32,
        send_id: Option<u32>,
        seg_offset: u64,
        seg_length: u64,
        payload: std::ops::Range<usize>,
    ) {
        let Some(ope_id) = self.opes.by_wire_id(recv_id) else {
            warn!(recv_id, "data for unknown entry");
            self.pkts.release(pkt_id);
            return;
        };
        if let Some(send_id) = send_id {
            self.opes.get_mut(ope_id).expect("ope").remote_id = Some(send_id);
        }

        let rma_target = {
            let ope = self.opes.get(ope_id).expect("ope");
            (ope.ty == OpeType::Rx && ope.kind == OpKind::Write).then(|| ope.rma_iov.clone())
        };
        if let Some(target) = rma_target {
            let data = self.pkts.entry(pkt_id).frame()[payload.clone()].to_vec();
            if let Err(err) = self.write_rma_target(&target, seg_offset, &data) {
                self.write_event(err, false, "remote write placement failed");
            }
            let ope = self.opes.get_mut(ope_id).expect("ope");
            ope.bytes_copied += data.len() as u64;
        } else {
            let copied = self.copy_frame_to_ope(ope_id, seg_offset, pkt_id, payload);
            if let Some(ope) = self.opes.get_mut(ope_id) {
                ope.bytes_copied += copied as u64;
            }
        }
        self.pkts.release(pkt_id);

        let Some(ope) = self.opes.get_mut(ope_id) else {
            return;
        };
        ope.bytes_received += seg_length;
        ope.window = ope.window.saturating_sub(seg_length);
        let threshold = recv_threshold(ope);
        let received = ope.bytes_received;
        let window = ope.window;
        if received >= threshold {
            self.handle_recv_completed(ope_id);
        } else if window == 0 {
            let grant = self.cfg.cts_window_size.min(threshold - received);
            self.opes.get_mut(ope_id).expect("ope").window = grant;
            if let Err(err) = self.post_or_queue_ctrl(ope_id, PacketType::Cts) {
                let ty = self.opes.get(ope_id).map(|o| o.ty);
                if ty == Some(OpeType::Tx) {
                    self.txe_handle_error(ope_id, err);
                } else {
                    self.rxe_handle_error(ope_id, err);
                }
            }
        }
    }

    fn handle_eor_recv(&mut self, pkt_id: PktId) {
        let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_event(err, false, "malformed eor");
                self.pkts.release(pkt_id);
                return;
            }
        };
        if let PktBody::Eor { send_id, .. } = parsed.body {
            if let Some(ope_id) = self.opes.by_wire_id(send_id) {
                let done = {
                    let ope = self.opes.get_mut(ope_id).expect("ope");
                    ope.bytes_acked += ope.total_len - ope.bytes_runt;
                    ope.bytes_acked >= ope.total_len
                };
                if done {
                    self.handle_send_completed(ope_id);
                }
            } else {
                warn!(send_id, "eor for unknown entry");
            }
        }
        self.pkts.release(pkt_id);
    }

    fn handle_receipt_recv(&mut self, pkt_id: PktId) {
        let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_event(err, false, "malformed receipt");
                self.pkts.release(pkt_id);
                return;
            }
        };
        if let PktBody::Receipt { tx_id, msg_id } = parsed.body {
            match self.opes.by_wire_id(tx_id) {
                Some(ope_id) if self.opes.get(ope_id).is_some_and(|o| o.msg_id == msg_id) => {
                    self.handle_send_completed(ope_id);
                }
                _ => warn!(tx_id, msg_id, "receipt does not match a live entry"),
            }
        }
        self.pkts.release(pkt_id);
    }

    fn handle_atomrsp_recv(&mut self, pkt_id: PktId) {
        let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.write_event(err, false, "malformed atomic response");
                self.pkts.release(pkt_id);
                return;
            }
        };
        if let PktBody::Atomrsp { recv_id } = parsed.body {
            let payload = parsed.payload.clone();
            if let Some(ope_id) = self.opes.by_wire_id(recv_id) {
                {
                    let Endpoint { opes, pkts, .. } = self;
                    let data = &pkts.entry(pkt_id).frame()[payload];
                    let ope = opes.get_mut(ope_id).expect("ope");
                    let n = data.len().min(ope.atomrsp.len());
                    ope.atomrsp[..n].copy_from_slice(&data[..n]);
                    ope.cq.len = n as u64;
                }
                self.report_tx_completion(ope_id);
                self.release_txe(ope_id);
            } else {
                warn!(recv_id, "atomic response for unknown entry");
            }
        }
        self.pkts.release(pkt_id);
    }

    // ---- one-sided request handlers ------------------------------------

    fn handle_rtw_recv(&mut self, pkt_id: PktId) {
        let addr = self.pkts.entry(pkt_id).addr.expect("resolved");
        let (target, detail, cq_data, payload, is_dc) = {
            let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.write_event(err, false, "malformed write request");
                    self.pkts.release(pkt_id);
                    return;
                }
            };
            let PktBody::Rtw { target, detail } = parsed.body else {
                self.pkts.release(pkt_id);
                return;
            };
            (
                target,
                detail,
                parsed.opt.cq_data,
                parsed.payload.clone(),
                parsed.ptype.is_dc(),
            )
        };

        match detail {
            RtwDetail::Eager { send_id } => {
                let data = self.pkts.entry(pkt_id).frame()[payload].to_vec();
                if let Err(err) = self.write_rma_target(&target, 0, &data) {
                    self.write_event(err, false, "remote write placement failed");
                }
                if cq_data.is_some() {
                    self.write_remote_write_completion(cq_data, data.len() as u64);
                }
                if let Some(send_id) = send_id.filter(|_| is_dc) {
                    self.send_rtw_receipt(addr, send_id);
                }
                self.pkts.release(pkt_id);
            }
            RtwDetail::LongCts {
                msg_length,
                send_id,
            } => {
                let Ok(rxe) = self.alloc_rxe(
                    OpKind::Write,
                    Some(addr),
                    DataVec::new(),
                    SmallVec::new(),
                    0,
                    0,
                    !0,
                    OpFlags::default(),
                ) else {
                    self.write_event(RdmError::OutOfResources, false, "rx entries exhausted");
                    self.pkts.release(pkt_id);
                    return;
                };
                {
                    let ope = self.opes.get_mut(rxe).expect("rxe");
                    ope.state = OpeState::RxRecv;
                    ope.rma_iov = target;
                    ope.total_len = msg_length;
                    ope.remote_id = Some(send_id);
                    ope.cq.data = cq_data;
                    ope.cq.flags = CqFlags(CQ_RMA | CQ_REMOTE_WRITE);
                    ope.window = self.cfg.cts_window_size.min(msg_length);
                    if is_dc {
                        ope.set_flag(OPE_DELIVERY_COMPLETE_REQUESTED);
                    }
                }
                self.pkts.release(pkt_id);
                if let Err(err) = self.post_or_queue_ctrl(rxe, PacketType::Cts) {
                    self.rxe_handle_error(rxe, err);
                }
            }
            RtwDetail::LongRead { msg_length, source } => {
                let Ok(rxe) = self.alloc_rxe(
                    OpKind::Write,
                    Some(addr),
                    DataVec::new(),
                    SmallVec::new(),
                    0,
                    0,
                    !0,
                    OpFlags::default(),
                ) else {
                    self.write_event(RdmError::OutOfResources, false, "rx entries exhausted");
                    self.pkts.release(pkt_id);
                    return;
                };
                {
                    let ope = self.opes.get_mut(rxe).expect("rxe");
                    ope.state = OpeState::RxRecv;
                    ope.rma_iov = source;
                    ope.source_iov = target;
                    ope.total_len = msg_length;
                    ope.cq.data = cq_data;
                    ope.cq.flags = CqFlags(CQ_RMA | CQ_REMOTE_WRITE);
                }
                self.pkts.release(pkt_id);
                self.prepare_to_post_read(rxe);
                if let Err(err) = self.post_read_or_queue(rxe) {
                    self.rxe_handle_error(rxe, err);
                }
            }
        }
    }

    pub(crate) fn write_remote_write_completion(&mut self, cq_data: Option<u64>, len: u64) {
        let entry = CqEntry {
            context: 0,
            flags: CqFlags(CQ_RMA | CQ_REMOTE_WRITE | CQ_REMOTE_CQ_DATA),
            len,
            buf: DataVec::new(),
            data: cq_data,
            tag: 0,
            src_addr: None,
        };
        if self.rx_cq.push_ok(entry).is_err() {
            self.write_event(
                RdmError::OutOfResources,
                false,
                "rx cq overflow on remote write",
            );
        }
        self.counters.remote_write += 1;
    }

    fn send_rtw_receipt(&mut self, addr: Addr, send_id: u32) {
        let Ok(rxe) = self.alloc_rxe(
            OpKind::Write,
            Some(addr),
            DataVec::new(),
            SmallVec::new(),
            0,
            0,
            !0,
            OpFlags::default(),
        ) else {
            return;
        };
        {
            let ope = self.opes.get_mut(rxe).expect("rxe");
            ope.state = OpeState::RxMatched;
            ope.remote_id = Some(send_id);
        }
        if let Err(err) = self.post_or_queue_ctrl(rxe, PacketType::Receipt) {
            warn!(?err, "failed to post receipt");
            self.release_rxe(rxe);
        }
    }

    fn handle_rtr_recv(&mut self, pkt_id: PktId) {
        let addr = self.pkts.entry(pkt_id).addr.expect("resolved");
        let (recv_id, window, source) = {
            let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.write_event(err, false, "malformed read request");
                    self.pkts.release(pkt_id);
                    return;
                }
            };
            let PktBody::Rtr {
                recv_id,
                window,
                source,
            } = parsed.body
            else {
                self.pkts.release(pkt_id);
                return;
            };
            (recv_id, window, source)
        };
        self.pkts.release(pkt_id);

        let total: u64 = source.iter().map(|s| s.len).sum();
        let Ok(rxe) = self.alloc_rxe(
            OpKind::Read,
            Some(addr),
            DataVec::new(),
            SmallVec::new(),
            0,
            0,
            !0,
            OpFlags::default(),
        ) else {
            self.write_event(RdmError::OutOfResources, false, "rx entries exhausted");
            return;
        };

        // Stage the requested region; responses copy straight out of it.
        let mut staged = vec![0u8; total as usize];
        let mut off = 0usize;
        for slice in &source {
            let end = off + slice.len as usize;
            if let Err(err) = self.domain.read(slice.key, slice.addr, &mut staged[off..end]) {
                self.write_event(err, false, "read request target unavailable");
                self.release_rxe(rxe);
                return;
            }
            off = end;
        }
        {
            let ope = self.opes.get_mut(rxe).expect("rxe");
            ope.state = OpeState::RxMatched;
            ope.iov.push(staged);
            ope.total_len = total;
            ope.remote_id = Some(recv_id);
            ope.window = window.unwrap_or(total).min(total);
            ope.cq.flags = CqFlags(crate::cq::CQ_READ);
        }
        if let Err(err) = self.post_or_queue_ctrl(rxe, PacketType::Readrsp) {
            self.rxe_handle_error(rxe, err);
            return;
        }
        // A windowed read keeps streaming DATA after the first response,
        // inside whatever window the requester granted.
        let more_to_send = self
            .opes
            .get(rxe)
            .is_some_and(|o| window.is_some() && o.bytes_sent < o.total_len);
        if more_to_send {
            let ope = self.opes.get_mut(rxe).expect("rxe");
            if !ope.has_flag(crate::ope::OPE_LONGCTS_SENDING) {
                ope.set_flag(crate::ope::OPE_LONGCTS_SENDING);
                self.ope_longcts_send.push(rxe);
            }
        }
    }

    fn handle_rta_recv(&mut self, pkt_id: PktId) {
        let addr = self.pkts.entry(pkt_id).addr.expect("resolved");
        let ptype = PacketType::from_wire(self.pkts.entry(pkt_id).frame()[1]).expect("checked");
        let (msg_id, op, dtype, target, recv_id, send_id, payload) = {
            let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.write_event(err, false, "malformed atomic request");
                    self.pkts.release(pkt_id);
                    return;
                }
            };
            let PktBody::Rta {
                msg_id,
                op,
                dtype,
                target,
                recv_id,
                send_id,
            } = parsed.body
            else {
                self.pkts.release(pkt_id);
                return;
            };
            let payload = self.pkts.entry(pkt_id).frame()[parsed.payload.clone()].to_vec();
            (msg_id, op, dtype, target, recv_id, send_id, payload)
        };
        self.pkts.release(pkt_id);

        match ptype {
            PacketType::WriteRta | PacketType::DcWriteRta => {
                if let Err(err) = self.apply_atomic(&target, op, dtype, &payload, None, None) {
                    self.write_event(err, false, "atomic write failed");
                    return;
                }
                if let Some(send_id) = send_id {
                    let Ok(rxe) = self.alloc_rxe(
                        OpKind::AtomicWrite,
                        Some(addr),
                        DataVec::new(),
                        SmallVec::new(),
                        0,
                        0,
                        !0,
                        OpFlags::default(),
                    ) else {
                        return;
                    };
                    {
                        let ope = self.opes.get_mut(rxe).expect("rxe");
                        ope.state = OpeState::RxMatched;
                        ope.remote_id = Some(send_id);
                        ope.msg_id = msg_id;
                    }
                    if let Err(err) = self.post_or_queue_ctrl(rxe, PacketType::Receipt) {
                        warn!(?err, "failed to post atomic receipt");
                        self.release_rxe(rxe);
                    }
                }
            }
            PacketType::FetchRta | PacketType::CompareRta => {
                let (operand, compare) = if ptype == PacketType::CompareRta {
                    let half = payload.len() / 2;
                    (payload[..half].to_vec(), Some(payload[half..].to_vec()))
                } else {
                    (payload, None)
                };
                let mut old = vec![0u8; operand.len()];
                if let Err(err) = self.apply_atomic(
                    &target,
                    op,
                    dtype,
                    &operand,
                    compare.as_deref(),
                    Some(&mut old),
                ) {
                    self.write_event(err, false, "atomic fetch failed");
                    return;
                }
                let Ok(rxe) = self.alloc_rxe(
                    OpKind::AtomicFetch,
                    Some(addr),
                    DataVec::new(),
                    SmallVec::new(),
                    0,
                    0,
                    !0,
                    OpFlags::default(),
                ) else {
                    self.write_event(RdmError::OutOfResources, false, "rx entries exhausted");
                    return;
                };
                {
                    let ope = self.opes.get_mut(rxe).expect("rxe");
                    ope.state = OpeState::RxMatched;
                    ope.remote_id = recv_id;
                    ope.msg_id = msg_id;
                    ope.atomrsp = old;
                }
                if let Err(err) = self.post_or_queue_ctrl(rxe, PacketType::Atomrsp) {
                    self.rxe_handle_error(rxe, err);
                }
            }
            _ => {}
        }
    }

    /// Apply an atomic operator across the target vector, slice by slice.
    fn apply_atomic(
        &mut self,
        target: &RmaVec,
        op: u32,
        dtype: u32,
        operand: &[u8],
        compare: Option<&[u8]>,
        mut old_out: Option<&mut [u8]>,
    ) -> RdmResult<()> {
        let mut pos = 0usize;
        for slice in target {
            let len = (slice.len as usize).min(operand.len() - pos);
            if len == 0 {
                break;
            }
            let amo = self.amo.clone();
            let src = &operand[pos..pos + len];
            let cmp = compare.map(|c| c[pos..pos + len].to_vec());
            let mut old_chunk = old_out.as_deref_mut().map(|o| &mut o[pos..pos + len]);
            self.domain
                .with_mut(slice.key, slice.addr, len, &mut |dst| {
                    match (&cmp, &mut old_chunk) {
                        (Some(cmp), Some(old)) => amo.compare(op, dtype, dst, src, cmp, old),
                        (None, Some(old)) => amo.fetch(op, dtype, dst, src, old),
                        (None, None) => amo.write(op, dtype, dst, src),
                        (Some(_), None) => Err(RdmError::Invalid),
                    }
                })?;
            pos += len;
        }
        Ok(())
    }

    /// Scatter received bytes into the local registered target region.
    pub(crate) fn write_rma_target(
        &mut self,
        target: &RmaVec,
        offset: u64,
        data: &[u8],
    ) -> RdmResult<()> {
        let mut pos = 0usize;
        let mut offset = offset;
        while pos < data.len() {
            let (idx, off) = crate::tx::locate_rma(target, offset).ok_or(RdmError::Invalid)?;
            let slice = target[idx];
            let take = ((slice.len - off) as usize).min(data.len() - pos);
            self.domain
                .write(slice.key, slice.addr + off, &data[pos..pos + take])?;
            pos += take;
            offset += take as u64;
        }
        Ok(())
    }

    // ---- one-sided completion handlers ---------------------------------

    /// A one-sided read finished; place the fetched bytes.
    pub(crate) fn handle_read_completion(&mut self, pkt_id: PktId, data: Box<[u8]>) {
        self.record_tx_op_completed(pkt_id);
        let (ope_id, offset) = {
            let entry = self.pkts.entry(pkt_id);
            (entry.ope, entry.rma_offset)
        };
        self.pkts.release(pkt_id);
        let Some(ope_id) = ope_id else {
            return;
        };
        if self.opes.get(ope_id).is_none() {
            return;
        }

        let writes_into_region = {
            let ope = self.opes.get(ope_id).expect("ope");
            ope.ty == OpeType::Rx && ope.kind == OpKind::Write
        };
        if writes_into_region {
            let target = self.opes.get(ope_id).expect("ope").source_iov.clone();
            if let Err(err) = self.write_rma_target(&target, offset, &data) {
                self.write_event(err, false, "read placement failed");
            }
            let ope = self.opes.get_mut(ope_id).expect("ope");
            ope.bytes_copied += data.len() as u64;
        } else {
            let copied = self
                .opes
                .get_mut(ope_id)
                .expect("ope")
                .copy_in(offset, &data);
            self.opes.get_mut(ope_id).expect("ope").bytes_copied += copied as u64;
        }

        let (reads_done, is_rx, received, threshold) = {
            let ope = self.opes.get_mut(ope_id).expect("ope");
            ope.bytes_read_completed += data.len() as u64;
            ope.bytes_received += data.len() as u64;
            (
                ope.bytes_read_completed >= ope.bytes_read_total,
                ope.ty == OpeType::Rx,
                ope.bytes_received,
                recv_threshold(ope),
            )
        };

        if reads_done && is_rx {
            // The message data now lives here; tell the sender its part
            // is over. The entry lives on until the EOR send completes.
            let already = self
                .opes
                .get(ope_id)
                .expect("ope")
                .has_flag(crate::ope::OPE_EOR_IN_FLIGHT);
            if !already {
                self.opes
                    .get_mut(ope_id)
                    .expect("ope")
                    .set_flag(crate::ope::OPE_EOR_IN_FLIGHT);
                if let Err(err) = self.post_or_queue_ctrl(ope_id, PacketType::Eor) {
                    self.rxe_handle_error(ope_id, err);
                    return;
                }
            }
        }
        if reads_done && received >= threshold {
            self.handle_recv_completed(ope_id);
        }
    }

    /// A one-sided write work request finished.
    pub(crate) fn handle_write_completion(&mut self, pkt_id: PktId) {
        self.record_tx_op_completed(pkt_id);
        let (ope_id, len) = {
            let entry = self.pkts.entry(pkt_id);
            (entry.ope, entry.len as u64)
        };
        self.pkts.release(pkt_id);
        let Some(ope_id) = ope_id else {
            return;
        };
        let done = {
            let Some(ope) = self.opes.get_mut(ope_id) else {
                return;
            };
            ope.bytes_write_completed += len;
            ope.bytes_write_completed >= ope.bytes_write_total
        };
        if done {
            self.handle_send_completed(ope_id);
        }
    }

    /// The remote wrote into local memory with immediate data: surface a
    /// synthetic remote-write completion. The consumed receive buffer is
    /// already back in the pool entry.
    pub(crate) fn handle_recv_imm_completion(&mut self, pkt_id: PktId, imm: u32) {
        let kind = self.pkts.entry(pkt_id).kind;
        if matches!(kind, PoolKind::DeviceRx | PoolKind::UserBuffer) {
            self.rx_pkts_posted = self.rx_pkts_posted.saturating_sub(1);
        }
        self.write_remote_write_completion(Some(imm as u64), 0);
        self.pkts.release(pkt_id);
    }

    /// A posted receive failed.
    pub(crate) fn handle_recv_failure(&mut self, pkt_id: PktId, err: crate::nic::NicErrorKind) {
        let kind = self.pkts.entry(pkt_id).kind;
        if matches!(kind, PoolKind::DeviceRx | PoolKind::UserBuffer) {
            self.rx_pkts_posted = self.rx_pkts_posted.saturating_sub(1);
        }
        let ope_id = self.pkts.entry(pkt_id).ope;
        match ope_id {
            Some(ope_id) if self.opes.get(ope_id).is_some() => {
                let rdm_err = crate::tx::nic_err_to_rdm(err);
                let ty = self.opes.get(ope_id).expect("ope").ty;
                if ty == OpeType::Rx {
                    self.rxe_handle_error(ope_id, rdm_err);
                } else {
                    self.txe_handle_error(ope_id, rdm_err);
                }
            }
            _ => {
                self.write_event(
                    crate::tx::nic_err_to_rdm(err),
                    false,
                    "receive completion error",
                );
            }
        }
        self.pkts.release(pkt_id);
    }
}
