//! Send path: packet construction, posting, batching, RNR handling and
//! send-completion accounting.

use tracing::{debug, warn};

use crate::av::Addr;
use crate::env::MemIface;
use crate::error::{RdmError, RdmResult};
use crate::nic::{NicErrorKind, RemoteSlice};
use crate::endpoint::Endpoint;
use crate::ope::{
    OPE_DELIVERY_COMPLETE_REQUESTED, OPE_EOR_IN_FLIGHT, OPE_QUEUED_CTRL, OPE_QUEUED_READ,
    OPE_QUEUED_RNR, OPE_RNR_ERR_WRITTEN, OpKind, OpeId, OpeState, OpeType,
};
use crate::peer::{
    PEER_HANDSHAKE_QUEUED, PEER_HANDSHAKE_RECEIVED, PEER_HANDSHAKE_SENT, PEER_REQ_SENT,
};
use crate::pkt::{
    FEATURE_DELIVERY_COMPLETE, FEATURE_RDMA_READ, FEATURE_RDMA_WRITE, OptHdrs, PacketType,
    PktBody, RtmDetail, RtwDetail, encode_header, parse_frame, req_hdr_size,
};
use crate::pool::{PktId, PoolKind};
use crate::proto::{SelectInput, req_data_capacity, select_rtm};

impl Endpoint {
    /// Optional subheaders a REQ packet to this peer must carry: the raw
    /// address until the peer has confirmed it knows us, the connection
    /// id afterwards, and CQ data when the operation has some.
    pub(crate) fn opt_hdrs_for_peer(&self, addr: Addr, cq_data: Option<u64>) -> OptHdrs {
        let peer = self.peers.get(addr);
        let mut opt = OptHdrs::default();
        let handshaken = peer.is_some_and(|p| p.has_flag(PEER_HANDSHAKE_RECEIVED));
        let local = self.av.local_raw();
        if handshaken {
            opt.connid = Some(local.connid);
        } else {
            opt.raw_addr = Some(local);
        }
        opt.cq_data = cq_data;
        opt
    }

    /// Select and post the RTM packet(s) for a two-sided send.
    pub(crate) fn post_rtm(&mut self, txe: OpeId) -> RdmResult<()> {
        let (addr, tagged, total_len, dc, iface, registered, cq_data) = {
            let ope = self.opes.get(txe).ok_or(RdmError::Invalid)?;
            (
                ope.addr.expect("txe has peer"),
                ope.kind == OpKind::Tagged,
                ope.total_len,
                ope.has_flag(OPE_DELIVERY_COMPLETE_REQUESTED),
                Endpoint::iface_of(&ope.desc),
                ope.desc.first().is_some_and(|d| d.is_some()),
                ope.cq.data,
            )
        };
        let opt = self.opt_hdrs_for_peer(addr, cq_data);
        let device_read = self.cfg.use_device_rdma && self.nic.supports_rdma_read();
        let cache_available = self.domain.cache_available();
        let peer = self.peers.get(addr).expect("peer");

        let rtm_type = select_rtm(&SelectInput {
            cfg: &self.cfg,
            peer,
            tagged,
            delivery_complete: dc,
            total_len,
            iface,
            source_registered: registered,
            device_read,
            cache_available,
            opt: &opt,
        });

        self.check_feature_or_handshake(addr, rtm_type)?;

        if rtm_type.is_runtread() {
            self.set_runt_size(txe, iface);
        }
        if rtm_type.is_longread() || rtm_type.is_runtread() {
            self.register_source(txe, iface)?;
        }
        if rtm_type.is_mulreq() {
            self.set_max_req_data_size(txe, rtm_type, iface, &opt);
            return self.post_or_queue_ctrl(txe, rtm_type);
        }

        self.post_pkts(txe, rtm_type)
    }

    /// Extra-feature gate: an unknown peer gets a handshake probe and the
    /// caller retries later; a known peer either has the feature or the
    /// operation is refused.
    pub(crate) fn check_feature_or_handshake(
        &mut self,
        addr: Addr,
        ptype: PacketType,
    ) -> RdmResult<()> {
        let Some(feature) = ptype.required_feature() else {
            return Ok(());
        };
        let peer = self.peers.get(addr).expect("peer");
        if !peer.has_flag(PEER_HANDSHAKE_RECEIVED) {
            self.trigger_handshake(addr)?;
            return Err(RdmError::TryAgain);
        }
        if !peer.supports(feature) {
            return Err(RdmError::NotSupported);
        }
        Ok(())
    }

    fn set_runt_size(&mut self, txe: OpeId, iface: MemIface) {
        let addr = self.opes.get(txe).expect("txe").addr.expect("peer");
        let in_flight = self.peers.get(addr).expect("peer").runt_bytes_in_flight;
        let budget = (self.cfg.runt_size[iface.index()] as u64).saturating_sub(in_flight);
        let ope = self.opes.get_mut(txe).expect("txe");
        if ope.bytes_runt == 0 {
            ope.bytes_runt = budget.min(ope.total_len);
        }
    }

    /// Register the source segments so the receiver can read them.
    fn register_source(&mut self, txe: OpeId, iface: MemIface) -> RdmResult<()> {
        let ope = self.opes.get(txe).expect("txe");
        if !ope.registered_keys.is_empty() {
            return Ok(());
        }
        let mut slices = crate::pkt::RmaVec::new();
        let mut keys = smallvec::SmallVec::new();
        for seg in &ope.iov {
            let key = self.domain.register_bytes(seg, iface)?;
            keys.push(key);
            slices.push(RemoteSlice {
                addr: 0,
                len: seg.len() as u64,
                key,
            });
        }
        let ope = self.opes.get_mut(txe).expect("txe");
        ope.registered_keys = keys;
        ope.source_iov = slices;
        Ok(())
    }

    /// Near-equal fragment sizing for multi-request protocols.
    fn set_max_req_data_size(
        &mut self,
        txe: OpeId,
        ptype: PacketType,
        iface: MemIface,
        opt: &OptHdrs,
    ) {
        let rma_count = {
            let ope = self.opes.get(txe).expect("txe");
            if ptype.is_runtread() {
                ope.source_iov.len()
            } else {
                ope.rma_iov.len()
            }
        };
        let capacity = req_data_capacity(&self.cfg, ptype, opt, rma_count);
        // Device memory wants 128-byte aligned fragments for in-order
        // placement; host memory settles for word alignment.
        let alignment: u64 = if iface == MemIface::Device { 128 } else { 8 };
        let capacity_aligned = capacity & !(alignment - 1);
        let ope = self.opes.get_mut(txe).expect("txe");
        let total = if ptype.is_medium() {
            ope.total_len
        } else {
            ope.bytes_runt
        };
        debug_assert!(total > 0);
        let num_req = (total - 1) / capacity_aligned.max(1) + 1;
        let per_req = ((total - 1) / num_req + 1).div_ceil(alignment) * alignment;
        ope.max_req_data_size = per_req.min(capacity_aligned.max(1));
    }

    /// Post packet(s) for `ptype`. Multi-request types go out as one
    /// batch; the last request clears the MORE hint.
    pub(crate) fn post_pkts(&mut self, ope_id: OpeId, ptype: PacketType) -> RdmResult<()> {
        if ptype.is_mulreq() {
            let (total, sent, per_req) = {
                let ope = self.opes.get(ope_id).ok_or(RdmError::Invalid)?;
                let total = if ptype.is_medium() {
                    ope.total_len
                } else {
                    ope.bytes_runt
                };
                (total, ope.bytes_sent, ope.max_req_data_size)
            };
            debug_assert!(per_req > 0);
            if sent >= total {
                return Ok(());
            }
            let num_req = ((total - sent - 1) / per_req + 1) as usize;
            if num_req > self.tx_budget_available() {
                return Err(RdmError::TryAgain);
            }
            for i in 0..num_req {
                let more = i != num_req - 1;
                self.post_pkt_one(ope_id, ptype, more)?;
            }
            let _ = self.nic.flush();
            self.more_batch_open = false;
            return Ok(());
        }
        self.post_pkt_one(ope_id, ptype, false)
    }

    /// Post, or park the operation on the queued-ctrl list for the
    /// progress engine when the device is momentarily out of room.
    pub(crate) fn post_or_queue_ctrl(&mut self, ope_id: OpeId, ptype: PacketType) -> RdmResult<()> {
        match self.post_pkts(ope_id, ptype) {
            Err(RdmError::TryAgain) => {
                let ope = self.opes.get_mut(ope_id).expect("ope");
                debug_assert!(!ope.has_flag(OPE_QUEUED_RNR));
                if !ope.has_flag(OPE_QUEUED_CTRL) {
                    ope.set_flag(OPE_QUEUED_CTRL);
                    ope.queued_ctrl_type = Some(ptype);
                    self.ope_queued_ctrl.push(ope_id);
                }
                Ok(())
            }
            other => other,
        }
    }

    pub(crate) fn tx_budget_available(&self) -> usize {
        let cap = self.nic.max_outstanding_tx().min(self.cfg.tx_queue_size);
        cap.saturating_sub(self.outstanding_tx)
    }

    /// Construct and post one packet for the operation.
    pub(crate) fn post_pkt_one(
        &mut self,
        ope_id: OpeId,
        ptype: PacketType,
        more: bool,
    ) -> RdmResult<()> {
        if self.tx_budget_available() == 0 {
            return Err(RdmError::TryAgain);
        }
        let addr = self
            .opes
            .get(ope_id)
            .ok_or(RdmError::Invalid)?
            .addr
            .expect("ope has peer");
        {
            let limit = self.peer_credit_limit();
            let peer = self.peers.get(addr).ok_or(RdmError::Invalid)?;
            if ptype.is_req() && peer.outstanding_tx_pkts >= limit {
                return Err(RdmError::TryAgain);
            }
        }

        let pkt_id = self
            .pkts
            .alloc(PoolKind::DeviceTx)
            .ok_or(RdmError::TryAgain)?;

        let frame_len = match self.build_frame(ope_id, ptype, pkt_id) {
            Ok(len) => len,
            Err(err) => {
                self.pkts.release(pkt_id);
                return Err(err);
            }
        };

        let dest = self.peers.get(addr).expect("peer").dest;
        {
            let entry = self.pkts.entry_mut(pkt_id);
            entry.len = frame_len;
            entry.ope = Some(ope_id);
            entry.addr = Some(addr);
        }
        let res = {
            let entry = self.pkts.entry(pkt_id);
            self.nic
                .post_send(&dest, pkt_id.0 as u64, entry.frame(), more)
        };
        if let Err(err) = res {
            self.pkts.release(pkt_id);
            return Err(err);
        }
        if more {
            self.more_batch_open = true;
        }

        self.outstanding_tx += 1;
        self.opes.get_mut(ope_id).expect("ope").device_outstanding_tx += 1;
        let peer = self.peers.get_mut(addr).expect("peer");
        peer.outstanding_tx_pkts += 1;
        if ptype.is_req() {
            peer.set_flag(PEER_REQ_SENT);
        }

        self.handle_pkt_sent(ope_id, ptype, pkt_id);
        Ok(())
    }

    /// Payload carried by the next packet of `ptype` for this operation.
    fn next_payload_len(&self, ope_id: OpeId, ptype: PacketType, hdr_len: usize) -> u64 {
        let ope = self.opes.get(ope_id).expect("ope");
        let room = (self.cfg.mtu_size - hdr_len) as u64;
        match ptype {
            t if t.is_eager_rtm() => ope.total_len,
            t if t.is_medium() => ope
                .max_req_data_size
                .min(ope.total_len - ope.bytes_sent)
                .min(room),
            t if t.is_runtread() => ope
                .max_req_data_size
                .min(ope.bytes_runt - ope.bytes_sent)
                .min(room),
            PacketType::EagerRtw | PacketType::DcEagerRtw => ope.total_len,
            PacketType::Data => room
                .min(ope.window)
                .min(ope.total_len - ope.bytes_sent),
            PacketType::Readrsp => room.min(ope.total_len - ope.bytes_sent),
            t if t.is_rta() => ope.iov.iter().map(|s| s.len() as u64).sum(),
            PacketType::Atomrsp => ope.atomrsp.len() as u64,
            _ => 0,
        }
    }

    /// Serialize header and payload for one packet into the pool buffer.
    fn build_frame(&mut self, ope_id: OpeId, ptype: PacketType, pkt_id: PktId) -> RdmResult<usize> {
        let (addr, cq_data) = {
            let ope = self.opes.get(ope_id).ok_or(RdmError::Invalid)?;
            (ope.addr.expect("ope has peer"), ope.cq.data)
        };
        let opt = if ptype.is_req() {
            self.opt_hdrs_for_peer(addr, cq_data)
        } else {
            // Control packets always carry the connection id; its
            // interpretation is unambiguous for them.
            let mut opt = OptHdrs::default();
            opt.connid = Some(self.av.local_raw().connid);
            opt
        };

        let mut body = self.frame_body(ope_id, ptype)?;
        let mut buf = self.pkts.take_buf(pkt_id);
        // First encoding fixes the header length; DATA-bearing headers
        // are patched with the payload size and encoded again (sizes are
        // identical either way).
        let mut written = encode_header(&mut buf, ptype, &opt, &body)?;
        let payload_len = self.next_payload_len(ope_id, ptype, written) as usize;
        match &mut body {
            PktBody::Data { seg_length, .. } | PktBody::Readrsp { seg_length, .. } => {
                *seg_length = payload_len as u64;
                written = encode_header(&mut buf, ptype, &opt, &body)?;
            }
            _ => {}
        }

        let ope = self.opes.get(ope_id).expect("ope");
        match ptype {
            t if t.is_eager_rtm() => {
                ope.copy_out(0, &mut buf[written..written + payload_len]);
            }
            t if t.is_medium() || t.is_runtread() => {
                ope.copy_out(ope.bytes_sent, &mut buf[written..written + payload_len]);
            }
            PacketType::EagerRtw | PacketType::DcEagerRtw => {
                ope.copy_out(0, &mut buf[written..written + payload_len]);
            }
            PacketType::Data | PacketType::Readrsp => {
                ope.copy_out(ope.bytes_sent, &mut buf[written..written + payload_len]);
            }
            t if t.is_rta() => {
                let mut off = written;
                for seg in &ope.iov {
                    buf[off..off + seg.len()].copy_from_slice(seg);
                    off += seg.len();
                }
            }
            PacketType::Atomrsp => {
                buf[written..written + payload_len].copy_from_slice(&ope.atomrsp);
            }
            _ => {}
        }

        self.pkts.put_buf(pkt_id, buf, written + payload_len);
        Ok(written + payload_len)
    }

    /// Wire body for the next packet of `ptype`.
    fn frame_body(&self, ope_id: OpeId, ptype: PacketType) -> RdmResult<PktBody> {
        let ope = self.opes.get(ope_id).ok_or(RdmError::Invalid)?;
        let own = ope_id.index;
        let tag = (ope.kind == OpKind::Tagged).then_some(ope.tag);
        Ok(match ptype {
            t if t.is_eager_rtm() => PktBody::Rtm {
                msg_id: ope.msg_id,
                tag,
                detail: RtmDetail::Eager {
                    send_id: t.is_dc().then_some(own),
                },
            },
            t if t.is_medium() => PktBody::Rtm {
                msg_id: ope.msg_id,
                tag,
                detail: RtmDetail::Medium {
                    msg_length: ope.total_len,
                    seg_offset: ope.bytes_sent,
                    send_id: t.is_dc().then_some(own),
                },
            },
            t if t.is_longcts() => PktBody::Rtm {
                msg_id: ope.msg_id,
                tag,
                detail: RtmDetail::LongCts {
                    msg_length: ope.total_len,
                    send_id: own,
                },
            },
            t if t.is_longread() => PktBody::Rtm {
                msg_id: ope.msg_id,
                tag,
                detail: RtmDetail::LongRead {
                    msg_length: ope.total_len,
                    send_id: own,
                    source: ope.source_iov.clone(),
                },
            },
            t if t.is_runtread() => PktBody::Rtm {
                msg_id: ope.msg_id,
                tag,
                detail: RtmDetail::RuntRead {
                    msg_length: ope.total_len,
                    send_id: own,
                    seg_offset: ope.bytes_sent,
                    runt_length: ope.bytes_runt,
                    source: ope.source_iov.clone(),
                },
            },
            PacketType::EagerRtw | PacketType::DcEagerRtw => PktBody::Rtw {
                target: ope.rma_iov.clone(),
                detail: RtwDetail::Eager {
                    send_id: ptype.is_dc().then_some(own),
                },
            },
            PacketType::LongCtsRtw | PacketType::DcLongCtsRtw => PktBody::Rtw {
                target: ope.rma_iov.clone(),
                detail: RtwDetail::LongCts {
                    msg_length: ope.total_len,
                    send_id: own,
                },
            },
            PacketType::LongReadRtw => PktBody::Rtw {
                target: ope.rma_iov.clone(),
                detail: RtwDetail::LongRead {
                    msg_length: ope.total_len,
                    source: ope.source_iov.clone(),
                },
            },
            PacketType::ShortRtr => PktBody::Rtr {
                recv_id: own,
                window: None,
                source: ope.rma_iov.clone(),
            },
            PacketType::LongCtsRtr => PktBody::Rtr {
                recv_id: own,
                window: Some(self.cfg.cts_window_size),
                source: ope.rma_iov.clone(),
            },
            t if t.is_rta() => PktBody::Rta {
                msg_id: ope.msg_id,
                op: ope.atomic_op,
                dtype: ope.atomic_dtype,
                target: ope.rma_iov.clone(),
                recv_id: matches!(t, PacketType::FetchRta | PacketType::CompareRta)
                    .then_some(own),
                send_id: (t == PacketType::DcWriteRta).then_some(own),
            },
            PacketType::Cts => PktBody::Cts {
                send_id: ope.remote_id.ok_or(RdmError::Invalid)?,
                recv_id: own,
                window: ope.window,
            },
            PacketType::Eor => PktBody::Eor {
                send_id: ope.remote_id.ok_or(RdmError::Invalid)?,
                recv_id: own,
            },
            PacketType::Receipt => PktBody::Receipt {
                tx_id: ope.remote_id.ok_or(RdmError::Invalid)?,
                msg_id: ope.msg_id,
            },
            PacketType::Readrsp => PktBody::Readrsp {
                send_id: own,
                recv_id: ope.remote_id.ok_or(RdmError::Invalid)?,
                seg_offset: ope.bytes_sent,
                seg_length: 0, // patched once payload size is known
            },
            PacketType::Data => PktBody::Data {
                recv_id: ope.remote_id.ok_or(RdmError::Invalid)?,
                seg_offset: ope.bytes_sent,
                seg_length: 0, // patched once payload size is known
            },
            PacketType::Atomrsp => PktBody::Atomrsp {
                recv_id: ope.remote_id.ok_or(RdmError::Invalid)?,
            },
            PacketType::Handshake => return Err(RdmError::Invalid),
            _ => unreachable!("all non-Handshake packet types are covered by the guards above"),
        })
    }

    /// Book-keeping after a packet was accepted by the device.
    fn handle_pkt_sent(&mut self, ope_id: OpeId, ptype: PacketType, pkt_id: PktId) {
        let parsed = parse_frame(self.pkts.entry(pkt_id).frame()).expect("own frame parses");
        let payload = (parsed.payload.end - parsed.payload.start) as u64;

        let addr = self.opes.get(ope_id).expect("ope").addr;
        match ptype {
            t if t.is_eager_rtm() || t == PacketType::EagerRtw || t == PacketType::DcEagerRtw => {
                let ope = self.opes.get_mut(ope_id).expect("ope");
                ope.bytes_sent = ope.total_len;
            }
            t if t.is_medium() => {
                let ope = self.opes.get_mut(ope_id).expect("ope");
                ope.bytes_sent += payload;
            }
            t if t.is_runtread() => {
                let ope = self.opes.get_mut(ope_id).expect("ope");
                ope.bytes_sent += payload;
                if let Some(addr) = addr {
                    self.peers.get_mut(addr).expect("peer").runt_bytes_in_flight += payload;
                }
            }
            PacketType::Data | PacketType::Readrsp => {
                let ope = self.opes.get_mut(ope_id).expect("ope");
                ope.bytes_sent += payload;
                ope.window = ope.window.saturating_sub(payload);
            }
            _ => {}
        }
        debug!(ope = %ope_id, ?ptype, payload, "packet posted");
    }
}

impl Endpoint {
    /// Capability bits this endpoint advertises in its HANDSHAKE.
    pub(crate) fn our_features(&self) -> u64 {
        let mut features = FEATURE_DELIVERY_COMPLETE;
        if self.cfg.use_device_rdma && self.nic.supports_rdma_read() {
            features |= FEATURE_RDMA_READ;
        }
        if self.cfg.use_device_rdma && self.nic.supports_rdma_write() {
            features |= FEATURE_RDMA_WRITE;
        }
        features
    }

    /// Post a HANDSHAKE to the peer. The packet owns no operation entry.
    pub(crate) fn post_handshake(&mut self, addr: Addr) -> RdmResult<()> {
        if self.tx_budget_available() == 0 {
            return Err(RdmError::TryAgain);
        }
        let dest = self.peers.get(addr).ok_or(RdmError::Invalid)?.dest;
        let pkt_id = self
            .pkts
            .alloc(PoolKind::DeviceTx)
            .ok_or(RdmError::TryAgain)?;

        let mut opt = OptHdrs::default();
        opt.raw_addr = Some(self.av.local_raw());
        let body = PktBody::Handshake {
            nextra_p3: 64,
            features: self.our_features(),
            host_id: (self.host_id != 0).then_some(self.host_id),
        };
        let mut buf = self.pkts.take_buf(pkt_id);
        let written = match encode_header(&mut buf, PacketType::Handshake, &opt, &body) {
            Ok(len) => len,
            Err(err) => {
                self.pkts.put_buf(pkt_id, buf, 0);
                self.pkts.release(pkt_id);
                return Err(err);
            }
        };
        self.pkts.put_buf(pkt_id, buf, written);
        {
            let entry = self.pkts.entry_mut(pkt_id);
            entry.ope = None;
            entry.addr = Some(addr);
        }

        let res = {
            let entry = self.pkts.entry(pkt_id);
            self.nic.post_send(&dest, pkt_id.0 as u64, entry.frame(), false)
        };
        if let Err(err) = res {
            self.pkts.release(pkt_id);
            return Err(err);
        }
        self.outstanding_tx += 1;
        let peer = self.peers.get_mut(addr).expect("peer");
        peer.outstanding_tx_pkts += 1;
        peer.set_flag(PEER_HANDSHAKE_SENT);
        debug!(peer = %addr, "handshake posted");
        Ok(())
    }

    /// Post a handshake now or park the peer on the handshake queue.
    pub(crate) fn post_handshake_or_queue(&mut self, addr: Addr) {
        {
            let Some(peer) = self.peers.get(addr) else {
                return;
            };
            if peer.has_flag(PEER_HANDSHAKE_SENT) || peer.has_flag(PEER_HANDSHAKE_QUEUED) {
                return;
            }
        }
        match self.post_handshake(addr) {
            Ok(()) => {}
            Err(RdmError::TryAgain) => {
                let peer = self.peers.get_mut(addr).expect("peer");
                peer.set_flag(PEER_HANDSHAKE_QUEUED);
                self.peers.handshake_queue.push_back(addr);
            }
            Err(err) => {
                warn!(peer = %addr, ?err, "handshake post failed");
                self.write_event(err, false, "handshake post failed");
            }
        }
    }

    /// Provoke a HANDSHAKE reply from a peer whose capabilities we need.
    ///
    /// A zero-length write request is used rather than a message RTM so
    /// the probe cannot disturb receive-side message ordering. The probe
    /// carries no completion and consumes no message id.
    pub(crate) fn trigger_handshake(&mut self, addr: Addr) -> RdmResult<()> {
        {
            let peer = self.peers.get(addr).ok_or(RdmError::Invalid)?;
            if peer.has_flag(PEER_HANDSHAKE_RECEIVED) || peer.has_flag(PEER_REQ_SENT) {
                return Ok(());
            }
        }
        let id = self.opes.alloc().ok_or(RdmError::TryAgain)?;
        {
            let ope = self.opes.get_mut(id).expect("fresh ope");
            ope.ty = OpeType::Tx;
            ope.state = OpeState::TxReq;
            ope.kind = OpKind::Write;
            ope.addr = Some(addr);
            ope.cq.flags = crate::endpoint::tx_cq_flags(OpKind::Write);
            ope.set_flag(crate::ope::OPE_NO_COMPLETION);
            ope.set_flag(crate::ope::OPE_NO_COUNTER);
        }
        self.peers.get_mut(addr).expect("peer").txe_list.push(id);
        let res = self.post_pkts(id, PacketType::EagerRtw);
        if res.is_err() {
            self.release_txe(id);
        }
        res
    }

    // ---- one-sided starts ----------------------------------------------

    pub(crate) fn start_remote_write(&mut self, txe: OpeId) -> RdmResult<()> {
        let (addr, total, dc, cq_data, iface, registered) = {
            let ope = self.opes.get(txe).ok_or(RdmError::Invalid)?;
            (
                ope.addr.expect("txe has peer"),
                ope.total_len,
                ope.has_flag(OPE_DELIVERY_COMPLETE_REQUESTED),
                ope.cq.data,
                Endpoint::iface_of(&ope.desc),
                ope.desc.first().is_some_and(|d| d.is_some()),
            )
        };

        let device_write = self.cfg.use_device_rdma && self.nic.supports_rdma_write();
        {
            let peer = self.peers.get(addr).expect("peer");
            if device_write
                && !dc
                && peer.has_flag(PEER_HANDSHAKE_RECEIVED)
                && peer.supports(FEATURE_RDMA_WRITE)
            {
                let ope = self.opes.get_mut(txe).expect("txe");
                ope.bytes_write_total = total;
                ope.bytes_write_submitted = 0;
                ope.bytes_write_completed = 0;
                return self.post_write_segments(txe);
            }
        }

        let opt = self.opt_hdrs_for_peer(addr, cq_data);
        let rma_count = self.opes.get(txe).expect("txe").rma_iov.len();
        let eager_type = if dc {
            PacketType::DcEagerRtw
        } else {
            PacketType::EagerRtw
        };
        let eager_cap = req_data_capacity(&self.cfg, eager_type, &opt, rma_count);
        let device_read = self.cfg.use_device_rdma && self.nic.supports_rdma_read();
        let cache = self.domain.cache_available();

        let rtw = if total <= eager_cap {
            eager_type
        } else if !dc
            && device_read
            && total >= self.cfg.min_read_msg_size[iface.index()] as u64
            && (registered || cache)
        {
            PacketType::LongReadRtw
        } else if dc {
            PacketType::DcLongCtsRtw
        } else {
            PacketType::LongCtsRtw
        };

        self.check_feature_or_handshake(addr, rtw)?;
        if rtw == PacketType::LongReadRtw {
            self.register_source(txe, iface)?;
        }
        self.post_pkts(txe, rtw)
    }

    pub(crate) fn start_remote_read(&mut self, txe: OpeId) -> RdmResult<()> {
        let addr = self
            .opes
            .get(txe)
            .ok_or(RdmError::Invalid)?
            .addr
            .expect("txe has peer");
        let device_read = self.cfg.use_device_rdma && self.nic.supports_rdma_read();
        if device_read {
            let handshaken = self
                .peers
                .get(addr)
                .expect("peer")
                .has_flag(PEER_HANDSHAKE_RECEIVED);
            if !handshaken {
                self.trigger_handshake(addr)?;
                return Err(RdmError::TryAgain);
            }
            if self.peers.get(addr).expect("peer").supports(FEATURE_RDMA_READ) {
                self.prepare_to_post_read(txe);
                return self.post_read_or_queue(txe);
            }
        }

        // Emulated read: ask the responder to push the data back.
        let total = {
            let ope = self.opes.get_mut(txe).expect("txe");
            let local = ope.buffer_len();
            let remote: u64 = ope.rma_iov.iter().map(|s| s.len).sum();
            ope.total_len = local.min(remote);
            ope.total_len
        };
        let readrsp_cap = (self.cfg.mtu_size - crate::pkt::READRSP_HDR_SIZE - 8) as u64;
        let rtr = if total <= readrsp_cap {
            PacketType::ShortRtr
        } else {
            PacketType::LongCtsRtr
        };
        self.post_pkts(txe, rtr)?;
        if rtr == PacketType::LongCtsRtr {
            self.opes.get_mut(txe).expect("txe").window = self.cfg.cts_window_size;
        }
        Ok(())
    }

    pub(crate) fn start_atomic(&mut self, txe: OpeId) -> RdmResult<()> {
        let (addr, kind, dc, payload, rma_count) = {
            let ope = self.opes.get(txe).ok_or(RdmError::Invalid)?;
            (
                ope.addr.expect("txe has peer"),
                ope.kind,
                ope.has_flag(OPE_DELIVERY_COMPLETE_REQUESTED),
                ope.iov.iter().map(|s| s.len()).sum::<usize>(),
                ope.rma_iov.len(),
            )
        };
        let ptype = match kind {
            OpKind::AtomicWrite => {
                if dc {
                    PacketType::DcWriteRta
                } else {
                    PacketType::WriteRta
                }
            }
            OpKind::AtomicFetch => PacketType::FetchRta,
            OpKind::AtomicCompare => PacketType::CompareRta,
            _ => return Err(RdmError::Invalid),
        };
        self.check_feature_or_handshake(addr, ptype)?;

        let opt = self.opt_hdrs_for_peer(addr, None);
        if req_hdr_size(ptype, &opt, rma_count) + payload > self.cfg.mtu_size {
            return Err(RdmError::Invalid);
        }
        self.post_pkts(txe, ptype)
    }

    pub(crate) fn prepare_to_post_read(&mut self, ope_id: OpeId) {
        let ope = self.opes.get_mut(ope_id).expect("ope");
        let local = ope.buffer_len();
        let remote: u64 = ope.rma_iov.iter().map(|s| s.len).sum();
        ope.bytes_read_offset = if ope.ty == OpeType::Rx {
            ope.bytes_runt
        } else {
            0
        };
        ope.bytes_read_total = local.min(remote).saturating_sub(ope.bytes_read_offset);
        ope.bytes_read_submitted = 0;
        ope.bytes_read_completed = 0;
    }

    /// Submit one-sided reads until done or out of device budget.
    pub(crate) fn post_read_segments(&mut self, ope_id: OpeId) -> RdmResult<()> {
        let max_seg = self
            .cfg
            .read_segment_size
            .min(self.nic.max_rdma_size()) as u64;
        loop {
            let (addr, offset, remaining) = {
                let ope = self.opes.get(ope_id).ok_or(RdmError::Invalid)?;
                if ope.bytes_read_submitted >= ope.bytes_read_total {
                    return Ok(());
                }
                (
                    ope.addr,
                    ope.bytes_read_offset + ope.bytes_read_submitted,
                    ope.bytes_read_total - ope.bytes_read_submitted,
                )
            };
            if self.tx_budget_available() == 0 {
                return Err(RdmError::TryAgain);
            }
            let (slice, slice_off) = {
                let ope = self.opes.get(ope_id).expect("ope");
                let (idx, off) = locate_rma(&ope.rma_iov, offset).ok_or(RdmError::Invalid)?;
                (ope.rma_iov[idx], off)
            };
            let seg = max_seg.min(remaining).min(slice.len - slice_off);
            debug_assert!(seg > 0);

            let pkt_id = self
                .pkts
                .alloc(PoolKind::DeviceTx)
                .ok_or(RdmError::TryAgain)?;
            let dest = match addr {
                Some(addr) => Some(self.peers.get(addr).ok_or(RdmError::Invalid)?.dest),
                None => None,
            };
            {
                let entry = self.pkts.entry_mut(pkt_id);
                entry.ope = Some(ope_id);
                entry.addr = addr;
                entry.rma_offset = offset;
                entry.len = seg as usize;
                if addr.is_none() {
                    entry.flags |= crate::pool::PKT_LOCAL_READ;
                }
            }
            let remote = RemoteSlice {
                addr: slice.addr + slice_off,
                len: seg,
                key: slice.key,
            };
            if let Err(err) = self
                .nic
                .post_read(dest.as_ref(), pkt_id.0 as u64, remote, false)
            {
                self.pkts.release(pkt_id);
                return Err(err);
            }
            self.outstanding_tx += 1;
            self.opes.get_mut(ope_id).expect("ope").device_outstanding_tx += 1;
            self.opes.get_mut(ope_id).expect("ope").bytes_read_submitted += seg;
            if let Some(addr) = addr {
                if let Some(peer) = self.peers.get_mut(addr) {
                    peer.outstanding_tx_pkts += 1;
                }
            }
        }
    }

    pub(crate) fn post_read_or_queue(&mut self, ope_id: OpeId) -> RdmResult<()> {
        match self.post_read_segments(ope_id) {
            Err(RdmError::TryAgain) => {
                let ope = self.opes.get_mut(ope_id).expect("ope");
                if !ope.has_flag(OPE_QUEUED_READ) {
                    ope.set_flag(OPE_QUEUED_READ);
                    self.ope_queued_read.push(ope_id);
                }
                Ok(())
            }
            other => other,
        }
    }

    /// Submit one-sided writes; the last segment carries the immediate
    /// data so the target sees exactly one remote completion.
    pub(crate) fn post_write_segments(&mut self, ope_id: OpeId) -> RdmResult<()> {
        let max_seg = self
            .cfg
            .write_segment_size
            .min(self.nic.max_rdma_size()) as u64;
        let (total, addr, cq_data) = {
            let ope = self.opes.get(ope_id).ok_or(RdmError::Invalid)?;
            (
                ope.bytes_write_total,
                ope.addr.expect("write has peer"),
                ope.cq.data,
            )
        };
        // Refuse up front rather than strand half a batch.
        let num_segments = if total == 0 {
            1
        } else {
            total.div_ceil(max_seg) as usize
        };
        if num_segments > self.tx_budget_available() {
            return Err(RdmError::TryAgain);
        }

        loop {
            let (submitted, remaining) = {
                let ope = self.opes.get(ope_id).expect("ope");
                if ope.bytes_write_submitted >= total {
                    return Ok(());
                }
                (ope.bytes_write_submitted, total - ope.bytes_write_submitted)
            };
            let (slice, slice_off) = {
                let ope = self.opes.get(ope_id).expect("ope");
                let (idx, off) = locate_rma(&ope.rma_iov, submitted).ok_or(RdmError::Invalid)?;
                (ope.rma_iov[idx], off)
            };
            let seg = max_seg.min(remaining).min(slice.len - slice_off);
            let last = seg == remaining;

            let pkt_id = self
                .pkts
                .alloc(PoolKind::DeviceTx)
                .ok_or(RdmError::TryAgain)?;
            let mut data = vec![0u8; seg as usize];
            self.opes
                .get(ope_id)
                .expect("ope")
                .copy_out(submitted, &mut data);
            let dest = self.peers.get(addr).ok_or(RdmError::Invalid)?.dest;
            {
                let entry = self.pkts.entry_mut(pkt_id);
                entry.ope = Some(ope_id);
                entry.addr = Some(addr);
                entry.rma_offset = submitted;
                entry.len = seg as usize;
            }
            let imm = if last {
                cq_data.map(|d| d as u32)
            } else {
                None
            };
            let remote = RemoteSlice {
                addr: slice.addr + slice_off,
                len: seg,
                key: slice.key,
            };
            if let Err(err) =
                self.nic
                    .post_write(&dest, pkt_id.0 as u64, &data, remote, imm, false)
            {
                self.pkts.release(pkt_id);
                return Err(err);
            }
            self.outstanding_tx += 1;
            self.opes.get_mut(ope_id).expect("ope").device_outstanding_tx += 1;
            self.opes.get_mut(ope_id).expect("ope").bytes_write_submitted += seg;
            self.peers.get_mut(addr).expect("peer").outstanding_tx_pkts += 1;
        }
    }

    // ---- completion handling -------------------------------------------

    /// Device accounting shared by success and error completions.
    pub(crate) fn record_tx_op_completed(&mut self, pkt_id: PktId) {
        self.outstanding_tx = self.outstanding_tx.saturating_sub(1);
        let (ope_id, addr) = {
            let entry = self.pkts.entry(pkt_id);
            (entry.ope, entry.addr)
        };
        if let Some(ope) = ope_id.and_then(|id| self.opes.get_mut(id)) {
            ope.device_outstanding_tx = ope.device_outstanding_tx.saturating_sub(1);
        }
        if let Some(peer) = addr.and_then(|a| self.peers.get_mut(a)) {
            peer.outstanding_tx_pkts = peer.outstanding_tx_pkts.saturating_sub(1);
        }
    }

    pub(crate) fn handle_send_completion(&mut self, pkt_id: PktId) {
        let (addr, ope_id, pkt_flags) = {
            let entry = self.pkts.entry(pkt_id);
            (entry.addr, entry.ope, entry.flags)
        };

        let peer_gone = match addr {
            Some(a) => self.peers.get(a).is_none() || self.av.resolve(a).is_none(),
            None => true,
        };
        if peer_gone && pkt_flags & crate::pool::PKT_LOCAL_READ == 0 {
            warn!("ignoring send completion of a packet to a removed peer");
            self.record_tx_op_completed(pkt_id);
            self.pkts.release(pkt_id);
            return;
        }

        let parsed = match parse_frame(self.pkts.entry(pkt_id).frame()) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.record_tx_op_completed(pkt_id);
                self.pkts.release(pkt_id);
                return;
            }
        };
        let ptype = parsed.ptype;
        let payload = (parsed.payload.end - parsed.payload.start) as u64;

        match ptype {
            PacketType::Handshake | PacketType::Cts => {}
            t if t.is_dc() => {
                // Delivery-complete operations finish on RECEIPT, which
                // may overtake this completion; nothing to do here.
            }
            t if t.is_eager_rtm()
                || t.is_medium()
                || t == PacketType::EagerRtw
                || t == PacketType::Data
                || t == PacketType::Readrsp =>
            {
                if let Some(ope_id) = ope_id {
                    self.ack_sent_bytes(ope_id, payload);
                }
            }
            t if t.is_longcts() || t == PacketType::LongCtsRtw || t == PacketType::LongReadRtw => {
                // Header-only; data packets or the EOR account for the
                // transfer.
            }
            t if t.is_longread() => {}
            t if t.is_runtread() => {
                if let Some(a) = addr {
                    if let Some(peer) = self.peers.get_mut(a) {
                        peer.runt_bytes_in_flight =
                            peer.runt_bytes_in_flight.saturating_sub(payload);
                    }
                }
                if let Some(ope_id) = ope_id {
                    self.ack_sent_bytes(ope_id, payload);
                }
            }
            PacketType::ShortRtr | PacketType::LongCtsRtr => {
                // Requester entry completes when the response data lands.
            }
            PacketType::WriteRta => {
                if let Some(ope_id) = ope_id {
                    if self.opes.get(ope_id).is_some() {
                        self.handle_send_completed(ope_id);
                    }
                }
            }
            PacketType::FetchRta | PacketType::CompareRta => {}
            PacketType::Eor => {
                if let Some(ope_id) = ope_id {
                    let release = if let Some(ope) = self.opes.get_mut(ope_id) {
                        ope.clear_flag(OPE_EOR_IN_FLIGHT);
                        ope.bytes_received >= crate::rx::recv_threshold(ope)
                    } else {
                        false
                    };
                    if release {
                        self.release_rxe(ope_id);
                    }
                }
            }
            PacketType::Receipt | PacketType::Atomrsp => {
                if let Some(ope_id) = ope_id {
                    if self.opes.get(ope_id).is_some() {
                        self.release_rxe(ope_id);
                    }
                }
            }
            _ => {}
        }

        self.record_tx_op_completed(pkt_id);
        self.pkts.release(pkt_id);
    }

    /// Credit acknowledged payload to an operation and finish it when all
    /// data is accounted for. Delivery-complete operations wait for their
    /// RECEIPT instead.
    fn ack_sent_bytes(&mut self, ope_id: OpeId, payload: u64) {
        let done = if let Some(ope) = self.opes.get_mut(ope_id) {
            ope.bytes_acked += payload;
            ope.bytes_acked >= ope.total_len && !ope.has_flag(OPE_DELIVERY_COMPLETE_REQUESTED)
        } else {
            return;
        };
        if done {
            self.handle_send_completed(ope_id);
        }
    }

    pub(crate) fn handle_send_error(&mut self, pkt_id: PktId, err: NicErrorKind) {
        debug!(?err, "packet send error");
        self.record_tx_op_completed(pkt_id);

        let (addr, ope_id) = {
            let entry = self.pkts.entry(pkt_id);
            (entry.addr, entry.ope)
        };
        let Some(addr) = addr else {
            self.pkts.release(pkt_id);
            return;
        };
        if self.peers.get(addr).is_none() {
            warn!("ignoring send error completion of a packet to a removed peer");
            self.pkts.release(pkt_id);
            return;
        }

        let Some(ope_id) = ope_id else {
            // Only handshakes travel without an owning operation.
            self.pkts.release(pkt_id);
            match err {
                NicErrorKind::ReceiverNotReady => {
                    let peer = self.peers.get_mut(addr).expect("peer");
                    if !peer.has_flag(PEER_HANDSHAKE_QUEUED) {
                        peer.set_flag(PEER_HANDSHAKE_QUEUED);
                        self.peers.handshake_queue.push_back(addr);
                    }
                }
                NicErrorKind::RemoteDestroyed => {
                    // The peer finished without ever needing our
                    // handshake; nothing to report.
                }
                NicErrorKind::Transport(_) => {
                    self.write_event(nic_err_to_rdm(err), false, "handshake send failed");
                }
            }
            return;
        };

        let Some(ope) = self.opes.get(ope_id) else {
            self.pkts.release(pkt_id);
            return;
        };
        match ope.ty {
            OpeType::Tx => {
                if err == NicErrorKind::ReceiverNotReady {
                    if !self.cfg.provider_managed_resources {
                        let ope = self.opes.get_mut(ope_id).expect("ope");
                        let first = !ope.has_flag(OPE_RNR_ERR_WRITTEN);
                        ope.set_flag(OPE_RNR_ERR_WRITTEN);
                        self.pkts.release(pkt_id);
                        if first {
                            self.txe_handle_error(ope_id, RdmError::Remote);
                        }
                        if self
                            .opes
                            .get(ope_id)
                            .is_some_and(|o| o.device_outstanding_tx == 0)
                        {
                            self.release_txe(ope_id);
                        }
                    } else {
                        self.queue_rnr_pkt(ope_id, pkt_id, addr);
                    }
                } else {
                    self.txe_handle_error(ope_id, nic_err_to_rdm(err));
                    self.pkts.release(pkt_id);
                }
            }
            OpeType::Rx => {
                if err == NicErrorKind::ReceiverNotReady {
                    // Control packets retry regardless of the resource
                    // management mode; it only governs send operations.
                    self.queue_rnr_pkt(ope_id, pkt_id, addr);
                } else {
                    self.rxe_handle_error(ope_id, nic_err_to_rdm(err));
                    self.pkts.release(pkt_id);
                }
            }
        }
    }

    /// Park a packet for retry and put its peer into (deeper) backoff.
    pub(crate) fn queue_rnr_pkt(&mut self, ope_id: OpeId, pkt_id: PktId, addr: Addr) {
        let repeat = {
            let entry = self.pkts.entry_mut(pkt_id);
            let repeat = entry.flags & crate::pool::PKT_RNR_RETRANSMIT != 0;
            entry.flags |= crate::pool::PKT_RNR_RETRANSMIT;
            repeat
        };
        {
            let ope = self.opes.get_mut(ope_id).expect("ope");
            ope.queued_pkts.push(pkt_id);
            if !ope.has_flag(OPE_QUEUED_RNR) {
                ope.set_flag(OPE_QUEUED_RNR);
                self.ope_queued_rnr.push(ope_id);
            }
        }
        let now = self.time.now_micros();
        let initial = self.cfg.rnr_backoff_initial_wait;
        let cap = self.cfg.rnr_backoff_wait_cap;
        let peer = self.peers.get_mut(addr).expect("peer");
        let newly = !peer.has_flag(crate::peer::PEER_IN_BACKOFF);
        peer.enter_backoff(now, initial, cap, repeat);
        if newly {
            self.peers.backoff_list.push(addr);
        }
    }

    /// Re-post the packets parked on an operation after RNR or a full
    /// TX queue.
    pub(crate) fn send_queued_pkts(&mut self, ope_id: OpeId) -> RdmResult<()> {
        loop {
            let Some(&pkt_id) = self
                .opes
                .get(ope_id)
                .and_then(|o| o.queued_pkts.first())
            else {
                return Ok(());
            };
            if self.tx_budget_available() == 0 {
                return Err(RdmError::TryAgain);
            }
            let addr = self.pkts.entry(pkt_id).addr.expect("queued pkt has peer");
            let Some(peer) = self.peers.get(addr) else {
                // Peer left the address vector; drop the packet.
                self.opes.get_mut(ope_id).expect("ope").queued_pkts.remove(0);
                self.pkts.release(pkt_id);
                continue;
            };
            let dest = peer.dest;
            let res = {
                let entry = self.pkts.entry(pkt_id);
                self.nic.post_send(&dest, pkt_id.0 as u64, entry.frame(), false)
            };
            match res {
                Ok(()) => {
                    self.opes.get_mut(ope_id).expect("ope").queued_pkts.remove(0);
                    self.outstanding_tx += 1;
                    self.opes.get_mut(ope_id).expect("ope").device_outstanding_tx += 1;
                    self.peers.get_mut(addr).expect("peer").outstanding_tx_pkts += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub(crate) fn nic_err_to_rdm(err: NicErrorKind) -> RdmError {
    match err {
        NicErrorKind::ReceiverNotReady | NicErrorKind::RemoteDestroyed => RdmError::Remote,
        NicErrorKind::Transport(code) => RdmError::Transport(code),
    }
}

pub(crate) fn locate_rma(iov: &crate::pkt::RmaVec, offset: u64) -> Option<(usize, u64)> {
    let mut remaining = offset;
    for (idx, slice) in iov.iter().enumerate() {
        if remaining < slice.len {
            return Some((idx, remaining));
        }
        remaining -= slice.len;
    }
    None
}
