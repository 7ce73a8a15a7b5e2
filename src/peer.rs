//! Per-remote-endpoint state.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::av::Addr;
use crate::nic::NicDest;
use crate::ope::OpeId;
use crate::pool::PktId;

pub const PEER_HANDSHAKE_SENT: u32 = 1 << 0;
pub const PEER_HANDSHAKE_RECEIVED: u32 = 1 << 1;
pub const PEER_HANDSHAKE_QUEUED: u32 = 1 << 2;
/// At least one REQ packet went out to this peer, so a handshake reply
/// is already on its way; no need to provoke one.
pub const PEER_REQ_SENT: u32 = 1 << 3;
pub const PEER_IN_BACKOFF: u32 = 1 << 4;
/// Peer lives on the same host; eligible for the SHM shortcut.
pub const PEER_IS_LOCAL: u32 = 1 << 5;

/// What to do with an incoming RTM relative to the peer's receive window.
#[derive(Debug, PartialEq, Eq)]
pub enum Reorder {
    /// In order: process now.
    InOrder,
    /// Ahead of the window start: stash until the gap fills.
    Buffer,
    /// Behind the window: duplicate delivery, drop it.
    Duplicate,
    /// Too far ahead for the configured window.
    Overflow,
}

#[derive(Debug)]
pub struct Peer {
    pub addr: Addr,
    pub dest: NicDest,
    /// Capability bitmap, known only after a HANDSHAKE arrived.
    pub features: Option<u64>,
    pub nextra_p3: u32,
    pub host_id: u64,
    pub flags: u32,

    /// Next outbound message id. Consumed only on successful dispatch.
    pub next_msg_id: u32,
    /// Next inbound message id expected for ordered delivery.
    pub next_expected_msg_id: u32,
    /// Requests that arrived ahead of order, keyed by message id. A
    /// multi-request message can buffer several packets under one id.
    pub ooo_pkts: HashMap<u32, Vec<PktId>>,
    /// In-progress multi-request receives, keyed by message id.
    pub mulreq_rxe: HashMap<u32, OpeId>,

    /// Backoff bookkeeping, microseconds on the monotonic clock.
    pub rnr_backoff_begin: u64,
    pub rnr_backoff_wait: u64,

    /// Peer address in the SHM collaborator's vector, when local.
    pub shm_addr: Option<u64>,

    pub runt_bytes_in_flight: u64,
    /// Packets handed to the device and not yet completed, the per-peer
    /// credit consumption.
    pub outstanding_tx_pkts: usize,

    /// Unexpected messages from this peer, oldest first.
    pub unexp_list: VecDeque<OpeId>,
    pub unexp_tagged_list: VecDeque<OpeId>,
    /// Live operations addressed to this peer, detached at release.
    pub txe_list: Vec<OpeId>,
    pub rxe_list: Vec<OpeId>,
}

impl Peer {
    pub fn new(addr: Addr, dest: NicDest, initial_msg_id: u32, is_local: bool) -> Self {
        Self {
            addr,
            dest,
            features: None,
            nextra_p3: 0,
            host_id: 0,
            flags: if is_local { PEER_IS_LOCAL } else { 0 },
            next_msg_id: initial_msg_id,
            next_expected_msg_id: 0,
            ooo_pkts: HashMap::new(),
            mulreq_rxe: HashMap::new(),
            rnr_backoff_begin: 0,
            rnr_backoff_wait: 0,
            shm_addr: None,
            runt_bytes_in_flight: 0,
            outstanding_tx_pkts: 0,
            unexp_list: VecDeque::new(),
            unexp_tagged_list: VecDeque::new(),
            txe_list: Vec::new(),
            rxe_list: Vec::new(),
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

    pub fn supports(&self, feature: u64) -> bool {
        self.features.is_some_and(|f| f & feature != 0)
    }

    /// Record an RNR and advance the backoff schedule: the first hit for
    /// a packet waits `initial`, every repeat of the same packet doubles
    /// the wait up to `cap`.
    pub fn enter_backoff(&mut self, now_us: u64, initial: u64, cap: u64, repeat: bool) {
        if repeat && self.rnr_backoff_wait > 0 {
            self.rnr_backoff_wait = (self.rnr_backoff_wait * 2).min(cap);
        } else {
            self.rnr_backoff_wait = initial.min(cap);
        }
        self.set_flag(PEER_IN_BACKOFF);
        self.rnr_backoff_begin = now_us;
        debug!(
            peer = %self.addr,
            wait_us = self.rnr_backoff_wait,
            "peer entered rnr backoff"
        );
    }

    pub fn backoff_expired(&self, now_us: u64) -> bool {
        now_us >= self.rnr_backoff_begin + self.rnr_backoff_wait
    }

    /// Classify an incoming RTM message id against the receive window.
    /// Both sides count from zero, so no synchronization is needed.
    pub fn reorder(&mut self, msg_id: u32, recvwin: u32) -> Reorder {
        let delta = msg_id.wrapping_sub(self.next_expected_msg_id);
        if delta == 0 {
            Reorder::InOrder
        } else if delta < recvwin {
            Reorder::Buffer
        } else if delta > u32::MAX / 2 {
            Reorder::Duplicate
        } else {
            Reorder::Overflow
        }
    }
}

/// Table of all known peers, keyed by local address handle.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<Addr, Peer>,
    /// Peers currently in backoff, swept each progress tick.
    pub backoff_list: Vec<Addr>,
    /// Peers with a queued handshake.
    pub handshake_queue: VecDeque<Addr>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: Addr) -> Option<&Peer> {
        self.peers.get(&addr)
    }

    pub fn get_mut(&mut self, addr: Addr) -> Option<&mut Peer> {
        self.peers.get_mut(&addr)
    }

    pub fn insert(&mut self, peer: Peer) -> &mut Peer {
        let addr = peer.addr;
        self.peers.entry(addr).or_insert(peer)
    }

    pub fn contains(&self, addr: Addr) -> bool {
        self.peers.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn addrs(&self) -> Vec<Addr> {
        self.peers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::RawAddr;

    fn peer() -> Peer {
        Peer::new(
            Addr(1),
            NicDest {
                qpn: 7,
                locator: RawAddr::default(),
            },
            0,
            false,
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut p = peer();
        p.enter_backoff(0, 1000, 3000, false);
        assert_eq!(p.rnr_backoff_wait, 1000);
        p.enter_backoff(10, 1000, 3000, true);
        assert_eq!(p.rnr_backoff_wait, 2000);
        p.enter_backoff(20, 1000, 3000, true);
        assert_eq!(p.rnr_backoff_wait, 3000);
        p.enter_backoff(30, 1000, 3000, true);
        assert_eq!(p.rnr_backoff_wait, 3000);
        assert!(!p.backoff_expired(30 + 2999));
        assert!(p.backoff_expired(30 + 3000));
    }

    #[test]
    fn fresh_packet_resets_backoff_to_initial() {
        let mut p = peer();
        p.enter_backoff(0, 1000, 8000, false);
        p.enter_backoff(10, 1000, 8000, true);
        assert_eq!(p.rnr_backoff_wait, 2000);
        p.enter_backoff(20, 1000, 8000, false);
        assert_eq!(p.rnr_backoff_wait, 1000);
    }

    #[test]
    fn reorder_classifies_window() {
        let mut p = peer();
        assert_eq!(p.reorder(0, 16), Reorder::InOrder);
        p.next_expected_msg_id = 6;
        assert_eq!(p.reorder(6, 16), Reorder::InOrder);
        assert_eq!(p.reorder(8, 16), Reorder::Buffer);
        assert_eq!(p.reorder(5, 16), Reorder::Duplicate);
        assert_eq!(p.reorder(6 + 17, 16), Reorder::Overflow);
    }

    #[test]
    fn reorder_handles_id_wrap() {
        let mut p = peer();
        p.next_expected_msg_id = u32::MAX;
        assert_eq!(p.reorder(u32::MAX, 16), Reorder::InOrder);
        assert_eq!(p.reorder(3, 16), Reorder::Buffer);
        p.next_expected_msg_id = 0;
        assert_eq!(p.reorder(u32::MAX, 16), Reorder::Duplicate);
    }
}
