//! Loopback collaborators for deterministic tests.
//!
//! A [`TestFabric`] connects any number of mock devices in-process:
//! frames posted on one queue pair land in a receive buffer posted on
//! the destination, one-sided operations resolve keys against a shared
//! registration store, and delivery can be held and replayed out of
//! order. Nothing here touches real hardware or the system clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::av::{Addr, AddressVector};
use crate::domain::{AtomicMath, Domain, MrProvider};
use crate::endpoint::{Collaborators, Endpoint};
use crate::env::{Config, MemIface};
use crate::error::{RdmError, RdmResult};
use crate::nic::{
    NicCompletion, NicDest, NicDevice, NicErrorKind, NicRecvMeta, RawAddr, RecvPostError,
    RemoteSlice,
};
use crate::pkt::RawAddrHdr;
use crate::time::{ManualTimeProvider, TimeProvider};

/// Atomic operator codes understood by [`TestAmo`].
pub const AMO_WRITE: u32 = 0;
pub const AMO_SUM: u32 = 1;
/// Datatype codes: little-endian unsigned words.
pub const DT_U32: u32 = 0;
pub const DT_U64: u32 = 1;

struct HeldFrame {
    frame: Vec<u8>,
    meta: NicRecvMeta,
}

struct Node {
    locator: RawAddr,
    rx_queue: VecDeque<(u64, Box<[u8]>)>,
    rx_capacity: usize,
    cq: VecDeque<NicCompletion>,
    held: Vec<HeldFrame>,
    holding: bool,
    /// Pending forced RNR failures for frames sent *to* this node.
    force_rnr: usize,
    destroyed: bool,
}

#[derive(Default)]
struct FabricInner {
    nodes: HashMap<u32, Node>,
    regions: HashMap<u64, Vec<u8>>,
    /// Frames delivered so far, keyed by (destination qpn, wire type).
    delivered: HashMap<(u32, u8), usize>,
    next_qpn: u32,
    next_key: u64,
}

impl FabricInner {
    fn deliver(&mut self, dst_qpn: u32, frame: &[u8], meta: NicRecvMeta) -> Result<(), NicErrorKind> {
        let Some(dst) = self.nodes.get_mut(&dst_qpn) else {
            return Err(NicErrorKind::RemoteDestroyed);
        };
        if dst.destroyed {
            return Err(NicErrorKind::RemoteDestroyed);
        }
        if dst.force_rnr > 0 {
            dst.force_rnr -= 1;
            return Err(NicErrorKind::ReceiverNotReady);
        }
        if dst.holding {
            dst.held.push(HeldFrame {
                frame: frame.to_vec(),
                meta,
            });
            return Ok(());
        }
        let Some((wr_id, mut buf)) = dst.rx_queue.pop_front() else {
            return Err(NicErrorKind::ReceiverNotReady);
        };
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        dst.cq.push_back(NicCompletion::RecvOk {
            wr_id,
            buf,
            len,
            meta,
        });
        if let Some(&ptype) = frame.get(1) {
            *self.delivered.entry((dst_qpn, ptype)).or_insert(0) += 1;
        }
        Ok(())
    }
}

/// Shared in-process fabric.
#[derive(Clone, Default)]
pub struct TestFabric {
    inner: Arc<Mutex<FabricInner>>,
}

impl TestFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_nic(&self, rx_capacity: usize) -> (MockNic, NicDest) {
        let mut inner = self.inner.lock();
        inner.next_qpn += 1;
        let qpn = inner.next_qpn;
        let mut locator = RawAddr::default();
        locator.0[..4].copy_from_slice(&qpn.to_le_bytes());
        inner.nodes.insert(
            qpn,
            Node {
                locator,
                rx_queue: VecDeque::new(),
                rx_capacity,
                cq: VecDeque::new(),
                held: Vec::new(),
                holding: false,
                force_rnr: 0,
                destroyed: false,
            },
        );
        (
            MockNic {
                inner: self.inner.clone(),
                qpn,
            },
            NicDest { qpn, locator },
        )
    }

    /// Fail the next `count` frames sent to `dst` with receiver-not-ready.
    pub fn force_rnr(&self, dst: &NicDest, count: usize) {
        self.inner.lock().nodes.get_mut(&dst.qpn).unwrap().force_rnr = count;
    }

    /// Hold frames addressed to `dst` instead of delivering them.
    pub fn hold_delivery(&self, dst: &NicDest) {
        self.inner.lock().nodes.get_mut(&dst.qpn).unwrap().holding = true;
    }

    /// Replay held frames, optionally in reverse arrival order.
    pub fn release_held(&self, dst: &NicDest, reversed: bool) {
        let mut inner = self.inner.lock();
        let node = inner.nodes.get_mut(&dst.qpn).unwrap();
        node.holding = false;
        let mut held: Vec<HeldFrame> = node.held.drain(..).collect();
        if reversed {
            held.reverse();
        }
        for entry in held {
            let _ = inner.deliver(dst.qpn, &entry.frame, entry.meta);
        }
    }

    /// Tear a queue pair down; further sends to it report remote-destroyed.
    pub fn destroy(&self, dst: &NicDest) {
        self.inner.lock().nodes.get_mut(&dst.qpn).unwrap().destroyed = true;
    }

    /// Hand-deliver a raw frame, as if `src` had sent it.
    pub fn inject(&self, dst: &NicDest, src: &NicDest, frame: &[u8]) {
        let meta = NicRecvMeta {
            src_qpn: src.qpn,
            src_locator: src.locator,
        };
        let _ = self.inner.lock().deliver(dst.qpn, frame, meta);
    }

    /// How many frames of wire type `ptype` were delivered to `dst`.
    pub fn delivered_count(&self, dst: &NicDest, ptype: crate::pkt::PacketType) -> usize {
        self.inner
            .lock()
            .delivered
            .get(&(dst.qpn, ptype as u8))
            .copied()
            .unwrap_or(0)
    }

    pub fn mr_store(&self) -> TestMrStore {
        TestMrStore {
            inner: self.inner.clone(),
            cache_available: true,
        }
    }

    /// Create a registered region and return its key.
    pub fn create_region(&self, size: usize) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_key += 1;
        let key = inner.next_key;
        inner.regions.insert(key, vec![0u8; size]);
        key
    }

    pub fn region(&self, key: u64) -> Vec<u8> {
        self.inner.lock().regions.get(&key).cloned().unwrap_or_default()
    }

    pub fn write_region(&self, key: u64, offset: usize, data: &[u8]) {
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&key).expect("region");
        region[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// The mock datagram device: one queue pair on a [`TestFabric`].
pub struct MockNic {
    inner: Arc<Mutex<FabricInner>>,
    qpn: u32,
}

impl MockNic {
    pub fn qpn(&self) -> u32 {
        self.qpn
    }
}

impl NicDevice for MockNic {
    fn mtu(&self) -> usize {
        65536
    }

    fn max_outstanding_tx(&self) -> usize {
        256
    }

    fn max_rdma_size(&self) -> usize {
        1 << 30
    }

    fn supports_rdma_read(&self) -> bool {
        true
    }

    fn supports_rdma_write(&self) -> bool {
        true
    }

    fn configure_rnr_retry(&mut self, _retries: u8) {}

    fn post_send(&mut self, dest: &NicDest, wr_id: u64, frame: &[u8], _more: bool) -> RdmResult<()> {
        let mut inner = self.inner.lock();
        let meta = NicRecvMeta {
            src_qpn: self.qpn,
            src_locator: inner.nodes.get(&self.qpn).expect("own node").locator,
        };
        let outcome = inner.deliver(dest.qpn, frame, meta);
        let own = inner.nodes.get_mut(&self.qpn).expect("own node");
        match outcome {
            Ok(()) => own.cq.push_back(NicCompletion::SendOk { wr_id }),
            Err(err) => own.cq.push_back(NicCompletion::SendErr { wr_id, err }),
        }
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64, buf: Box<[u8]>) -> Result<(), RecvPostError> {
        let mut inner = self.inner.lock();
        let node = inner.nodes.get_mut(&self.qpn).expect("own node");
        if node.rx_queue.len() >= node.rx_capacity {
            return Err(RecvPostError::QueueFull(buf));
        }
        node.rx_queue.push_back((wr_id, buf));
        Ok(())
    }

    fn post_read(
        &mut self,
        _dest: Option<&NicDest>,
        wr_id: u64,
        remote: RemoteSlice,
        _more: bool,
    ) -> RdmResult<()> {
        let mut inner = self.inner.lock();
        let data = {
            let region = inner.regions.get(&remote.key).ok_or(RdmError::Invalid)?;
            let start = remote.addr as usize;
            let end = start + remote.len as usize;
            region.get(start..end).ok_or(RdmError::Invalid)?.to_vec()
        };
        let own = inner.nodes.get_mut(&self.qpn).expect("own node");
        own.cq.push_back(NicCompletion::ReadOk {
            wr_id,
            data: data.into_boxed_slice(),
        });
        Ok(())
    }

    fn post_write(
        &mut self,
        dest: &NicDest,
        wr_id: u64,
        data: &[u8],
        remote: RemoteSlice,
        imm: Option<u32>,
        _more: bool,
    ) -> RdmResult<()> {
        let mut inner = self.inner.lock();
        {
            let region = inner.regions.get_mut(&remote.key).ok_or(RdmError::Invalid)?;
            let start = remote.addr as usize;
            let end = start + data.len();
            region
                .get_mut(start..end)
                .ok_or(RdmError::Invalid)?
                .copy_from_slice(data);
        }
        if let Some(imm) = imm {
            let meta = NicRecvMeta {
                src_qpn: self.qpn,
                src_locator: inner.nodes.get(&self.qpn).expect("own node").locator,
            };
            if let Some(dst) = inner.nodes.get_mut(&dest.qpn) {
                if let Some((rx_wr, buf)) = dst.rx_queue.pop_front() {
                    dst.cq.push_back(NicCompletion::RecvRdmaImm {
                        wr_id: rx_wr,
                        buf,
                        imm,
                        meta,
                    });
                }
            }
        }
        let own = inner.nodes.get_mut(&self.qpn).expect("own node");
        own.cq.push_back(NicCompletion::WriteOk { wr_id });
        Ok(())
    }

    fn flush(&mut self) -> RdmResult<()> {
        Ok(())
    }

    fn poll_cq(&mut self) -> Option<NicCompletion> {
        self.inner.lock().nodes.get_mut(&self.qpn)?.cq.pop_front()
    }
}

/// Registration store backed by the fabric's shared region map.
pub struct TestMrStore {
    inner: Arc<Mutex<FabricInner>>,
    cache_available: bool,
}

impl TestMrStore {
    pub fn without_cache(mut self) -> Self {
        self.cache_available = false;
        self
    }
}

impl MrProvider for TestMrStore {
    fn cache_available(&self) -> bool {
        self.cache_available
    }

    fn register_bytes(&mut self, data: &[u8], _iface: MemIface) -> RdmResult<u64> {
        let mut inner = self.inner.lock();
        inner.next_key += 1;
        let key = inner.next_key;
        inner.regions.insert(key, data.to_vec());
        Ok(key)
    }

    fn deregister(&mut self, key: u64) {
        self.inner.lock().regions.remove(&key);
    }

    fn read(&self, key: u64, addr: u64, out: &mut [u8]) -> RdmResult<()> {
        let inner = self.inner.lock();
        let region = inner.regions.get(&key).ok_or(RdmError::Invalid)?;
        let start = addr as usize;
        let end = start + out.len();
        out.copy_from_slice(region.get(start..end).ok_or(RdmError::Invalid)?);
        Ok(())
    }

    fn write(&mut self, key: u64, addr: u64, data: &[u8]) -> RdmResult<()> {
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&key).ok_or(RdmError::Invalid)?;
        let start = addr as usize;
        let end = start + data.len();
        region
            .get_mut(start..end)
            .ok_or(RdmError::Invalid)?
            .copy_from_slice(data);
        Ok(())
    }

    fn with_mut(
        &mut self,
        key: u64,
        addr: u64,
        len: usize,
        f: &mut dyn FnMut(&mut [u8]) -> RdmResult<()>,
    ) -> RdmResult<()> {
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&key).ok_or(RdmError::Invalid)?;
        let start = addr as usize;
        let end = start + len;
        f(region.get_mut(start..end).ok_or(RdmError::Invalid)?)
    }
}

/// Simple address vector: handles are assigned by the test, reverse
/// lookup goes by queue pair number. Handles are cloneable so a test
/// can mutate the vector while the endpoint owns its copy.
#[derive(Clone)]
pub struct TestAv {
    inner: Arc<Mutex<AvInner>>,
}

struct AvInner {
    local: RawAddrHdr,
    by_addr: HashMap<Addr, NicDest>,
    by_qpn: HashMap<u32, Addr>,
    local_peers: Vec<Addr>,
    removed: Vec<Addr>,
    next_addr: u64,
}

impl TestAv {
    pub fn new(local_dest: NicDest) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AvInner {
                local: RawAddrHdr {
                    locator: local_dest.locator,
                    qpn: local_dest.qpn,
                    connid: local_dest.qpn,
                },
                by_addr: HashMap::new(),
                by_qpn: HashMap::new(),
                local_peers: Vec::new(),
                removed: Vec::new(),
                next_addr: 1000,
            })),
        }
    }

    pub fn add_peer(&self, addr: Addr, dest: NicDest) {
        let mut inner = self.inner.lock();
        inner.by_addr.insert(addr, dest);
        inner.by_qpn.insert(dest.qpn, addr);
    }

    pub fn mark_local(&self, addr: Addr) {
        self.inner.lock().local_peers.push(addr);
    }

    pub fn remove_peer(&self, addr: Addr) {
        self.inner.lock().removed.push(addr);
    }
}

impl AddressVector for TestAv {
    fn resolve(&self, addr: Addr) -> Option<NicDest> {
        let inner = self.inner.lock();
        if inner.removed.contains(&addr) {
            return None;
        }
        inner.by_addr.get(&addr).copied()
    }

    fn reverse_lookup(&self, qpn: u32, _locator: RawAddr, _connid: Option<u32>) -> Option<Addr> {
        let inner = self.inner.lock();
        let addr = *inner.by_qpn.get(&qpn)?;
        if inner.removed.contains(&addr) {
            return None;
        }
        Some(addr)
    }

    fn insert(&mut self, raw: &RawAddrHdr) -> RdmResult<Addr> {
        let mut inner = self.inner.lock();
        if let Some(&addr) = inner.by_qpn.get(&raw.qpn) {
            return Ok(addr);
        }
        inner.next_addr += 1;
        let addr = Addr(inner.next_addr);
        inner.by_addr.insert(
            addr,
            NicDest {
                qpn: raw.qpn,
                locator: raw.locator,
            },
        );
        inner.by_qpn.insert(raw.qpn, addr);
        Ok(addr)
    }

    fn local_raw(&self) -> RawAddrHdr {
        self.inner.lock().local
    }

    fn is_local(&self, addr: Addr) -> bool {
        self.inner.lock().local_peers.contains(&addr)
    }
}

/// Host-memory arithmetic for the operator codes above.
pub struct TestAmo;

fn word_size(dtype: u32) -> RdmResult<usize> {
    match dtype {
        DT_U32 => Ok(4),
        DT_U64 => Ok(8),
        _ => Err(RdmError::Invalid),
    }
}

fn load(word: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw[..word.len()].copy_from_slice(word);
    u64::from_le_bytes(raw)
}

fn store(word: &mut [u8], value: u64) {
    let raw = value.to_le_bytes();
    word.copy_from_slice(&raw[..word.len()]);
}

impl AtomicMath for TestAmo {
    fn write(&self, op: u32, dtype: u32, dst: &mut [u8], src: &[u8]) -> RdmResult<()> {
        let size = word_size(dtype)?;
        for (d, s) in dst.chunks_mut(size).zip(src.chunks(size)) {
            let value = match op {
                AMO_WRITE => load(s),
                AMO_SUM => load(d).wrapping_add(load(s)),
                _ => return Err(RdmError::Invalid),
            };
            store(d, value);
        }
        Ok(())
    }

    fn fetch(
        &self,
        op: u32,
        dtype: u32,
        dst: &mut [u8],
        src: &[u8],
        old_out: &mut [u8],
    ) -> RdmResult<()> {
        old_out.copy_from_slice(&dst[..old_out.len()]);
        self.write(op, dtype, dst, src)
    }

    fn compare(
        &self,
        _op: u32,
        dtype: u32,
        dst: &mut [u8],
        src: &[u8],
        cmp: &[u8],
        old_out: &mut [u8],
    ) -> RdmResult<()> {
        let size = word_size(dtype)?;
        for (((d, s), c), o) in dst
            .chunks_mut(size)
            .zip(src.chunks(size))
            .zip(cmp.chunks(size))
            .zip(old_out.chunks_mut(size))
        {
            let current = load(d);
            store(o, current);
            if current == load(c) {
                store(d, load(s));
            }
        }
        Ok(())
    }
}

/// Two endpoints wired back to back on one fabric.
pub struct TestPair {
    pub a: Endpoint,
    pub b: Endpoint,
    /// B as seen from A.
    pub b_addr: Addr,
    /// A as seen from B.
    pub a_addr: Addr,
    pub a_dest: NicDest,
    pub b_dest: NicDest,
    pub av_a: TestAv,
    pub av_b: TestAv,
    pub fabric: TestFabric,
    pub time: Arc<ManualTimeProvider>,
}

pub const ADDR_A: Addr = Addr(1);
pub const ADDR_B: Addr = Addr(2);

impl TestPair {
    pub fn new() -> Self {
        Self::with_configs(Config::default(), Config::default())
    }

    pub fn with_configs(cfg_a: Config, cfg_b: Config) -> Self {
        let fabric = TestFabric::new();
        let time: Arc<ManualTimeProvider> = Arc::new(ManualTimeProvider::new());

        let (nic_a, dest_a) = fabric.create_nic(cfg_a.rx_size);
        let (nic_b, dest_b) = fabric.create_nic(cfg_b.rx_size);

        let av_a = TestAv::new(dest_a);
        av_a.add_peer(ADDR_B, dest_b);
        let av_b = TestAv::new(dest_b);
        av_b.add_peer(ADDR_A, dest_a);

        let mut a = endpoint_with(&fabric, cfg_a, nic_a, av_a.clone(), time.clone());
        let mut b = endpoint_with(&fabric, cfg_b, nic_b, av_b.clone(), time.clone());
        // Arm both receive queues before any traffic.
        a.progress();
        b.progress();

        Self {
            a,
            b,
            b_addr: ADDR_B,
            a_addr: ADDR_A,
            a_dest: dest_a,
            b_dest: dest_b,
            av_a,
            av_b,
            fabric,
            time,
        }
    }

    /// Alternate progress on both sides until the fabric settles.
    pub fn pump(&mut self) {
        for _ in 0..64 {
            self.a.progress();
            self.b.progress();
        }
    }
}

impl Default for TestPair {
    fn default() -> Self {
        Self::new()
    }
}

pub fn endpoint_with(
    fabric: &TestFabric,
    cfg: Config,
    nic: MockNic,
    av: TestAv,
    time: Arc<dyn TimeProvider>,
) -> Endpoint {
    let domain = Arc::new(Domain::new(Box::new(fabric.mr_store())));
    Endpoint::new(
        cfg,
        Collaborators {
            nic: Box::new(nic),
            av: Box::new(av),
            domain,
            time,
            amo: Arc::new(TestAmo),
            shm: None,
            srx: None,
        },
    )
    .expect("endpoint construction")
}
