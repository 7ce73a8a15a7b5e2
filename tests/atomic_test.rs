use rdm_endpoint::cq::{CQ_ATOMIC, CQ_READ, CQ_WRITE};
use rdm_endpoint::ope::{OP_COMPLETION, OP_DELIVERY_COMPLETE};
use rdm_endpoint::testing::{AMO_SUM, AMO_WRITE, DT_U64, TestPair};
use rdm_endpoint::{AtomicDesc, OpFlags, RemoteSlice};

fn atomic_desc(pair: &TestPair, key: u64, op: u32, operand: Vec<u8>) -> AtomicDesc {
    let mut rma_iov = rdm_endpoint::pkt::RmaVec::new();
    rma_iov.push(RemoteSlice {
        addr: 0,
        len: operand.len() as u64,
        key,
    });
    AtomicDesc {
        addr: pair.b_addr,
        op,
        dtype: DT_U64,
        operand,
        compare: None,
        result: None,
        rma_iov,
        context: 1,
        flags: OpFlags(OP_COMPLETION),
    }
}

#[test]
fn atomic_sum_applies_to_remote_memory() {
    let mut pair = TestPair::new();
    let key = pair.fabric.create_region(8);
    pair.fabric.write_region(key, 0, &100u64.to_le_bytes());

    pair.a
        .atomic(atomic_desc(&pair, key, AMO_SUM, 23u64.to_le_bytes().to_vec()))
        .unwrap();
    pair.pump();

    let done = pair.a.pop_tx_completion().unwrap().unwrap();
    assert!(done.flags.has(CQ_WRITE));
    assert!(done.flags.has(CQ_ATOMIC));

    let region = pair.fabric.region(key);
    assert_eq!(u64::from_le_bytes(region[..8].try_into().unwrap()), 123);
}

#[test]
fn atomic_fetch_returns_the_previous_value() {
    let mut pair = TestPair::new();
    let key = pair.fabric.create_region(8);
    pair.fabric.write_region(key, 0, &55u64.to_le_bytes());

    let mut desc = atomic_desc(&pair, key, AMO_SUM, 10u64.to_le_bytes().to_vec());
    desc.result = Some(vec![0u8; 8]);
    pair.a.atomic(desc).unwrap();
    pair.pump();

    let done = pair.a.pop_tx_completion().unwrap().unwrap();
    assert!(done.flags.has(CQ_READ));
    assert!(done.flags.has(CQ_ATOMIC));
    let result = done.buf.last().unwrap();
    assert_eq!(u64::from_le_bytes(result[..8].try_into().unwrap()), 55);

    let region = pair.fabric.region(key);
    assert_eq!(u64::from_le_bytes(region[..8].try_into().unwrap()), 65);
}

#[test]
fn atomic_compare_swaps_only_on_match() {
    let mut pair = TestPair::new();
    let key = pair.fabric.create_region(8);
    pair.fabric.write_region(key, 0, &7u64.to_le_bytes());

    // Matching compare: swapped.
    let mut desc = atomic_desc(&pair, key, AMO_WRITE, 42u64.to_le_bytes().to_vec());
    desc.compare = Some(7u64.to_le_bytes().to_vec());
    desc.result = Some(vec![0u8; 8]);
    pair.a.atomic(desc).unwrap();
    pair.pump();

    let done = pair.a.pop_tx_completion().unwrap().unwrap();
    let old = done.buf.last().unwrap();
    assert_eq!(u64::from_le_bytes(old[..8].try_into().unwrap()), 7);
    let region = pair.fabric.region(key);
    assert_eq!(u64::from_le_bytes(region[..8].try_into().unwrap()), 42);

    // Mismatching compare: untouched.
    let mut desc = atomic_desc(&pair, key, AMO_WRITE, 99u64.to_le_bytes().to_vec());
    desc.compare = Some(1u64.to_le_bytes().to_vec());
    desc.result = Some(vec![0u8; 8]);
    pair.a.atomic(desc).unwrap();
    pair.pump();
    pair.a.pop_tx_completion().unwrap().unwrap();
    let region = pair.fabric.region(key);
    assert_eq!(u64::from_le_bytes(region[..8].try_into().unwrap()), 42);
}

#[test]
fn delivery_complete_atomic_waits_for_the_receipt() {
    let mut pair = TestPair::new();
    let key = pair.fabric.create_region(8);

    let mut desc = atomic_desc(&pair, key, AMO_SUM, 5u64.to_le_bytes().to_vec());
    desc.flags = OpFlags(OP_COMPLETION | OP_DELIVERY_COMPLETE);
    // Capabilities unknown: refused, handshake provoked.
    assert!(pair.a.atomic(desc).is_err());
    pair.pump();

    let mut desc = atomic_desc(&pair, key, AMO_SUM, 5u64.to_le_bytes().to_vec());
    desc.flags = OpFlags(OP_COMPLETION | OP_DELIVERY_COMPLETE);
    pair.a.atomic(desc).unwrap();
    pair.pump();

    assert!(pair.a.pop_tx_completion().unwrap().is_ok());
    let region = pair.fabric.region(key);
    assert_eq!(u64::from_le_bytes(region[..8].try_into().unwrap()), 5);
}
