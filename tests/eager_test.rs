use rdm_endpoint::cq::{CQ_MSG, CQ_RECV, CQ_TAGGED, CQ_TRANSMIT};
use rdm_endpoint::testing::TestPair;

#[test]
fn eager_tagged_send_recv() {
    let mut pair = TestPair::new();
    let payload: Vec<u8> = (0..128u32).map(|i| i as u8).collect();

    pair.b.trecv(vec![0u8; 128], 0x42, 0, 77).unwrap();
    pair.a.tsend(pair.b_addr, payload.clone(), 0x42, 55).unwrap();
    pair.pump();

    let send = pair.a.pop_tx_completion().unwrap().unwrap();
    assert!(send.flags.has(CQ_TRANSMIT));
    assert!(send.flags.has(CQ_MSG));
    assert!(send.flags.has(CQ_TAGGED));
    assert_eq!(send.len, 128);
    assert_eq!(send.context, 55);

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert!(recv.flags.has(CQ_RECV));
    assert!(recv.flags.has(CQ_MSG));
    assert!(recv.flags.has(CQ_TAGGED));
    assert_eq!(recv.len, 128);
    assert_eq!(recv.tag, 0x42);
    assert_eq!(recv.context, 77);
    assert_eq!(&recv.buf[0][..128], &payload[..]);

    assert!(pair.a.pop_tx_completion().is_none());
    assert!(pair.b.pop_rx_completion().is_none());
}

#[test]
fn untagged_send_matches_posted_recv() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 64], 1).unwrap();
    pair.a.send(pair.b_addr, b"hello".to_vec(), 2).unwrap();
    pair.pump();

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, 5);
    assert_eq!(&recv.buf[0][..5], b"hello");
}

#[test]
fn zero_length_send_completes() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 8], 1).unwrap();
    pair.a.send(pair.b_addr, Vec::new(), 2).unwrap();
    pair.pump();

    let send = pair.a.pop_tx_completion().unwrap().unwrap();
    assert_eq!(send.len, 0);
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, 0);
}

#[test]
fn inject_produces_no_completion() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 64], 1).unwrap();
    pair.a.inject(pair.b_addr, b"fire and forget").unwrap();
    pair.pump();

    assert!(pair.a.pop_tx_completion().is_none());
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(&recv.buf[0][..15], b"fire and forget");
}

#[test]
fn tag_mismatch_stays_unexpected() {
    let mut pair = TestPair::new();
    pair.b.trecv(vec![0u8; 64], 0x1, 0, 1).unwrap();
    pair.a.tsend(pair.b_addr, b"wrong tag".to_vec(), 0x2, 2).unwrap();
    pair.pump();

    // No match yet; the message waits in the unexpected queue.
    assert!(pair.b.pop_rx_completion().is_none());

    pair.b.trecv(vec![0u8; 64], 0x2, 0, 3).unwrap();
    pair.pump();
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.context, 3);
    assert_eq!(recv.tag, 0x2);
}

#[test]
fn ignore_mask_matches_wider_tags() {
    let mut pair = TestPair::new();
    pair.b.trecv(vec![0u8; 64], 0xa0, 0x0f, 9).unwrap();
    pair.a.tsend(pair.b_addr, b"masked".to_vec(), 0xa7, 1).unwrap();
    pair.pump();

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.context, 9);
    assert_eq!(recv.tag, 0xa7);
}
