use rdm_endpoint::testing::TestPair;

#[test]
fn messages_complete_in_submission_order() {
    let mut pair = TestPair::new();
    for i in 0..8u64 {
        pair.b.recv(vec![0u8; 8], i).unwrap();
    }
    for i in 0..8u8 {
        pair.a.send(pair.b_addr, vec![i; 8], u64::from(i)).unwrap();
    }
    pair.pump();

    for i in 0..8u8 {
        let recv = pair.b.pop_rx_completion().unwrap().unwrap();
        assert_eq!(recv.buf[0][0], i, "receive {i} out of order");
    }
}

#[test]
fn reordered_delivery_is_straightened_out() {
    let mut pair = TestPair::new();
    for i in 0..4u64 {
        pair.b.recv(vec![0u8; 8], i).unwrap();
    }

    // Hold the wire, send four messages, then replay them backwards.
    pair.fabric.hold_delivery(&pair.b_dest);
    for i in 0..4u8 {
        pair.a.send(pair.b_addr, vec![i; 8], u64::from(i)).unwrap();
        pair.a.progress();
    }
    pair.fabric.release_held(&pair.b_dest, true);
    pair.pump();

    for i in 0..4u8 {
        let recv = pair.b.pop_rx_completion().unwrap().unwrap();
        assert_eq!(recv.buf[0][0], i, "receive {i} out of order after replay");
    }
}

#[test]
fn interleaved_protocols_keep_message_order() {
    // A small eager message submitted after a medium one must not
    // complete first.
    let cfg = rdm_endpoint::Config {
        mtu_size: 4096,
        min_read_msg_size: [1 << 40, 1 << 40],
        ..rdm_endpoint::Config::default()
    };
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    pair.b.recv(vec![0u8; 20000], 0).unwrap();
    pair.b.recv(vec![0u8; 20000], 1).unwrap();

    pair.a.send(pair.b_addr, vec![1u8; 20000], 0).unwrap();
    pair.a.send(pair.b_addr, vec![2u8; 64], 1).unwrap();
    pair.pump();

    let first = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(first.len, 20000);
    let second = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(second.len, 64);
}
