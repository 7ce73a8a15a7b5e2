use rdm_endpoint::Config;
use rdm_endpoint::pkt::PacketType;
use rdm_endpoint::testing::TestPair;

fn read_config(runt: usize) -> Config {
    Config {
        min_read_msg_size: [16384, 16384],
        runt_size: [runt, runt],
        ..Config::default()
    }
}

#[test]
fn long_message_moves_by_receiver_read() {
    // Runting disabled: the pure read protocol.
    let cfg = read_config(0);
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    let len = 64 * 1024;
    let payload: Vec<u8> = (0..len).map(|i| (i % 149) as u8).collect();

    // Bootstrap capabilities first; read protocols are gated on them.
    pair.b.recv(vec![0u8; 4], 0).unwrap();
    pair.a.send(pair.b_addr, vec![0u8; 4], 0).unwrap();
    pair.pump();
    pair.b.pop_rx_completion();
    pair.a.pop_tx_completion();

    pair.b.recv(vec![0u8; len], 1).unwrap();
    pair.a.send(pair.b_addr, payload.clone(), 2).unwrap();
    pair.pump();

    assert_eq!(
        pair.fabric
            .delivered_count(&pair.b_dest, PacketType::LongReadMsgRtm),
        1
    );
    assert_eq!(
        pair.fabric.delivered_count(&pair.a_dest, PacketType::Eor),
        1,
        "receiver signals end of read"
    );

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, len as u64);
    assert_eq!(recv.buf[0], payload);
    let send = pair.a.pop_tx_completion().unwrap().unwrap();
    assert_eq!(send.len, len as u64);
}

#[test]
fn runting_read_sends_a_prefix_inline() {
    let cfg = read_config(8192);
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    let len = 64 * 1024;
    let payload: Vec<u8> = (0..len).map(|i| (i % 211) as u8).collect();

    pair.b.recv(vec![0u8; 4], 0).unwrap();
    pair.a.send(pair.b_addr, vec![0u8; 4], 0).unwrap();
    pair.pump();
    pair.b.pop_rx_completion();
    pair.a.pop_tx_completion();

    pair.b.recv(vec![0u8; len], 1).unwrap();
    pair.a.send(pair.b_addr, payload.clone(), 2).unwrap();
    pair.pump();

    assert!(
        pair.fabric
            .delivered_count(&pair.b_dest, PacketType::RuntReadMsgRtm)
            >= 1,
        "inline runt fragments"
    );

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.buf[0], payload);
    assert!(pair.a.pop_tx_completion().unwrap().is_ok());
}

#[test]
fn first_send_to_unknown_peer_falls_back_from_read() {
    // Without a handshake the read protocols cannot be chosen; the send
    // is still accepted and flows through a baseline protocol.
    let cfg = read_config(0);
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    let len = 32 * 1024;

    pair.b.recv(vec![0u8; len], 1).unwrap();
    let res = pair.a.send(pair.b_addr, vec![3u8; len], 2);
    // Either refused with try-again (handshake pending) or accepted via
    // a baseline protocol; in both cases the retry below must finish.
    if res.is_err() {
        pair.pump();
        pair.a.send(pair.b_addr, vec![3u8; len], 2).unwrap();
    }
    pair.pump();
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, len as u64);
}
