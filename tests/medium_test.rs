use rdm_endpoint::Config;
use rdm_endpoint::pkt::PacketType;
use rdm_endpoint::testing::TestPair;

fn medium_config() -> Config {
    Config {
        mtu_size: 4096,
        max_medium_msg_size: [65536, 65536],
        // Keep read protocols out of the picture.
        min_read_msg_size: [1 << 40, 1 << 40],
        ..Config::default()
    }
}

#[test]
fn medium_message_reassembles() {
    let mut pair = TestPair::with_configs(medium_config(), medium_config());
    let payload: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();

    pair.b.recv(vec![0u8; 20000], 1).unwrap();
    pair.a.send(pair.b_addr, payload.clone(), 2).unwrap();
    pair.pump();

    let fragments = pair
        .fabric
        .delivered_count(&pair.b_dest, PacketType::MediumMsgRtm);
    assert!(
        fragments > 1,
        "a 20000 byte message should need several fragments, got {fragments}"
    );

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, 20000);
    assert_eq!(recv.buf[0], payload);
    assert!(pair.b.pop_rx_completion().is_none(), "exactly one completion");

    let send = pair.a.pop_tx_completion().unwrap().unwrap();
    assert_eq!(send.len, 20000);
}

#[test]
fn medium_message_matches_after_posting() {
    let mut pair = TestPair::with_configs(medium_config(), medium_config());
    let payload: Vec<u8> = (0..9000u32).map(|i| (i % 13) as u8).collect();

    // Fragments land before any receive is posted.
    pair.a.send(pair.b_addr, payload.clone(), 2).unwrap();
    pair.pump();
    assert!(pair.b.pop_rx_completion().is_none());

    pair.b.recv(vec![0u8; 9000], 1).unwrap();
    pair.pump();
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, 9000);
    assert_eq!(recv.buf[0], payload);
}
