use rdm_endpoint::Config;
use rdm_endpoint::pkt::PacketType;
use rdm_endpoint::testing::TestPair;

fn longcts_config() -> Config {
    Config {
        // Force the windowed protocol for everything beyond medium.
        min_read_msg_size: [1 << 40, 1 << 40],
        max_medium_msg_size: [65536, 65536],
        cts_window_size: 1 << 20,
        ..Config::default()
    }
}

fn pump_many(pair: &mut TestPair, rounds: usize) {
    for _ in 0..rounds {
        pair.a.progress();
        pair.b.progress();
    }
}

#[test]
fn eight_mib_flows_in_window_bursts() {
    let mut pair = TestPair::with_configs(longcts_config(), longcts_config());
    let len = 8 << 20;
    let payload: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();

    pair.b.recv(vec![0u8; len], 1).unwrap();
    pair.a.send(pair.b_addr, payload.clone(), 2).unwrap();
    pump_many(&mut pair, 512);

    assert_eq!(
        pair.fabric
            .delivered_count(&pair.b_dest, PacketType::LongCtsMsgRtm),
        1,
        "one announcement packet"
    );
    assert_eq!(
        pair.fabric.delivered_count(&pair.a_dest, PacketType::Cts),
        8,
        "one window grant per MiB"
    );

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, len as u64);
    assert_eq!(recv.buf[0], payload);
    assert!(pair.b.pop_rx_completion().is_none());

    let send = pair.a.pop_tx_completion().unwrap().unwrap();
    assert_eq!(send.len, len as u64);
    assert!(pair.a.pop_tx_completion().is_none());
}

#[test]
fn data_within_a_message_is_placed_by_offset() {
    // Smaller transfer; still two windows to cross a CTS boundary.
    let cfg = Config {
        cts_window_size: 64 * 1024,
        ..longcts_config()
    };
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    let len = 150 * 1024;
    let payload: Vec<u8> = (0..len).map(|i| (i % 131) as u8).collect();

    pair.b.recv(vec![0u8; len], 1).unwrap();
    pair.a.send(pair.b_addr, payload.clone(), 2).unwrap();
    pump_many(&mut pair, 256);

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.buf[0], payload);
}

#[test]
fn longcts_waits_for_matching_receive() {
    let mut pair = TestPair::with_configs(longcts_config(), longcts_config());
    let len = 256 * 1024;
    let payload: Vec<u8> = (0..len).map(|i| (i % 101) as u8).collect();

    pair.a.send(pair.b_addr, payload.clone(), 2).unwrap();
    pump_many(&mut pair, 64);
    assert!(pair.b.pop_rx_completion().is_none());
    assert!(pair.a.pop_tx_completion().is_none(), "no data flowed yet");

    pair.b.recv(vec![0u8; len], 1).unwrap();
    pump_many(&mut pair, 256);
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.buf[0], payload);
    assert!(pair.a.pop_tx_completion().unwrap().is_ok());
}
