use rdm_endpoint::Config;
use rdm_endpoint::testing::TestPair;

fn zcpy_config() -> Config {
    Config {
        use_zcpy_rx: true,
        ..Config::default()
    }
}

#[test]
fn eager_message_lands_in_the_posted_user_buffer() {
    let mut pair = TestPair::with_configs(Config::default(), zcpy_config());
    let first: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    let second = vec![0x6au8; 100];

    // The pre-armed internal control buffer is first in the queue, so
    // the first message arrives through the copy path; everything after
    // that lands straight in user buffers.
    pair.b.recv(vec![0u8; 4096], 11).unwrap();
    pair.a.send(pair.b_addr, first.clone(), 1).unwrap();
    pair.pump();
    assert!(pair.b.pop_rx_completion().is_none());

    pair.b.recv(vec![0u8; 4096], 12).unwrap();
    pair.pump();
    let copied = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(copied.context, 12);
    assert_eq!(&copied.buf[0][..200], &first[..]);

    pair.a.send(pair.b_addr, second.clone(), 2).unwrap();
    pair.pump();
    let zero_copy = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(zero_copy.context, 11);
    assert_eq!(zero_copy.len, 100);
    assert_eq!(&zero_copy.buf[0][..100], &second[..]);
}

#[test]
fn control_traffic_survives_without_user_buffers() {
    // With zero-copy receive enabled and no user receive posted, the
    // single internal buffer must still absorb control packets.
    let mut pair = TestPair::with_configs(Config::default(), zcpy_config());

    let key = pair.fabric.create_region(64);
    pair.a
        .write(
            pair.b_addr,
            vec![4u8; 64],
            rdm_endpoint::RemoteSlice {
                addr: 0,
                len: 64,
                key,
            },
            1,
        )
        .unwrap();
    pair.pump();

    assert!(pair.a.pop_tx_completion().unwrap().is_ok());
    assert_eq!(pair.fabric.region(key), vec![4u8; 64]);
}

#[test]
fn user_buffer_is_rearmed_after_control_packets() {
    let mut pair = TestPair::with_configs(Config::default(), zcpy_config());

    pair.b.recv(vec![0u8; 4096], 5).unwrap();
    // A write request consumes the internal buffer, and the handshake
    // traffic it provokes runs through the user buffer, which must be
    // reposted and still catch the following message.
    let key = pair.fabric.create_region(16);
    pair.a
        .write(
            pair.b_addr,
            vec![1u8; 16],
            rdm_endpoint::RemoteSlice {
                addr: 0,
                len: 16,
                key,
            },
            1,
        )
        .unwrap();
    pair.pump();

    pair.a.send(pair.b_addr, vec![6u8; 100], 2).unwrap();
    pair.pump();

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.context, 5);
    assert_eq!(&recv.buf[0][..4], &[6, 6, 6, 6]);
}
