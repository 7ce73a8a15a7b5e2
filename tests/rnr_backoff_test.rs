use rdm_endpoint::testing::TestPair;
use rdm_endpoint::{Config, RdmError};

#[test]
fn rnr_packet_is_requeued_and_resent_after_backoff() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 64], 1).unwrap();

    // The device reports receiver-not-ready for the first frame.
    pair.fabric.force_rnr(&pair.b_dest, 1);
    pair.a.send(pair.b_addr, vec![7u8; 64], 2).unwrap();
    pair.a.progress();

    // The peer is now backing off; nothing is delivered yet and new
    // sends are refused outright.
    assert!(pair.a.pop_tx_completion().is_none());
    assert_eq!(
        pair.a.send(pair.b_addr, vec![8u8; 8], 3),
        Err(RdmError::TryAgain)
    );

    // Progress before the wait elapses must not resend.
    pair.a.progress();
    pair.b.progress();
    assert!(pair.b.pop_rx_completion().is_none());

    pair.time.advance_micros(Config::default().rnr_backoff_initial_wait);
    pair.pump();

    let send = pair.a.pop_tx_completion().unwrap().unwrap();
    assert_eq!(send.context, 2);
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, 64);
    assert_eq!(&recv.buf[0][..4], &[7, 7, 7, 7]);
}

#[test]
fn consecutive_rnr_doubles_the_wait() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 64], 1).unwrap();

    // First attempt and the retry both hit RNR.
    pair.fabric.force_rnr(&pair.b_dest, 2);
    pair.a.send(pair.b_addr, vec![1u8; 16], 2).unwrap();
    pair.a.progress();

    let initial = Config::default().rnr_backoff_initial_wait;
    pair.time.advance_micros(initial);
    pair.a.progress(); // resend, second RNR
    pair.a.progress(); // consume the error completion, double the wait

    // One initial wait is no longer enough.
    pair.time.advance_micros(initial);
    pair.pump();
    assert!(pair.b.pop_rx_completion().is_none());

    pair.time.advance_micros(initial);
    pair.pump();
    assert!(pair.b.pop_rx_completion().unwrap().is_ok());
}

#[test]
fn application_managed_mode_writes_one_error_per_operation() {
    let cfg = Config {
        provider_managed_resources: false,
        mtu_size: 4096,
        min_read_msg_size: [1 << 40, 1 << 40],
        ..Config::default()
    };
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);

    // A medium send posts several fragments; make them all fail.
    pair.fabric.force_rnr(&pair.b_dest, 16);
    pair.a
        .send(pair.b_addr, vec![3u8; 20000], 9)
        .unwrap();
    pair.pump();

    let err = pair.a.pop_tx_completion().unwrap().unwrap_err();
    assert_eq!(err.err, RdmError::Remote);
    assert_eq!(err.context, 9);
    assert!(
        pair.a.pop_tx_completion().is_none(),
        "at most one error completion per operation"
    );
}

#[test]
fn remote_destroyed_fails_the_operation() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 64], 1).unwrap();
    pair.fabric.destroy(&pair.b_dest);
    pair.a.send(pair.b_addr, vec![1u8; 8], 2).unwrap();
    pair.pump();

    let completion = pair.a.pop_tx_completion().unwrap();
    assert!(completion.is_err());
}

#[test]
fn completions_for_a_removed_peer_are_dropped() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 64], 1).unwrap();
    pair.a.send(pair.b_addr, vec![1u8; 8], 2).unwrap();
    // The peer leaves the address vector before the send completion is
    // drained; the completion is released silently.
    pair.av_a.remove_peer(pair.b_addr);
    pair.pump();

    assert!(pair.a.pop_tx_completion().is_none());
}
