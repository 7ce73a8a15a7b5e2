use rdm_endpoint::testing::TestPair;
use rdm_endpoint::{Config, RdmError};

#[test]
fn eager_truncation_reports_original_length() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 512], 1).unwrap();
    pair.a.send(pair.b_addr, vec![0xabu8; 1024], 2).unwrap();
    pair.pump();

    let err = pair.b.pop_rx_completion().unwrap().unwrap_err();
    assert_eq!(err.err, RdmError::Truncated);
    assert_eq!(err.olen, 1024);
    assert_eq!(err.len, 512);
    assert_eq!(&err.buf[0][..4], &[0xab; 4]);
    assert!(
        pair.b.pop_rx_completion().is_none(),
        "no second completion for the truncated receive"
    );

    // The sender is unaffected.
    assert!(pair.a.pop_tx_completion().unwrap().is_ok());
}

#[test]
fn medium_truncation_clips_but_counts_everything() {
    let cfg = Config {
        mtu_size: 4096,
        min_read_msg_size: [1 << 40, 1 << 40],
        ..Config::default()
    };
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    pair.b.recv(vec![0u8; 6000], 1).unwrap();
    pair.a.send(pair.b_addr, vec![5u8; 20000], 2).unwrap();
    pair.pump();

    let err = pair.b.pop_rx_completion().unwrap().unwrap_err();
    assert_eq!(err.err, RdmError::Truncated);
    assert_eq!(err.olen, 20000);
    assert_eq!(err.len, 6000);
}

#[test]
fn exact_fit_is_not_truncated() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 256], 1).unwrap();
    pair.a.send(pair.b_addr, vec![1u8; 256], 2).unwrap();
    pair.pump();
    assert!(pair.b.pop_rx_completion().unwrap().is_ok());
}
