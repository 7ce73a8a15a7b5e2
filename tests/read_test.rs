use rdm_endpoint::cq::{CQ_READ, CQ_RMA};
use rdm_endpoint::testing::TestPair;
use rdm_endpoint::{Config, RdmError, RemoteSlice};

#[test]
fn device_read_needs_a_handshake_first() {
    let mut pair = TestPair::new();
    let key = pair.fabric.create_region(128);
    pair.fabric.write_region(key, 0, &[7u8; 128]);

    let remote = RemoteSlice {
        addr: 0,
        len: 128,
        key,
    };
    // Capabilities unknown: the read is refused and a handshake probe
    // goes out instead.
    assert_eq!(
        pair.a.read(pair.b_addr, vec![0u8; 128], remote, 1),
        Err(RdmError::TryAgain)
    );
    pair.pump();

    // Now the capabilities are known and the read goes through.
    pair.a.read(pair.b_addr, vec![0u8; 128], remote, 2).unwrap();
    pair.pump();

    let done = pair.a.pop_tx_completion().unwrap().unwrap();
    assert!(done.flags.has(CQ_RMA));
    assert!(done.flags.has(CQ_READ));
    assert_eq!(done.len, 128);
    assert_eq!(&done.buf[0][..], &[7u8; 128][..]);
}

#[test]
fn emulated_read_pulls_through_the_responder() {
    let cfg = Config {
        use_device_rdma: false,
        ..Config::default()
    };
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    let key = pair.fabric.create_region(512);
    let pattern: Vec<u8> = (0..512u32).map(|i| (i % 127) as u8).collect();
    pair.fabric.write_region(key, 0, &pattern);

    pair.a
        .read(
            pair.b_addr,
            vec![0u8; 512],
            RemoteSlice {
                addr: 0,
                len: 512,
                key,
            },
            5,
        )
        .unwrap();
    pair.pump();

    let done = pair.a.pop_tx_completion().unwrap().unwrap();
    assert_eq!(done.context, 5);
    assert_eq!(done.buf[0], pattern);
}

#[test]
fn emulated_read_of_a_large_region_uses_windowed_data() {
    let cfg = Config {
        use_device_rdma: false,
        cts_window_size: 32 * 1024,
        ..Config::default()
    };
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    let len = 120 * 1024;
    let key = pair.fabric.create_region(len);
    let pattern: Vec<u8> = (0..len).map(|i| (i % 173) as u8).collect();
    pair.fabric.write_region(key, 0, &pattern);

    pair.a
        .read(
            pair.b_addr,
            vec![0u8; len],
            RemoteSlice {
                addr: 0,
                len: len as u64,
                key,
            },
            6,
        )
        .unwrap();
    for _ in 0..256 {
        pair.a.progress();
        pair.b.progress();
    }

    let done = pair.a.pop_tx_completion().unwrap().unwrap();
    assert_eq!(done.buf[0], pattern);
}
