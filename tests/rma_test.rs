use smallvec::SmallVec;
use rdm_endpoint::cq::{CQ_REMOTE_WRITE, CQ_RMA, CQ_WRITE};
use rdm_endpoint::ope::OP_COMPLETION;
use rdm_endpoint::testing::TestPair;
use rdm_endpoint::{Config, DataVec, OpFlags, RemoteSlice, RmaDesc};

#[test]
fn eager_write_lands_in_the_target_region() {
    let mut pair = TestPair::new();
    let key = pair.fabric.create_region(256);

    pair.a
        .write(
            pair.b_addr,
            vec![0x5a; 100],
            RemoteSlice {
                addr: 16,
                len: 100,
                key,
            },
            1,
        )
        .unwrap();
    pair.pump();

    let send = pair.a.pop_tx_completion().unwrap().unwrap();
    assert!(send.flags.has(CQ_RMA));
    assert!(send.flags.has(CQ_WRITE));

    let region = pair.fabric.region(key);
    assert_eq!(&region[16..116], &[0x5a; 100][..]);
    assert_eq!(region[0], 0, "bytes before the slice untouched");
    assert_eq!(region[116], 0, "bytes after the slice untouched");
}

#[test]
fn write_with_cq_data_raises_a_remote_completion() {
    let mut pair = TestPair::new();
    let key = pair.fabric.create_region(64);
    let mut iov = DataVec::new();
    iov.push(vec![1u8; 32]);
    let mut rma_iov = rdm_endpoint::pkt::RmaVec::new();
    rma_iov.push(RemoteSlice {
        addr: 0,
        len: 32,
        key,
    });
    pair.a
        .writemsg(RmaDesc {
            addr: pair.b_addr,
            iov,
            desc: SmallVec::new(),
            rma_iov,
            context: 3,
            cq_data: Some(0xbeef),
            flags: OpFlags(OP_COMPLETION),
        })
        .unwrap();
    pair.pump();

    let remote = pair.b.pop_rx_completion().unwrap().unwrap();
    assert!(remote.flags.has(CQ_REMOTE_WRITE));
    assert_eq!(remote.data, Some(0xbeef));
}

#[test]
fn large_write_streams_through_the_window() {
    let cfg = Config {
        // No device write path, no read-based write: exercise CTS data.
        use_device_rdma: false,
        ..Config::default()
    };
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    let len = 200 * 1024;
    let key = pair.fabric.create_region(len);
    let payload: Vec<u8> = (0..len).map(|i| (i % 163) as u8).collect();

    pair.a
        .write(
            pair.b_addr,
            payload.clone(),
            RemoteSlice {
                addr: 0,
                len: len as u64,
                key,
            },
            1,
        )
        .unwrap();
    for _ in 0..256 {
        pair.a.progress();
        pair.b.progress();
    }

    assert!(pair.a.pop_tx_completion().unwrap().is_ok());
    assert_eq!(pair.fabric.region(key), payload);
}

#[test]
fn device_write_is_used_once_capabilities_are_known() {
    let mut pair = TestPair::new();
    let key = pair.fabric.create_region(4096);

    // Bootstrap a handshake with ordinary traffic.
    pair.b.recv(vec![0u8; 8], 0).unwrap();
    pair.a.send(pair.b_addr, vec![0u8; 8], 0).unwrap();
    pair.pump();

    pair.a
        .write(
            pair.b_addr,
            vec![9u8; 4096],
            RemoteSlice {
                addr: 0,
                len: 4096,
                key,
            },
            1,
        )
        .unwrap();
    pair.pump();

    assert!(pair.a.pop_tx_completion().unwrap().is_ok());
    assert_eq!(pair.fabric.region(key), vec![9u8; 4096]);
}
