use smallvec::SmallVec;
use rdm_endpoint::cq::CQ_MULTI_RECV;
use rdm_endpoint::ope::{OP_COMPLETION, OP_MULTI_RECV};
use rdm_endpoint::testing::TestPair;
use rdm_endpoint::{Config, DataVec, OpFlags, RecvDesc};

fn multi_recv(buf_len: usize, context: u64) -> RecvDesc {
    let mut iov = DataVec::new();
    iov.push(vec![0u8; buf_len]);
    RecvDesc {
        addr: None,
        iov,
        desc: SmallVec::new(),
        context,
        tag: 0,
        ignore: !0,
        flags: OpFlags(OP_COMPLETION | OP_MULTI_RECV),
    }
}

fn small_min_multi() -> Config {
    Config {
        min_multi_recv_size: 64,
        ..Config::default()
    }
}

#[test]
fn several_messages_share_one_buffer() {
    let cfg = small_min_multi();
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    pair.b.recvmsg(multi_recv(1024, 42)).unwrap();

    for i in 0..3u8 {
        pair.a.send(pair.b_addr, vec![i + 1; 100], u64::from(i)).unwrap();
    }
    pair.pump();

    for i in 0..3u8 {
        let recv = pair.b.pop_rx_completion().unwrap().unwrap();
        assert_eq!(recv.context, 42, "consumers report the posted context");
        assert_eq!(recv.len, 100);
        assert_eq!(recv.buf[0][0], i + 1);
    }
}

#[test]
fn final_consumer_carries_the_buffer_released_flag() {
    let cfg = small_min_multi();
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    pair.b.recvmsg(multi_recv(256, 1)).unwrap();

    // Two messages of 100 bytes leave 56 < 64 bytes: buffer retired.
    pair.a.send(pair.b_addr, vec![1u8; 100], 0).unwrap();
    pair.a.send(pair.b_addr, vec![2u8; 100], 1).unwrap();
    pair.pump();

    let first = pair.b.pop_rx_completion().unwrap().unwrap();
    assert!(!first.flags.has(CQ_MULTI_RECV));
    let second = pair.b.pop_rx_completion().unwrap().unwrap();
    assert!(
        second.flags.has(CQ_MULTI_RECV),
        "last consumer signals the buffer release"
    );
}

#[test]
fn multi_recv_drains_the_unexpected_queue() {
    let cfg = small_min_multi();
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);

    pair.a.send(pair.b_addr, vec![9u8; 80], 0).unwrap();
    pair.pump();
    assert!(pair.b.pop_rx_completion().is_none());

    pair.b.recvmsg(multi_recv(512, 7)).unwrap();
    pair.pump();
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, 80);
    assert_eq!(recv.buf[0][0], 9);
}

#[test]
fn undersized_multi_recv_buffer_is_rejected() {
    let cfg = small_min_multi();
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    assert!(pair.b.recvmsg(multi_recv(32, 1)).is_err());
}
