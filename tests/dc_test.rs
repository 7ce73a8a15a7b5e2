use smallvec::SmallVec;
use rdm_endpoint::ope::{OP_COMPLETION, OP_DELIVERY_COMPLETE};
use rdm_endpoint::pkt::PacketType;
use rdm_endpoint::testing::TestPair;
use rdm_endpoint::{DataVec, OpFlags, RdmError, SendDesc};

fn dc_send(pair: &TestPair, payload: Vec<u8>, context: u64) -> SendDesc {
    let mut iov = DataVec::new();
    iov.push(payload);
    SendDesc {
        addr: pair.b_addr,
        iov,
        desc: SmallVec::new(),
        context,
        cq_data: None,
        tag: None,
        flags: OpFlags(OP_COMPLETION | OP_DELIVERY_COMPLETE),
    }
}

#[test]
fn delivery_complete_needs_known_capabilities() {
    let mut pair = TestPair::new();
    assert_eq!(
        pair.a.sendmsg(dc_send(&pair, vec![1u8; 32], 1)),
        Err(RdmError::TryAgain),
        "unknown peer capabilities defer the send"
    );
    // A handshake probe went out instead of the message.
    pair.pump();

    pair.b.recv(vec![0u8; 32], 2).unwrap();
    pair.a.sendmsg(dc_send(&pair, vec![1u8; 32], 1)).unwrap();
    pair.pump();

    assert_eq!(
        pair.fabric
            .delivered_count(&pair.b_dest, PacketType::DcEagerMsgRtm),
        1
    );
    assert_eq!(
        pair.fabric
            .delivered_count(&pair.a_dest, PacketType::Receipt),
        1,
        "the receiver acknowledges delivery"
    );
    assert!(pair.a.pop_tx_completion().unwrap().is_ok());
    assert!(pair.b.pop_rx_completion().unwrap().is_ok());
}

#[test]
fn failed_dispatch_leaves_the_message_id_alone() {
    let mut pair = TestPair::new();
    // Two refused attempts, then two successful sends: the receiver
    // must still see them in order with no gap.
    let _ = pair.a.sendmsg(dc_send(&pair, vec![1u8; 8], 1));
    let _ = pair.a.sendmsg(dc_send(&pair, vec![1u8; 8], 1));
    pair.pump();

    pair.b.recv(vec![0u8; 8], 1).unwrap();
    pair.b.recv(vec![0u8; 8], 2).unwrap();
    pair.a.send(pair.b_addr, vec![3u8; 8], 3).unwrap();
    pair.a.send(pair.b_addr, vec![4u8; 8], 4).unwrap();
    pair.pump();

    let first = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(first.buf[0][0], 3);
    let second = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(second.buf[0][0], 4);
}

#[test]
fn dc_medium_message_completes_after_receipt() {
    let cfg = rdm_endpoint::Config {
        mtu_size: 4096,
        min_read_msg_size: [1 << 40, 1 << 40],
        ..rdm_endpoint::Config::default()
    };
    let mut pair = TestPair::with_configs(cfg.clone(), cfg);
    // Bootstrap capabilities.
    pair.b.recv(vec![0u8; 4], 0).unwrap();
    pair.a.send(pair.b_addr, vec![0u8; 4], 0).unwrap();
    pair.pump();
    pair.b.pop_rx_completion();
    pair.a.pop_tx_completion();

    let payload: Vec<u8> = (0..20000u32).map(|i| (i % 7) as u8).collect();
    pair.b.recv(vec![0u8; 20000], 1).unwrap();
    let mut msg = dc_send(&pair, payload.clone(), 2);
    msg.addr = pair.b_addr;
    pair.a.sendmsg(msg).unwrap();
    pair.pump();

    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.buf[0], payload);
    assert!(pair.a.pop_tx_completion().unwrap().is_ok());
}
