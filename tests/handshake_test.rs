use rdm_endpoint::pkt::PacketType;
use rdm_endpoint::testing::TestPair;

#[test]
fn first_received_packet_provokes_a_handshake() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 16], 1).unwrap();
    pair.a.send(pair.b_addr, vec![1u8; 16], 2).unwrap();
    pair.pump();

    assert_eq!(
        pair.fabric
            .delivered_count(&pair.a_dest, PacketType::Handshake),
        1,
        "receiver answers the first packet with its capabilities"
    );
}

#[test]
fn duplicate_handshake_is_idempotent() {
    let mut pair = TestPair::new();
    pair.b.recv(vec![0u8; 16], 1).unwrap();
    pair.a.send(pair.b_addr, vec![1u8; 16], 2).unwrap();
    pair.pump();

    // Replay B's handshake at A by hand; nothing should change and
    // traffic keeps flowing.
    let mut frame = vec![0u8; 64];
    let body = rdm_endpoint::pkt::PktBody::Handshake {
        nextra_p3: 64,
        features: !0,
        host_id: None,
    };
    let len = rdm_endpoint::pkt::encode_header(
        &mut frame,
        PacketType::Handshake,
        &rdm_endpoint::pkt::OptHdrs::default(),
        &body,
    )
    .unwrap();
    pair.fabric.inject(&pair.a_dest, &pair.b_dest, &frame[..len]);
    pair.fabric.inject(&pair.a_dest, &pair.b_dest, &frame[..len]);
    pair.pump();

    pair.b.recv(vec![0u8; 16], 3).unwrap();
    pair.a.send(pair.b_addr, vec![2u8; 16], 4).unwrap();
    pair.pump();
    assert!(pair.b.pop_rx_completion().unwrap().is_ok());
    assert!(pair.a.pop_event().is_none());
}

#[test]
fn stale_protocol_version_is_fatal() {
    let mut pair = TestPair::new();
    // version 3 frame, eager message type
    let frame = [3u8, PacketType::EagerMsgRtm as u8, 0, 0, 0, 0, 0, 0];
    pair.fabric.inject(&pair.b_dest, &pair.a_dest, &frame);
    pair.b.progress();

    let event = pair.b.pop_event().expect("fatal endpoint event");
    assert!(event.fatal);
}

#[test]
fn retired_packet_type_is_fatal() {
    let mut pair = TestPair::new();
    let frame = [4u8, 8, 0, 0]; // retired request-to-send
    pair.fabric.inject(&pair.b_dest, &pair.a_dest, &frame);
    pair.b.progress();

    let event = pair.b.pop_event().expect("fatal endpoint event");
    assert!(event.fatal);

    // The endpoint refuses further work.
    assert!(pair.b.recv(vec![0u8; 8], 1).is_err());
}

#[test]
fn unknown_packet_type_is_an_event_but_not_fatal() {
    let mut pair = TestPair::new();
    let frame = [4u8, 200, 0, 0];
    pair.fabric.inject(&pair.b_dest, &pair.a_dest, &frame);
    pair.b.progress();

    let event = pair.b.pop_event().expect("endpoint event");
    assert!(!event.fatal);
    assert!(pair.b.recv(vec![0u8; 8], 1).is_ok());
}
