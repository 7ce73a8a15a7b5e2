use rdm_endpoint::RemoteSlice;
use rdm_endpoint::nic::RawAddr;
use rdm_endpoint::pkt::{
    OptHdrs, PacketType, PktBody, RawAddrHdr, RmaVec, RtmDetail, encode_header, parse_frame,
    peek_base, req_hdr_size,
};

fn roundtrip(ptype: PacketType, opt: OptHdrs, body: PktBody, payload: &[u8]) {
    let mut frame = vec![0u8; 8192];
    let hdr = encode_header(&mut frame, ptype, &opt, &body).unwrap();
    frame[hdr..hdr + payload.len()].copy_from_slice(payload);
    frame.truncate(hdr + payload.len());

    let parsed = parse_frame(&frame).unwrap();
    assert_eq!(parsed.ptype, ptype);
    assert_eq!(parsed.opt, opt);
    assert_eq!(parsed.body, body);
    assert_eq!(&frame[parsed.payload.clone()], payload);
}

fn rma_vec() -> RmaVec {
    let mut iov = RmaVec::new();
    iov.push(RemoteSlice {
        addr: 0x1000,
        len: 4096,
        key: 42,
    });
    iov.push(RemoteSlice {
        addr: 0x9000,
        len: 512,
        key: 43,
    });
    iov
}

#[test]
fn eager_rtm_roundtrip_with_all_subheaders() {
    let opt = OptHdrs {
        raw_addr: Some(RawAddrHdr {
            locator: RawAddr([9; 16]),
            qpn: 12,
            connid: 77,
        }),
        connid: Some(5),
        cq_data: Some(0xdead_beef),
    };
    roundtrip(
        PacketType::EagerTagRtm,
        opt,
        PktBody::Rtm {
            msg_id: 17,
            tag: Some(0xfeed),
            detail: RtmDetail::Eager { send_id: None },
        },
        b"payload bytes",
    );
}

#[test]
fn medium_and_longcts_rtm_roundtrip() {
    roundtrip(
        PacketType::MediumMsgRtm,
        OptHdrs::default(),
        PktBody::Rtm {
            msg_id: 3,
            tag: None,
            detail: RtmDetail::Medium {
                msg_length: 20000,
                seg_offset: 8000,
                send_id: None,
            },
        },
        &[1, 2, 3],
    );
    roundtrip(
        PacketType::LongCtsTagRtm,
        OptHdrs::default(),
        PktBody::Rtm {
            msg_id: 4,
            tag: Some(1),
            detail: RtmDetail::LongCts {
                msg_length: 1 << 23,
                send_id: 9,
            },
        },
        &[],
    );
}

#[test]
fn read_based_rtm_roundtrip() {
    roundtrip(
        PacketType::LongReadMsgRtm,
        OptHdrs::default(),
        PktBody::Rtm {
            msg_id: 5,
            tag: None,
            detail: RtmDetail::LongRead {
                msg_length: 1 << 21,
                send_id: 11,
                source: rma_vec(),
            },
        },
        &[],
    );
    roundtrip(
        PacketType::RuntReadTagRtm,
        OptHdrs::default(),
        PktBody::Rtm {
            msg_id: 6,
            tag: Some(2),
            detail: RtmDetail::RuntRead {
                msg_length: 1 << 21,
                send_id: 12,
                seg_offset: 4096,
                runt_length: 65536,
                source: rma_vec(),
            },
        },
        b"runt",
    );
}

#[test]
fn control_packets_roundtrip() {
    roundtrip(
        PacketType::Cts,
        OptHdrs::default(),
        PktBody::Cts {
            send_id: 1,
            recv_id: 2,
            window: 1 << 20,
        },
        &[],
    );
    roundtrip(
        PacketType::Data,
        OptHdrs {
            connid: Some(8),
            ..OptHdrs::default()
        },
        PktBody::Data {
            recv_id: 2,
            seg_offset: 12345,
            seg_length: 3,
        },
        &[7, 8, 9],
    );
    roundtrip(
        PacketType::Handshake,
        OptHdrs::default(),
        PktBody::Handshake {
            nextra_p3: 64,
            features: 0b111,
            host_id: Some(0xf7c8_26e5_f3bd_8685),
        },
        &[],
    );
    roundtrip(
        PacketType::Receipt,
        OptHdrs::default(),
        PktBody::Receipt {
            tx_id: 12,
            msg_id: 99,
        },
        &[],
    );
    roundtrip(
        PacketType::Eor,
        OptHdrs::default(),
        PktBody::Eor {
            send_id: 3,
            recv_id: 4,
        },
        &[],
    );
}

#[test]
fn rta_roundtrip() {
    roundtrip(
        PacketType::CompareRta,
        OptHdrs::default(),
        PktBody::Rta {
            msg_id: 31,
            op: 2,
            dtype: 1,
            target: rma_vec(),
            recv_id: Some(77),
            send_id: None,
        },
        &[0; 16],
    );
}

#[test]
fn header_size_matches_encoding() {
    let mut opt = OptHdrs::default();
    opt.cq_data = Some(1);
    let body = PktBody::Rtm {
        msg_id: 1,
        tag: None,
        detail: RtmDetail::Medium {
            msg_length: 100,
            seg_offset: 0,
            send_id: None,
        },
    };
    let mut frame = vec![0u8; 256];
    let written = encode_header(&mut frame, PacketType::MediumMsgRtm, &opt, &body).unwrap();
    assert_eq!(written, req_hdr_size(PacketType::MediumMsgRtm, &opt, 0));
}

#[test]
fn short_frames_are_rejected() {
    assert!(peek_base(&[4]).is_err());
    assert!(parse_frame(&[4, PacketType::Cts as u8, 0, 0]).is_err());
}

#[test]
fn old_versions_are_rejected() {
    let frame = [3u8, PacketType::Handshake as u8, 0, 0, 0, 0, 0, 0];
    assert!(parse_frame(&frame).is_err());
}
