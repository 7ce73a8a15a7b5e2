use proptest::prelude::*;

use rdm_endpoint::RemoteSlice;
use rdm_endpoint::pkt::{
    OptHdrs, PacketType, PktBody, RmaVec, RtmDetail, encode_header, parse_frame,
};

fn arb_rma_vec() -> impl Strategy<Value = RmaVec> {
    prop::collection::vec((any::<u64>(), 1u64..1 << 30, any::<u64>()), 1..4).prop_map(|slices| {
        slices
            .into_iter()
            .map(|(addr, len, key)| RemoteSlice { addr, len, key })
            .collect()
    })
}

fn arb_opt() -> impl Strategy<Value = OptHdrs> {
    (any::<bool>(), any::<Option<u32>>(), any::<Option<u64>>()).prop_map(
        |(raw, connid, cq_data)| OptHdrs {
            raw_addr: raw.then(|| rdm_endpoint::pkt::RawAddrHdr {
                locator: rdm_endpoint::nic::RawAddr([3; 16]),
                qpn: 11,
                connid: 13,
            }),
            connid,
            cq_data,
        },
    )
}

proptest! {
    #[test]
    fn rtm_headers_roundtrip(
        msg_id in any::<u32>(),
        tagged in any::<bool>(),
        tag in any::<u64>(),
        msg_length in any::<u64>(),
        seg_offset in any::<u64>(),
        opt in arb_opt(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let ptype = if tagged {
            PacketType::MediumTagRtm
        } else {
            PacketType::MediumMsgRtm
        };
        let body = PktBody::Rtm {
            msg_id,
            tag: tagged.then_some(tag),
            detail: RtmDetail::Medium {
                msg_length,
                seg_offset,
                send_id: None,
            },
        };
        let mut frame = vec![0u8; 2048];
        let hdr = encode_header(&mut frame, ptype, &opt, &body).unwrap();
        frame[hdr..hdr + payload.len()].copy_from_slice(&payload);
        frame.truncate(hdr + payload.len());

        let parsed = parse_frame(&frame).unwrap();
        prop_assert_eq!(parsed.ptype, ptype);
        prop_assert_eq!(parsed.body, body);
        prop_assert_eq!(parsed.opt, opt);
        prop_assert_eq!(&frame[parsed.payload.clone()], &payload[..]);
    }

    #[test]
    fn longread_headers_roundtrip(
        msg_id in any::<u32>(),
        msg_length in any::<u64>(),
        send_id in any::<u32>(),
        source in arb_rma_vec(),
    ) {
        let body = PktBody::Rtm {
            msg_id,
            tag: None,
            detail: RtmDetail::LongRead { msg_length, send_id, source },
        };
        let mut frame = vec![0u8; 2048];
        let hdr = encode_header(&mut frame, PacketType::LongReadMsgRtm, &OptHdrs::default(), &body).unwrap();
        frame.truncate(hdr);
        let parsed = parse_frame(&frame).unwrap();
        prop_assert_eq!(parsed.body, body);
    }

    #[test]
    fn truncated_frames_never_panic(frame in prop::collection::vec(any::<u8>(), 0..256)) {
        // Arbitrary bytes must parse cleanly or fail cleanly.
        let _ = parse_frame(&frame);
    }

    #[test]
    fn truncating_a_valid_frame_fails_cleanly(cut in 0usize..40) {
        let body = PktBody::Cts { send_id: 1, recv_id: 2, window: 3 };
        let mut frame = vec![0u8; 64];
        let hdr = encode_header(&mut frame, PacketType::Cts, &OptHdrs::default(), &body).unwrap();
        frame.truncate(hdr.min(cut));
        if frame.len() < hdr {
            prop_assert!(parse_frame(&frame).is_err());
        }
    }
}
