use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use rdm_endpoint::RemoteSlice;
use rdm_endpoint::pkt::{
    OptHdrs, PacketType, PktBody, RmaVec, RtmDetail, encode_header, parse_frame,
};

fn bench_encode_eager(c: &mut Criterion) {
    let body = PktBody::Rtm {
        msg_id: 42,
        tag: Some(0xfeed),
        detail: RtmDetail::Eager { send_id: None },
    };
    let mut opt = OptHdrs::default();
    opt.connid = Some(7);
    let mut frame = vec![0u8; 8192];

    c.bench_function("encode_eager_tagrtm", |b| {
        b.iter(|| {
            black_box(
                encode_header(
                    black_box(&mut frame),
                    PacketType::EagerTagRtm,
                    black_box(&opt),
                    black_box(&body),
                )
                .unwrap(),
            )
        })
    });
}

fn bench_parse_longread(c: &mut Criterion) {
    let mut source = RmaVec::new();
    for i in 0..4u64 {
        source.push(RemoteSlice {
            addr: i * 4096,
            len: 4096,
            key: i,
        });
    }
    let body = PktBody::Rtm {
        msg_id: 1,
        tag: None,
        detail: RtmDetail::LongRead {
            msg_length: 1 << 22,
            send_id: 3,
            source,
        },
    };
    let mut frame = vec![0u8; 8192];
    let len = encode_header(&mut frame, PacketType::LongReadMsgRtm, &OptHdrs::default(), &body)
        .unwrap();
    frame.truncate(len);

    c.bench_function("parse_longread_msgrtm", |b| {
        b.iter(|| black_box(parse_frame(black_box(&frame)).unwrap()))
    });
}

fn bench_parse_data(c: &mut Criterion) {
    let body = PktBody::Data {
        recv_id: 9,
        seg_offset: 1 << 20,
        seg_length: 8168,
    };
    let mut frame = vec![0u8; 8192];
    let len = encode_header(&mut frame, PacketType::Data, &OptHdrs::default(), &body).unwrap();
    frame.truncate(len + 8168);

    c.bench_function("parse_data_pkt", |b| {
        b.iter(|| black_box(parse_frame(black_box(&frame)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_encode_eager,
    bench_parse_longread,
    bench_parse_data
);
criterion_main!(benches);
