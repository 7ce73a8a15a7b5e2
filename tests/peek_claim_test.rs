use smallvec::SmallVec;
use rdm_endpoint::ope::{OP_CLAIM, OP_COMPLETION, OP_DISCARD, OP_PEEK};
use rdm_endpoint::testing::TestPair;
use rdm_endpoint::{DataVec, OpFlags, RdmError, RecvDesc};

fn trecv_flags(pair_context: u64, tag: u64, flags: u64, iov: DataVec) -> RecvDesc {
    RecvDesc {
        addr: None,
        iov,
        desc: SmallVec::new(),
        context: pair_context,
        tag,
        ignore: 0,
        flags: OpFlags(flags),
    }
}

#[test]
fn peek_then_claim_consumes_one_entry() {
    let mut pair = TestPair::new();
    pair.a.tsend(pair.b_addr, vec![9u8; 40], 7, 1).unwrap();
    pair.pump();

    // Peek with claim: one peek entry, the message is reserved.
    pair.b
        .trecvmsg(trecv_flags(100, 7, OP_PEEK | OP_CLAIM | OP_COMPLETION, DataVec::new()))
        .unwrap();
    let peek = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(peek.len, 40);
    assert_eq!(peek.tag, 7);
    assert_eq!(peek.context, 100);

    // Claim completes the receive against the same entry.
    let mut iov = DataVec::new();
    iov.push(vec![0u8; 64]);
    pair.b
        .trecvmsg(trecv_flags(100, 7, OP_CLAIM | OP_COMPLETION, iov))
        .unwrap();
    pair.pump();
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.len, 40);
    assert_eq!(&recv.buf[0][..4], &[9; 4]);
    assert!(pair.b.pop_rx_completion().is_none(), "no duplicate entry");
}

#[test]
fn plain_peek_leaves_the_message_queued() {
    let mut pair = TestPair::new();
    pair.a.tsend(pair.b_addr, vec![3u8; 16], 5, 1).unwrap();
    pair.pump();

    pair.b
        .trecvmsg(trecv_flags(200, 5, OP_PEEK | OP_COMPLETION, DataVec::new()))
        .unwrap();
    let peek = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(peek.len, 16);

    // The message is still there for a normal receive.
    pair.b.trecv(vec![0u8; 16], 5, 0, 201).unwrap();
    pair.pump();
    let recv = pair.b.pop_rx_completion().unwrap().unwrap();
    assert_eq!(recv.context, 201);
}

#[test]
fn peek_miss_writes_a_no_message_entry() {
    let mut pair = TestPair::new();
    pair.b
        .trecvmsg(trecv_flags(300, 9, OP_PEEK | OP_COMPLETION, DataVec::new()))
        .unwrap();
    let err = pair.b.pop_rx_completion().unwrap().unwrap_err();
    assert_eq!(err.err, RdmError::NoMessage);
    assert_eq!(err.context, 300);
}

#[test]
fn discard_sinks_the_message_with_a_cancelled_entry() {
    let mut pair = TestPair::new();
    pair.a.tsend(pair.b_addr, vec![1u8; 32], 4, 1).unwrap();
    pair.pump();

    pair.b
        .trecvmsg(trecv_flags(
            400,
            4,
            OP_PEEK | OP_DISCARD | OP_COMPLETION,
            DataVec::new(),
        ))
        .unwrap();
    pair.pump();
    let err = pair.b.pop_rx_completion().unwrap().unwrap_err();
    assert_eq!(err.err, RdmError::Cancelled);

    // The entry is gone: a later matching receive stays pending.
    pair.b.trecv(vec![0u8; 32], 4, 0, 401).unwrap();
    pair.pump();
    assert!(pair.b.pop_rx_completion().is_none());
}
