//! Per-type packet bodies: one encoder and one parser per wire format.
//!
//! Builders write the base header, the required body and the optional
//! subheaders, and return the header size; the caller appends the payload
//! directly behind it. The parser returns the body plus the payload range
//! so receive handlers can borrow the bytes out of the pool buffer.

use std::ops::Range;

use crate::error::{RdmError, RdmResult};

use super::wire::{
    BaseHdr, Dec, Enc, OptHdrs, RmaVec, decode_base, decode_rma_vec, encode_base, encode_rma_vec,
    rma_vec_wire_size,
};
use super::{BASE_HDR_SIZE, FLAG_HOST_ID, PROTOCOL_VERSION, PacketType};

#[derive(Debug, Clone, PartialEq)]
pub enum RtmDetail {
    /// Whole message in one packet. Delivery-complete variants carry the
    /// sender's entry id so the RECEIPT can find its way back.
    Eager { send_id: Option<u32> },
    /// One fragment of a multi-request message.
    Medium {
        msg_length: u64,
        seg_offset: u64,
        send_id: Option<u32>,
    },
    /// Header-only announcement; data follows in CTS-windowed DATA.
    LongCts { msg_length: u64, send_id: u32 },
    /// The receiver pulls the whole message from the sender's memory.
    LongRead {
        msg_length: u64,
        send_id: u32,
        source: RmaVec,
    },
    /// Inline prefix fragment plus a source vector for the remainder.
    RuntRead {
        msg_length: u64,
        send_id: u32,
        seg_offset: u64,
        /// Total bytes delivered inline across all runt fragments.
        runt_length: u64,
        source: RmaVec,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RtwDetail {
    Eager { send_id: Option<u32> },
    LongCts { msg_length: u64, send_id: u32 },
    LongRead { msg_length: u64, source: RmaVec },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PktBody {
    Handshake {
        nextra_p3: u32,
        features: u64,
        host_id: Option<u64>,
    },
    Cts {
        send_id: u32,
        recv_id: u32,
        window: u64,
    },
    Eor {
        send_id: u32,
        recv_id: u32,
    },
    Receipt {
        tx_id: u32,
        msg_id: u32,
    },
    Readrsp {
        send_id: u32,
        recv_id: u32,
        seg_offset: u64,
        seg_length: u64,
    },
    Atomrsp {
        recv_id: u32,
    },
    Data {
        recv_id: u32,
        seg_offset: u64,
        seg_length: u64,
    },
    Rtm {
        msg_id: u32,
        tag: Option<u64>,
        detail: RtmDetail,
    },
    Rtw {
        target: RmaVec,
        detail: RtwDetail,
    },
    Rtr {
        recv_id: u32,
        /// Present for the CTS-driven read request.
        window: Option<u64>,
        source: RmaVec,
    },
    Rta {
        msg_id: u32,
        op: u32,
        dtype: u32,
        target: RmaVec,
        /// Requester entry id, for FETCH/COMPARE responses.
        recv_id: Option<u32>,
        /// Sender entry id, for the delivery-complete RECEIPT.
        send_id: Option<u32>,
    },
}

/// A fully parsed frame.
#[derive(Debug)]
pub struct Parsed {
    pub ptype: PacketType,
    pub base: BaseHdr,
    pub opt: OptHdrs,
    pub body: PktBody,
    pub payload: Range<usize>,
}

/// Encode base header, body and optional subheaders into `buf`.
/// Returns the header length; the payload goes right behind it.
pub fn encode_header(
    buf: &mut [u8],
    ptype: PacketType,
    opt: &OptHdrs,
    body: &PktBody,
) -> RdmResult<usize> {
    let mut flags = opt.flags();
    if matches!(body, PktBody::Handshake { host_id: Some(_), .. }) {
        flags |= FLAG_HOST_ID;
    }
    let mut enc = Enc::new(buf);
    encode_base(&mut enc, ptype, flags);
    encode_body(&mut enc, ptype, body)?;
    opt.encode(&mut enc);
    Ok(enc.pos())
}

fn encode_body(enc: &mut Enc<'_>, ptype: PacketType, body: &PktBody) -> RdmResult<()> {
    match body {
        PktBody::Handshake {
            nextra_p3,
            features,
            host_id,
        } => {
            enc.u32(*nextra_p3);
            enc.u64(*features);
            if let Some(host_id) = host_id {
                enc.u64(*host_id);
            }
        }
        PktBody::Cts {
            send_id,
            recv_id,
            window,
        } => {
            enc.u32(*send_id);
            enc.u32(*recv_id);
            enc.u64(*window);
        }
        PktBody::Eor { send_id, recv_id } => {
            enc.u32(*send_id);
            enc.u32(*recv_id);
        }
        PktBody::Receipt { tx_id, msg_id } => {
            enc.u32(*tx_id);
            enc.u32(*msg_id);
        }
        PktBody::Readrsp {
            send_id,
            recv_id,
            seg_offset,
            seg_length,
        } => {
            enc.u32(*send_id);
            enc.u32(*recv_id);
            enc.u64(*seg_offset);
            enc.u64(*seg_length);
        }
        PktBody::Atomrsp { recv_id } => {
            enc.u32(*recv_id);
        }
        PktBody::Data {
            recv_id,
            seg_offset,
            seg_length,
        } => {
            enc.u32(*recv_id);
            enc.u64(*seg_offset);
            enc.u64(*seg_length);
        }
        PktBody::Rtm {
            msg_id,
            tag,
            detail,
        } => {
            debug_assert_eq!(ptype.is_tagged(), tag.is_some());
            enc.u32(*msg_id);
            if let Some(tag) = tag {
                enc.u64(*tag);
            }
            match detail {
                RtmDetail::Eager { send_id } => {
                    if let Some(send_id) = send_id {
                        enc.u32(*send_id);
                    }
                }
                RtmDetail::Medium {
                    msg_length,
                    seg_offset,
                    send_id,
                } => {
                    enc.u64(*msg_length);
                    enc.u64(*seg_offset);
                    if let Some(send_id) = send_id {
                        enc.u32(*send_id);
                    }
                }
                RtmDetail::LongCts {
                    msg_length,
                    send_id,
                } => {
                    enc.u64(*msg_length);
                    enc.u32(*send_id);
                }
                RtmDetail::LongRead {
                    msg_length,
                    send_id,
                    source,
                } => {
                    enc.u64(*msg_length);
                    enc.u32(*send_id);
                    encode_rma_vec(enc, source);
                }
                RtmDetail::RuntRead {
                    msg_length,
                    send_id,
                    seg_offset,
                    runt_length,
                    source,
                } => {
                    enc.u64(*msg_length);
                    enc.u32(*send_id);
                    enc.u64(*seg_offset);
                    enc.u64(*runt_length);
                    encode_rma_vec(enc, source);
                }
            }
        }
        PktBody::Rtw { target, detail } => {
            encode_rma_vec(enc, target);
            match detail {
                RtwDetail::Eager { send_id } => {
                    if let Some(send_id) = send_id {
                        enc.u32(*send_id);
                    }
                }
                RtwDetail::LongCts {
                    msg_length,
                    send_id,
                } => {
                    enc.u64(*msg_length);
                    enc.u32(*send_id);
                }
                RtwDetail::LongRead { msg_length, source } => {
                    enc.u64(*msg_length);
                    encode_rma_vec(enc, source);
                }
            }
        }
        PktBody::Rtr {
            recv_id,
            window,
            source,
        } => {
            enc.u32(*recv_id);
            if ptype == PacketType::LongCtsRtr {
                enc.u64(window.ok_or(RdmError::Invalid)?);
            }
            encode_rma_vec(enc, source);
        }
        PktBody::Rta {
            msg_id,
            op,
            dtype,
            target,
            recv_id,
            send_id,
        } => {
            enc.u32(*msg_id);
            enc.u32(*op);
            enc.u32(*dtype);
            encode_rma_vec(enc, target);
            match ptype {
                PacketType::FetchRta | PacketType::CompareRta => {
                    enc.u32(recv_id.ok_or(RdmError::Invalid)?);
                }
                PacketType::DcWriteRta => {
                    enc.u32(send_id.ok_or(RdmError::Invalid)?);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Parse a full frame. Retired types and stale versions are the caller's
/// responsibility (they need endpoint-level handling); this function
/// reports them as [`RdmError::Invalid`].
pub fn parse_frame(frame: &[u8]) -> RdmResult<Parsed> {
    let mut dec = Dec::new(frame);
    let base = decode_base(&mut dec)?;
    if base.version < PROTOCOL_VERSION {
        return Err(RdmError::Invalid);
    }
    let ptype = PacketType::from_wire(base.raw_type)?;
    let body = decode_body(&mut dec, ptype, base.flags)?;
    let opt = OptHdrs::decode(base.flags, &mut dec)?;
    let payload = dec.pos()..frame.len();
    Ok(Parsed {
        ptype,
        base,
        opt,
        body,
        payload,
    })
}

fn decode_body(dec: &mut Dec<'_>, ptype: PacketType, flags: u16) -> RdmResult<PktBody> {
    use PacketType::*;
    Ok(match ptype {
        Handshake => PktBody::Handshake {
            nextra_p3: dec.u32()?,
            features: dec.u64()?,
            host_id: if flags & FLAG_HOST_ID != 0 {
                Some(dec.u64()?)
            } else {
                None
            },
        },
        Cts => PktBody::Cts {
            send_id: dec.u32()?,
            recv_id: dec.u32()?,
            window: dec.u64()?,
        },
        Eor => PktBody::Eor {
            send_id: dec.u32()?,
            recv_id: dec.u32()?,
        },
        Receipt => PktBody::Receipt {
            tx_id: dec.u32()?,
            msg_id: dec.u32()?,
        },
        Readrsp => PktBody::Readrsp {
            send_id: dec.u32()?,
            recv_id: dec.u32()?,
            seg_offset: dec.u64()?,
            seg_length: dec.u64()?,
        },
        Atomrsp => PktBody::Atomrsp {
            recv_id: dec.u32()?,
        },
        Data => PktBody::Data {
            recv_id: dec.u32()?,
            seg_offset: dec.u64()?,
            seg_length: dec.u64()?,
        },
        EagerMsgRtm | EagerTagRtm | MediumMsgRtm | MediumTagRtm | LongCtsMsgRtm
        | LongCtsTagRtm | LongReadMsgRtm | LongReadTagRtm | RuntReadMsgRtm | RuntReadTagRtm
        | DcEagerMsgRtm | DcEagerTagRtm | DcMediumMsgRtm | DcMediumTagRtm | DcLongCtsMsgRtm
        | DcLongCtsTagRtm => {
            let msg_id = dec.u32()?;
            let tag = if ptype.is_tagged() {
                Some(dec.u64()?)
            } else {
                None
            };
            let detail = if ptype.is_eager_rtm() {
                RtmDetail::Eager {
                    send_id: if ptype.is_dc() { Some(dec.u32()?) } else { None },
                }
            } else if ptype.is_medium() {
                RtmDetail::Medium {
                    msg_length: dec.u64()?,
                    seg_offset: dec.u64()?,
                    send_id: if ptype.is_dc() { Some(dec.u32()?) } else { None },
                }
            } else if ptype.is_longcts() {
                RtmDetail::LongCts {
                    msg_length: dec.u64()?,
                    send_id: dec.u32()?,
                }
            } else if ptype.is_longread() {
                RtmDetail::LongRead {
                    msg_length: dec.u64()?,
                    send_id: dec.u32()?,
                    source: decode_rma_vec(dec)?,
                }
            } else {
                let msg_length = dec.u64()?;
                let send_id = dec.u32()?;
                let seg_offset = dec.u64()?;
                let runt_length = dec.u64()?;
                RtmDetail::RuntRead {
                    msg_length,
                    send_id,
                    seg_offset,
                    runt_length,
                    source: decode_rma_vec(dec)?,
                }
            };
            PktBody::Rtm {
                msg_id,
                tag,
                detail,
            }
        }
        EagerRtw | DcEagerRtw => PktBody::Rtw {
            target: decode_rma_vec(dec)?,
            detail: RtwDetail::Eager {
                send_id: if ptype.is_dc() { Some(dec.u32()?) } else { None },
            },
        },
        LongCtsRtw | DcLongCtsRtw => PktBody::Rtw {
            target: decode_rma_vec(dec)?,
            detail: RtwDetail::LongCts {
                msg_length: dec.u64()?,
                send_id: dec.u32()?,
            },
        },
        LongReadRtw => PktBody::Rtw {
            target: decode_rma_vec(dec)?,
            detail: RtwDetail::LongRead {
                msg_length: dec.u64()?,
                source: decode_rma_vec(dec)?,
            },
        },
        ShortRtr => PktBody::Rtr {
            recv_id: dec.u32()?,
            window: None,
            source: decode_rma_vec(dec)?,
        },
        LongCtsRtr => PktBody::Rtr {
            recv_id: dec.u32()?,
            window: Some(dec.u64()?),
            source: decode_rma_vec(dec)?,
        },
        WriteRta | DcWriteRta | FetchRta | CompareRta => {
            let msg_id = dec.u32()?;
            let op = dec.u32()?;
            let dtype = dec.u32()?;
            let target = decode_rma_vec(dec)?;
            let (recv_id, send_id) = match ptype {
                FetchRta | CompareRta => (Some(dec.u32()?), None),
                DcWriteRta => (None, Some(dec.u32()?)),
                _ => (None, None),
            };
            PktBody::Rta {
                msg_id,
                op,
                dtype,
                target,
                recv_id,
                send_id,
            }
        }
    })
}

/// Size of the header (base + body + optional subheaders) for a REQ
/// packet, used to compute eager capacity and fragment sizes.
pub fn req_hdr_size(ptype: PacketType, opt: &OptHdrs, rma_iov_count: usize) -> usize {
    let mut size = BASE_HDR_SIZE + opt.wire_size();
    if ptype.is_rtm() {
        size += 4; // msg id
        if ptype.is_tagged() {
            size += 8;
        }
        if ptype.is_eager_rtm() {
            if ptype.is_dc() {
                size += 4;
            }
        } else if ptype.is_medium() {
            size += 16;
            if ptype.is_dc() {
                size += 4;
            }
        } else if ptype.is_longcts() {
            size += 12;
        } else if ptype.is_longread() {
            size += 12 + rma_vec_wire_size(rma_iov_count);
        } else {
            size += 28 + rma_vec_wire_size(rma_iov_count);
        }
    } else if ptype.is_rtw() {
        size += rma_vec_wire_size(rma_iov_count);
        match ptype {
            PacketType::EagerRtw => {}
            PacketType::DcEagerRtw => size += 4,
            PacketType::LongCtsRtw | PacketType::DcLongCtsRtw => size += 12,
            PacketType::LongReadRtw => size += 8 + rma_vec_wire_size(rma_iov_count),
            _ => unreachable!(),
        }
    } else if ptype.is_rtr() {
        size += 4 + rma_vec_wire_size(rma_iov_count);
        if ptype == PacketType::LongCtsRtr {
            size += 8;
        }
    } else if ptype.is_rta() {
        size += 12 + rma_vec_wire_size(rma_iov_count);
        if !matches!(ptype, PacketType::WriteRta) {
            size += 4;
        }
    }
    size
}

pub const DATA_HDR_SIZE: usize = BASE_HDR_SIZE + 20;
pub const READRSP_HDR_SIZE: usize = BASE_HDR_SIZE + 24;
