//! Little-endian byte cursors and the optional subheaders shared by all
//! packet types.

use smallvec::SmallVec;

use crate::error::{RdmError, RdmResult};
use crate::nic::{RawAddr, RemoteSlice};

use super::{BASE_HDR_SIZE, FLAG_CONNID, FLAG_CQ_DATA, FLAG_RAW_ADDR, PROTOCOL_VERSION, PacketType};

/// Encoding cursor over a packet buffer.
pub struct Enc<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Enc<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    pub fn u16(&mut self, v: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
    }

    pub fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    pub fn u64(&mut self, v: u64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
    }
}

/// Decoding cursor. Every accessor is bounds-checked; a short buffer is
/// an [`RdmError::Invalid`] frame.
pub struct Dec<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Dec<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn u8(&mut self) -> RdmResult<u8> {
        let v = *self.buf.get(self.pos).ok_or(RdmError::Invalid)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self) -> RdmResult<u16> {
        let v = self
            .buf
            .get(self.pos..self.pos + 2)
            .ok_or(RdmError::Invalid)?;
        self.pos += 2;
        Ok(u16::from_le_bytes(v.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> RdmResult<u32> {
        let v = self
            .buf
            .get(self.pos..self.pos + 4)
            .ok_or(RdmError::Invalid)?;
        self.pos += 4;
        Ok(u32::from_le_bytes(v.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> RdmResult<u64> {
        let v = self
            .buf
            .get(self.pos..self.pos + 8)
            .ok_or(RdmError::Invalid)?;
        self.pos += 8;
        Ok(u64::from_le_bytes(v.try_into().unwrap()))
    }

    pub fn bytes(&mut self, len: usize) -> RdmResult<&'a [u8]> {
        let v = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or(RdmError::Invalid)?;
        self.pos += len;
        Ok(v)
    }
}

/// Raw-address subheader contents: enough to insert the sender into the
/// address vector when it is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddrHdr {
    pub locator: RawAddr,
    pub qpn: u32,
    pub connid: u32,
}

/// Optional subheaders, always encoded in this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptHdrs {
    pub raw_addr: Option<RawAddrHdr>,
    pub connid: Option<u32>,
    pub cq_data: Option<u64>,
}

impl OptHdrs {
    pub fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.raw_addr.is_some() {
            flags |= FLAG_RAW_ADDR;
        }
        if self.connid.is_some() {
            flags |= FLAG_CONNID;
        }
        if self.cq_data.is_some() {
            flags |= FLAG_CQ_DATA;
        }
        flags
    }

    pub fn wire_size(&self) -> usize {
        let mut size = 0;
        if self.raw_addr.is_some() {
            size += 24;
        }
        if self.connid.is_some() {
            size += 4;
        }
        if self.cq_data.is_some() {
            size += 8;
        }
        size
    }

    pub fn encode(&self, enc: &mut Enc<'_>) {
        if let Some(raw) = &self.raw_addr {
            enc.bytes(&raw.locator.0);
            enc.u32(raw.qpn);
            enc.u32(raw.connid);
        }
        if let Some(connid) = self.connid {
            enc.u32(connid);
        }
        if let Some(cq_data) = self.cq_data {
            enc.u64(cq_data);
        }
    }

    pub fn decode(flags: u16, dec: &mut Dec<'_>) -> RdmResult<Self> {
        let mut opt = OptHdrs::default();
        if flags & FLAG_RAW_ADDR != 0 {
            let mut locator = RawAddr::default();
            locator.0.copy_from_slice(dec.bytes(16)?);
            let qpn = dec.u32()?;
            let connid = dec.u32()?;
            opt.raw_addr = Some(RawAddrHdr {
                locator,
                qpn,
                connid,
            });
        }
        if flags & FLAG_CONNID != 0 {
            opt.connid = Some(dec.u32()?);
        }
        if flags & FLAG_CQ_DATA != 0 {
            opt.cq_data = Some(dec.u64()?);
        }
        Ok(opt)
    }
}

pub type RmaVec = SmallVec<[RemoteSlice; 4]>;

pub fn encode_rma_vec(enc: &mut Enc<'_>, iov: &[RemoteSlice]) {
    enc.u32(iov.len() as u32);
    for slice in iov {
        enc.u64(slice.addr);
        enc.u64(slice.len);
        enc.u64(slice.key);
    }
}

pub fn decode_rma_vec(dec: &mut Dec<'_>) -> RdmResult<RmaVec> {
    let count = dec.u32()? as usize;
    if count > 4 {
        return Err(RdmError::Invalid);
    }
    let mut iov = RmaVec::new();
    for _ in 0..count {
        iov.push(RemoteSlice {
            addr: dec.u64()?,
            len: dec.u64()?,
            key: dec.u64()?,
        });
    }
    Ok(iov)
}

pub fn rma_vec_wire_size(count: usize) -> usize {
    4 + count * 24
}

pub fn encode_base(enc: &mut Enc<'_>, ptype: PacketType, flags: u16) {
    enc.u8(PROTOCOL_VERSION);
    enc.u8(ptype as u8);
    enc.u16(flags);
}

/// Result of looking at the first bytes of a frame.
#[derive(Debug, Clone, Copy)]
pub struct BaseHdr {
    pub version: u8,
    pub raw_type: u8,
    pub flags: u16,
}

pub fn decode_base(dec: &mut Dec<'_>) -> RdmResult<BaseHdr> {
    let version = dec.u8()?;
    let raw_type = dec.u8()?;
    let flags = dec.u16()?;
    Ok(BaseHdr {
        version,
        raw_type,
        flags,
    })
}

/// Quick peek at a frame's base header without a cursor.
pub fn peek_base(frame: &[u8]) -> RdmResult<BaseHdr> {
    if frame.len() < BASE_HDR_SIZE {
        return Err(RdmError::Invalid);
    }
    Ok(BaseHdr {
        version: frame[0],
        raw_type: frame[1],
        flags: u16::from_le_bytes([frame[2], frame[3]]),
    })
}
