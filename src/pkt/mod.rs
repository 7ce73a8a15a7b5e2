//! Wire packet definitions.
//!
//! Every frame starts with the 4-byte base header (version, type, flags),
//! then the type-specific required header, then any optional subheaders in
//! fixed order (raw address, connection id, CQ data), then the payload.
//!
//! Packet types form families: REQ packets (RTM/RTW/RTR/RTA) open an
//! operation, the rest are control. Types at or above
//! [`EXTRA_REQ_BEGIN`] need a capability the peer advertises in its
//! HANDSHAKE; everything below is baseline and always legal to send.

mod frame;
mod wire;

pub use frame::*;
pub use wire::*;

use crate::error::RdmError;

/// Protocol version spoken by this endpoint. Incoming packets with a
/// lower version are rejected as a fatal endpoint error.
pub const PROTOCOL_VERSION: u8 = 4;

/// Base header flag bits.
pub const FLAG_RAW_ADDR: u16 = 1 << 0;
pub const FLAG_CONNID: u16 = 1 << 1;
pub const FLAG_CQ_DATA: u16 = 1 << 2;
pub const FLAG_HOST_ID: u16 = 1 << 3;

/// Capability bits carried in the HANDSHAKE feature bitmap.
pub const FEATURE_RDMA_READ: u64 = 1 << 0;
pub const FEATURE_DELIVERY_COMPLETE: u64 = 1 << 1;
pub const FEATURE_RDMA_WRITE: u64 = 1 << 2;

pub const BASE_HDR_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Handshake = 1,
    Cts = 2,
    Eor = 3,
    Atomrsp = 4,
    Receipt = 5,
    Readrsp = 6,
    Data = 7,

    EagerMsgRtm = 64,
    EagerTagRtm = 65,
    MediumMsgRtm = 66,
    MediumTagRtm = 67,
    LongCtsMsgRtm = 68,
    LongCtsTagRtm = 69,
    EagerRtw = 70,
    LongCtsRtw = 71,
    ShortRtr = 72,
    LongCtsRtr = 73,
    WriteRta = 74,
    FetchRta = 75,
    CompareRta = 76,

    LongReadMsgRtm = 128,
    LongReadTagRtm = 129,
    LongReadRtw = 130,
    DcEagerMsgRtm = 133,
    DcEagerTagRtm = 134,
    DcMediumMsgRtm = 135,
    DcMediumTagRtm = 136,
    DcLongCtsMsgRtm = 137,
    DcLongCtsTagRtm = 138,
    DcEagerRtw = 139,
    DcLongCtsRtw = 140,
    DcWriteRta = 141,
    RuntReadMsgRtm = 142,
    RuntReadTagRtm = 143,
}

pub const REQ_PKT_BEGIN: u8 = 64;
pub const EXTRA_REQ_BEGIN: u8 = 128;
pub const EXTRA_REQ_END: u8 = 144;

/// Packet types retired in earlier protocol versions. Receiving one is a
/// fatal endpoint error.
pub const RETIRED_RTS: u8 = 8;
pub const RETIRED_CONNACK: u8 = 9;

impl PacketType {
    pub fn from_wire(raw: u8) -> Result<Self, RdmError> {
        use PacketType::*;
        Ok(match raw {
            1 => Handshake,
            2 => Cts,
            3 => Eor,
            4 => Atomrsp,
            5 => Receipt,
            6 => Readrsp,
            7 => Data,
            64 => EagerMsgRtm,
            65 => EagerTagRtm,
            66 => MediumMsgRtm,
            67 => MediumTagRtm,
            68 => LongCtsMsgRtm,
            69 => LongCtsTagRtm,
            70 => EagerRtw,
            71 => LongCtsRtw,
            72 => ShortRtr,
            73 => LongCtsRtr,
            74 => WriteRta,
            75 => FetchRta,
            76 => CompareRta,
            128 => LongReadMsgRtm,
            129 => LongReadTagRtm,
            130 => LongReadRtw,
            133 => DcEagerMsgRtm,
            134 => DcEagerTagRtm,
            135 => DcMediumMsgRtm,
            136 => DcMediumTagRtm,
            137 => DcLongCtsMsgRtm,
            138 => DcLongCtsTagRtm,
            139 => DcEagerRtw,
            140 => DcLongCtsRtw,
            141 => DcWriteRta,
            142 => RuntReadMsgRtm,
            143 => RuntReadTagRtm,
            _ => return Err(RdmError::Invalid),
        })
    }

    pub fn is_req(self) -> bool {
        self as u8 >= REQ_PKT_BEGIN
    }

    /// REQ types above the baseline need a handshake-advertised feature.
    pub fn required_feature(self) -> Option<u64> {
        use PacketType::*;
        match self {
            LongReadMsgRtm | LongReadTagRtm | LongReadRtw | RuntReadMsgRtm | RuntReadTagRtm => {
                Some(FEATURE_RDMA_READ)
            }
            DcEagerMsgRtm | DcEagerTagRtm | DcMediumMsgRtm | DcMediumTagRtm | DcLongCtsMsgRtm
            | DcLongCtsTagRtm | DcEagerRtw | DcLongCtsRtw | DcWriteRta => {
                Some(FEATURE_DELIVERY_COMPLETE)
            }
            _ => None,
        }
    }

    pub fn is_rtm(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            EagerMsgRtm
                | EagerTagRtm
                | MediumMsgRtm
                | MediumTagRtm
                | LongCtsMsgRtm
                | LongCtsTagRtm
                | LongReadMsgRtm
                | LongReadTagRtm
                | RuntReadMsgRtm
                | RuntReadTagRtm
                | DcEagerMsgRtm
                | DcEagerTagRtm
                | DcMediumMsgRtm
                | DcMediumTagRtm
                | DcLongCtsMsgRtm
                | DcLongCtsTagRtm
        )
    }

    pub fn is_tagged(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            EagerTagRtm
                | MediumTagRtm
                | LongCtsTagRtm
                | LongReadTagRtm
                | RuntReadTagRtm
                | DcEagerTagRtm
                | DcMediumTagRtm
                | DcLongCtsTagRtm
        )
    }

    pub fn is_medium(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            MediumMsgRtm | MediumTagRtm | DcMediumMsgRtm | DcMediumTagRtm
        )
    }

    pub fn is_runtread(self) -> bool {
        use PacketType::*;
        matches!(self, RuntReadMsgRtm | RuntReadTagRtm)
    }

    /// Multi-request types post a whole series of REQ packets per message.
    pub fn is_mulreq(self) -> bool {
        self.is_medium() || self.is_runtread()
    }

    pub fn is_longcts(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            LongCtsMsgRtm | LongCtsTagRtm | DcLongCtsMsgRtm | DcLongCtsTagRtm
        )
    }

    pub fn is_longread(self) -> bool {
        use PacketType::*;
        matches!(self, LongReadMsgRtm | LongReadTagRtm)
    }

    pub fn is_eager_rtm(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            EagerMsgRtm | EagerTagRtm | DcEagerMsgRtm | DcEagerTagRtm
        )
    }

    /// Delivery-complete variants expect a RECEIPT from the receiver.
    pub fn is_dc(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            DcEagerMsgRtm
                | DcEagerTagRtm
                | DcMediumMsgRtm
                | DcMediumTagRtm
                | DcLongCtsMsgRtm
                | DcLongCtsTagRtm
                | DcEagerRtw
                | DcLongCtsRtw
                | DcWriteRta
        )
    }

    pub fn is_rtw(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            EagerRtw | LongCtsRtw | LongReadRtw | DcEagerRtw | DcLongCtsRtw
        )
    }

    pub fn is_rtr(self) -> bool {
        use PacketType::*;
        matches!(self, ShortRtr | LongCtsRtr)
    }

    pub fn is_rta(self) -> bool {
        use PacketType::*;
        matches!(self, WriteRta | FetchRta | CompareRta | DcWriteRta)
    }
}
