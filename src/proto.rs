//! Wire protocol selection for two-sided sends.

use crate::env::{Config, MemIface};
use crate::peer::Peer;
use crate::pkt::{OptHdrs, PacketType, req_hdr_size};

/// Everything the selector looks at for one send.
pub struct SelectInput<'a> {
    pub cfg: &'a Config,
    pub peer: &'a Peer,
    pub tagged: bool,
    pub delivery_complete: bool,
    pub total_len: u64,
    pub iface: MemIface,
    /// The first source segment came with a registration descriptor.
    pub source_registered: bool,
    /// The device can perform one-sided reads and they are enabled.
    pub device_read: bool,
    /// An on-demand registration cache can cover unregistered sources.
    pub cache_available: bool,
    /// Optional subheaders this peer requires on REQ packets.
    pub opt: &'a OptHdrs,
}

/// Map one send operation to the RTM packet type that will carry it.
///
/// Tagged variants are always `message type + 1`; the arithmetic below
/// leans on that, like the wire numbering guarantees.
pub fn select_rtm(input: &SelectInput<'_>) -> PacketType {
    debug_assert_eq!(
        PacketType::EagerMsgRtm as u8 + 1,
        PacketType::EagerTagRtm as u8
    );
    debug_assert_eq!(
        PacketType::MediumMsgRtm as u8 + 1,
        PacketType::MediumTagRtm as u8
    );
    debug_assert_eq!(
        PacketType::LongCtsMsgRtm as u8 + 1,
        PacketType::LongCtsTagRtm as u8
    );
    debug_assert_eq!(
        PacketType::LongReadMsgRtm as u8 + 1,
        PacketType::LongReadTagRtm as u8
    );

    let tagged = input.tagged as u8;
    let eager = if input.delivery_complete {
        PacketType::DcEagerMsgRtm as u8 + tagged
    } else {
        PacketType::EagerMsgRtm as u8 + tagged
    };
    let medium = if input.delivery_complete {
        PacketType::DcMediumMsgRtm as u8 + tagged
    } else {
        PacketType::MediumMsgRtm as u8 + tagged
    };
    let longcts = if input.delivery_complete {
        PacketType::DcLongCtsMsgRtm as u8 + tagged
    } else {
        PacketType::LongCtsMsgRtm as u8 + tagged
    };

    let iface = input.iface.index();

    if input.total_len >= input.cfg.min_read_msg_size[iface] as u64
        && input.device_read
        && (input.source_registered || input.cache_available)
    {
        return PacketType::from_wire(readbase_rtm(input) as u8).expect("readbase type");
    }

    let eager_type = PacketType::from_wire(eager).expect("eager type");
    let eager_capacity = input
        .cfg
        .mtu_size
        .saturating_sub(req_hdr_size(eager_type, input.opt, 0)) as u64;
    if input.total_len <= eager_capacity {
        return eager_type;
    }

    if input.total_len <= input.cfg.max_medium_msg_size[iface] as u64 {
        return PacketType::from_wire(medium).expect("medium type");
    }

    PacketType::from_wire(longcts).expect("longcts type")
}

/// Pick between the pure long-read protocol and its runting variant.
/// Runting spends the peer's shared runt budget; once the budget is in
/// flight, fall back to the header-only long-read.
fn readbase_rtm(input: &SelectInput<'_>) -> PacketType {
    let tagged = input.tagged as u8;
    let runt_budget = input.cfg.runt_size[input.iface.index()] as u64;
    if runt_budget > input.peer.runt_bytes_in_flight && !input.delivery_complete {
        PacketType::from_wire(PacketType::RuntReadMsgRtm as u8 + tagged).expect("runtread type")
    } else {
        PacketType::from_wire(PacketType::LongReadMsgRtm as u8 + tagged).expect("longread type")
    }
}

/// Maximum payload a single REQ packet of `ptype` can carry to `peer`.
pub fn req_data_capacity(cfg: &Config, ptype: PacketType, opt: &OptHdrs, rma_count: usize) -> u64 {
    cfg.mtu_size.saturating_sub(req_hdr_size(ptype, opt, rma_count)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::Addr;
    use crate::nic::{NicDest, RawAddr};

    fn test_peer() -> Peer {
        Peer::new(
            Addr(3),
            NicDest {
                qpn: 1,
                locator: RawAddr::default(),
            },
            0,
            false,
        )
    }

    fn base_input<'a>(cfg: &'a Config, peer: &'a Peer, opt: &'a OptHdrs) -> SelectInput<'a> {
        SelectInput {
            cfg,
            peer,
            tagged: false,
            delivery_complete: false,
            total_len: 0,
            iface: MemIface::System,
            source_registered: true,
            device_read: true,
            cache_available: true,
            opt,
        }
    }

    #[test]
    fn size_ladder_selects_each_class() {
        let cfg = Config {
            mtu_size: 4096,
            max_medium_msg_size: [65536, 65536],
            min_read_msg_size: [1 << 20, 1 << 20],
            ..Config::default()
        };
        let peer = test_peer();
        let opt = OptHdrs::default();
        let mut input = base_input(&cfg, &peer, &opt);

        input.total_len = 128;
        assert_eq!(select_rtm(&input), PacketType::EagerMsgRtm);
        input.total_len = 20000;
        assert_eq!(select_rtm(&input), PacketType::MediumMsgRtm);
        input.total_len = 100_000;
        assert_eq!(select_rtm(&input), PacketType::LongCtsMsgRtm);
        input.total_len = 2 << 20;
        assert_eq!(select_rtm(&input), PacketType::RuntReadMsgRtm);
    }

    #[test]
    fn tagged_is_message_type_plus_one() {
        let cfg = Config::default();
        let peer = test_peer();
        let opt = OptHdrs::default();
        let mut input = base_input(&cfg, &peer, &opt);
        input.tagged = true;
        input.total_len = 128;
        assert_eq!(select_rtm(&input), PacketType::EagerTagRtm);
    }

    #[test]
    fn delivery_complete_uses_dc_variants() {
        let cfg = Config::default();
        let peer = test_peer();
        let opt = OptHdrs::default();
        let mut input = base_input(&cfg, &peer, &opt);
        input.delivery_complete = true;
        input.total_len = 128;
        assert_eq!(select_rtm(&input), PacketType::DcEagerMsgRtm);
        input.total_len = 30000;
        assert_eq!(select_rtm(&input), PacketType::DcMediumMsgRtm);
    }

    #[test]
    fn read_needs_registration_or_cache() {
        let cfg = Config::default();
        let peer = test_peer();
        let opt = OptHdrs::default();
        let mut input = base_input(&cfg, &peer, &opt);
        input.total_len = 2 << 20;
        input.source_registered = false;
        input.cache_available = false;
        assert_eq!(select_rtm(&input), PacketType::LongCtsMsgRtm);
    }

    #[test]
    fn exhausted_runt_budget_falls_back_to_longread() {
        let cfg = Config::default();
        let mut peer = test_peer();
        peer.runt_bytes_in_flight = cfg.runt_size[0] as u64;
        let opt = OptHdrs::default();
        let mut input = base_input(&cfg, &peer, &opt);
        input.total_len = 2 << 20;
        assert_eq!(select_rtm(&input), PacketType::LongReadMsgRtm);
    }

    #[test]
    fn subheaders_shrink_eager_capacity() {
        let cfg = Config {
            mtu_size: 100,
            ..Config::default()
        };
        let peer = test_peer();
        let plain = OptHdrs::default();
        let mut with_cq_data = OptHdrs::default();
        with_cq_data.cq_data = Some(7);

        let mut input = base_input(&cfg, &peer, &plain);
        input.total_len = 96 - 4;
        assert_eq!(select_rtm(&input), PacketType::EagerMsgRtm);

        input.opt = &with_cq_data;
        assert_eq!(select_rtm(&input), PacketType::MediumMsgRtm);
    }
}
