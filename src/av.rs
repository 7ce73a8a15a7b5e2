//! Address vector interface.
//!
//! Host discovery and address-vector mechanics live outside this crate;
//! the endpoint resolves handles to device destinations, reverse-looks-up
//! completion sources, and inserts peers discovered from packet headers.

use crate::error::RdmResult;
use crate::nic::{NicDest, RawAddr};
use crate::pkt::RawAddrHdr;

/// Local address handle of a peer. Handles are endpoint-scoped; a handle
/// whose peer was removed from the vector simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(pub u64);

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait AddressVector: Send {
    /// Device destination for a handle, or `None` if the peer was removed.
    fn resolve(&self, addr: Addr) -> Option<NicDest>;

    /// Find the handle for a completion's source queue pair and locator.
    /// The connection id disambiguates recycled queue pair numbers.
    fn reverse_lookup(&self, qpn: u32, locator: RawAddr, connid: Option<u32>) -> Option<Addr>;

    /// Insert a peer discovered from a packet's raw-address subheader.
    /// Inserting an already-known (raw, qpn, connid) tuple returns the
    /// existing handle.
    fn insert(&mut self, raw: &RawAddrHdr) -> RdmResult<Addr>;

    /// This endpoint's own raw address, for outgoing subheaders.
    fn local_raw(&self) -> RawAddrHdr;

    /// Whether the peer lives on this host (SHM shortcut eligibility).
    fn is_local(&self, addr: Addr) -> bool {
        let _ = addr;
        false
    }
}
