//! Bridge to an external receive-matching service.
//!
//! When the endpoint acts as a receive-context provider, unexpected
//! messages are not queued locally: a small context entry carrying the
//! wire packet is handed to the service, which later starts the receive
//! with a buffer of its choosing.

use crate::av::Addr;
use crate::ope::OpeId;

/// Opaque handle the service passes back to start the receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrxHandle(pub OpeId);

#[derive(Debug, Clone)]
pub struct SrxMsgInfo {
    pub handle: SrxHandle,
    pub addr: Addr,
    /// Total message length from the wire header.
    pub len: u64,
    pub tag: Option<u64>,
    pub cq_data: Option<u64>,
}

/// Callbacks into the external matching service. The endpoint conceptually
/// drops its lock across these calls; implementations must not call back
/// into the endpoint from inside them, but may record the handle and call
/// [`crate::endpoint::Endpoint::srx_start_msg`] or
/// [`crate::endpoint::Endpoint::srx_start_tag`] afterwards.
pub trait PeerSrx: Send {
    fn queue_msg(&mut self, info: SrxMsgInfo);
    fn queue_tag(&mut self, info: SrxMsgInfo);
}
