use thiserror::Error;

/// Errors returned by endpoint entry points and carried in error completions.
///
/// Local errors (bad arguments, peer in backoff) are returned directly from
/// the call that caused them and never produce a completion entry. Errors
/// discovered asynchronously through device completions are reported as
/// [`crate::cq::CqErrEntry`] carrying one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RdmError {
    /// A pool, arena or credit budget is exhausted.
    #[error("out of resources")]
    OutOfResources,
    /// Transient condition (peer in backoff, device TX queue full).
    /// The operation may be retried after running progress.
    #[error("resource temporarily unavailable")]
    TryAgain,
    /// The peer does not advertise a capability the operation requires.
    #[error("not supported by peer")]
    NotSupported,
    /// Bad arguments or a malformed packet.
    #[error("invalid argument")]
    Invalid,
    /// The remote side failed the operation (receiver-not-ready surfaced
    /// to the application, or the remote endpoint was destroyed).
    #[error("remote endpoint error")]
    Remote,
    /// The matched receive buffer was smaller than the incoming message.
    #[error("message truncated")]
    Truncated,
    /// Any other device error code.
    #[error("transport error ({0})")]
    Transport(u32),
    /// A peek found no matching unexpected message.
    #[error("no matching message")]
    NoMessage,
    /// The receive was cancelled by a discard.
    #[error("operation cancelled")]
    Cancelled,
}

pub type RdmResult<T> = Result<T, RdmError>;
