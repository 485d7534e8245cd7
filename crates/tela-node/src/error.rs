use tela_wire::frame::FrameError;
use tela_wire::rpc::EnvelopeError;
use tela_wire::tdf::TdfError;
use thiserror::Error;

/// Errors that can occur during node runtime operation.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Malformed arguments: reserved id, oversize value, bad mask.
    #[error("invalid argument")]
    InvalidArgument,
    /// A bounded resource pool is exhausted.
    #[error("no capacity: {0}")]
    NoCapacity(&'static str),
    /// The referenced key, record, or request id is not known.
    #[error("no such entry")]
    NoSuchEntry,
    /// The operation is not allowed at the caller's privilege level.
    #[error("not permitted")]
    NotPermitted,
    /// A wait exceeded its timeout.
    #[error("timed out")]
    Timeout,
    /// No usable key could be resolved for the packet.
    #[error("no key available")]
    NoKey,
    /// Authentication or integrity check failed (tampered record).
    #[error("authentication failure")]
    AuthFailure,
    /// Idempotent duplicate: the value or registration already exists.
    #[error("already present")]
    Already,
    /// The interface or its backend has shut down.
    #[error("interface closed")]
    InterfaceClosed,
    /// Wire-level frame error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// RPC envelope error.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    /// TDF codec error.
    #[error("tdf error: {0}")]
    Tdf(#[from] TdfError),
}
