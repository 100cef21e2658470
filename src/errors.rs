//! Error taxonomy shared by both notification subsystems.
//!
//! Every syscall site translates its errno values into one of these kinds;
//! codes with no mapping are preserved verbatim in [`Error::Unknown`] so
//! nothing is lost for diagnostics.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by this crate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The caller supplied malformed flags, a malformed mask, or a malformed
    /// path. Detected before or during the syscall; never by a decoder.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An operation was attempted on a closed source, or on a handle that is
    /// not of the expected kind.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A kernel-side limit was reached (instances, watches, marks, or the
    /// descriptor table).
    #[error("kernel resources exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The kernel could not allocate memory for the operation.
    #[error("insufficient kernel memory")]
    InsufficientMemory,

    /// The caller lacks the privilege required for the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// A previously valid identifier no longer refers to a live kernel
    /// object.
    #[error("stale reference: {0}")]
    StaleReference(&'static str),

    /// A bounded wait expired with no event ready.
    #[error("timed out waiting for an event")]
    Timeout,

    /// A read cycle found nothing to deliver. Returned instead of blocking
    /// or fabricating an empty event.
    #[error("no events ready on the handle")]
    WouldBlock,

    /// A kernel buffer did not tile exactly into whole event records. The
    /// buffer is discarded; no partially decoded events are delivered.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// An errno value this crate has no mapping for.
    #[error("unexpected kernel error code {0}")]
    Unknown(i32),
}
