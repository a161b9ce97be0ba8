//! Public error types surfaced from the RDT API.

use failure::Fail;

/// Errors returned from the public API.
///
/// Protocol errors observed on the receive path (version mismatch, wrong
/// state, unknown TEID, short buffers) are *not* represented here: they are
/// logged and dropped, never escalated to the application.
#[derive(Debug, Fail)]
pub enum RdtError {
    #[fail(display = "bad parameter")]
    BadParam,
    #[fail(display = "module not started")]
    NotStarted,
    #[fail(display = "module already started")]
    AlreadyStarted,
    #[fail(display = "unknown or closed rdt tunnel")]
    BadRdtTunnel,
    #[fail(display = "tunnel limit exceeded for this channel")]
    ExceedLimit,
    #[fail(display = "out of memory")]
    Oom,
    #[fail(display = "{}", _0)]
    Generic(String),
}

pub type Result<T> = ::std::result::Result<T, RdtError>;
