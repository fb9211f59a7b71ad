use thiserror::Error;

/// Library error type.
///
/// Variants group into the usual taxonomy: caller mistakes
/// (`InvalidArgument`, `Unsupported`), resource limits (`ResourceLimit`),
/// recoverable backpressure (`WouldBlock`, `HostUnreachable`), endpoint
/// lifecycle (`AddrInUse`, `AddrNotAvailable`, `ConnectionRefused`) and
/// context shutdown (`Terminated`). Internal invariant violations are
/// programming bugs and panic instead of surfacing here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("resource limit reached: {0}")]
    ResourceLimit(&'static str),

    #[error("operation would block")]
    WouldBlock,

    #[error("no route to peer")]
    HostUnreachable,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("address already in use")]
    AddrInUse,

    #[error("address not available")]
    AddrNotAvailable,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("context was terminated")]
    Terminated,
}

impl Error {
    /// True for the transient conditions a caller is expected to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::HostUnreachable)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
