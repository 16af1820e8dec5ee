//! Error types shared by every RPC handler.
//!
//! This mirrors the taxonomy a transport layer (ttRPC/gRPC) expects:
//! each variant maps to exactly one wire status code, and `shim-bin` is
//! the only place that needs to know about that mapping.

use thiserror::Error;

/// Wire-neutral status code. `shim-bin` maps these onto ttRPC/gRPC codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Cancelled,
    Unavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("cancelled")]
    Cancelled,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("{0}")]
    Oci(#[from] oci_spec::OciSpecError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

impl Error {
    /// Construct a "this cannot happen" error. Per design, bug-class
    /// conditions are emitted as `Internal` with a `BUG:` prefix and
    /// logged, rather than asserted.
    pub fn bug(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("BUG: {msg}");
        Error::Internal(format!("BUG: {msg}"))
    }

    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::NotFound(_) => Code::NotFound,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::FailedPrecondition(_) => Code::FailedPrecondition,
            Error::Cancelled => Code::Cancelled,
            Error::Unavailable(_) => Code::Unavailable,
            Error::Internal(_) => Code::Internal,
            Error::Oci(_) => Code::InvalidArgument,
            Error::Io(_) => Code::Internal,
            Error::Json(_) => Code::InvalidArgument,
            Error::Any(_) => Code::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping() {
        assert_eq!(Error::NotFound("x".into()).code(), Code::NotFound);
        assert_eq!(Error::AlreadyExists("x".into()).code(), Code::AlreadyExists);
        assert_eq!(
            Error::FailedPrecondition("x".into()).code(),
            Code::FailedPrecondition
        );
        assert_eq!(Error::Cancelled.code(), Code::Cancelled);
    }

    #[test]
    fn bug_is_internal_with_prefix() {
        let e = Error::bug("sandbox pointer was nil");
        assert_eq!(e.code(), Code::Internal);
        assert!(e.to_string().contains("BUG:"));
    }
}
