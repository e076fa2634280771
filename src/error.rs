//! # Engine Error Types
//!
//! All engine-internal components return `Result<T, EngineError>`. Each
//! variant carries the stable error code from the wire protocol (spec §6)
//! so that a `CommandProcessor` or `AntiEntropyProtocol` response can be
//! built directly from the error without re-deriving the code at the call
//! site. Only `main.rs` and other outer glue collapse this into
//! `anyhow::Result`.

use thiserror::Error;

/// Stable, wire-visible error codes (spec §6).
///
/// These integers are part of the response envelope contract and must
/// never be renumbered once a node has shipped them to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    InvalidRequest = 100,
    InvalidType = 101,
    NotFound = 102,
    PayloadTooLarge = 103,
    Timeout = 104,
    RateLimited = 105,
    Internal = 106,
}

/// The engine's internal error type.
///
/// Every variant maps to exactly one [`ErrorCode`] via [`EngineError::code`].
/// Internal error messages are logged; only the stable code and a short
/// human-readable message ever cross the response envelope boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("value is not a valid integer")]
    InvalidType,

    #[error("key not found")]
    NotFound,

    #[error("payload exceeds size limit: {0}")]
    PayloadTooLarge(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("rate limited, retry later")]
    RateLimited,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("storage I/O error: {0}")]
    StorageIo(String),

    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("incompatible protocol version: {0}")]
    IncompatibleVersion(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map this error to the stable wire-visible error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            EngineError::InvalidType => ErrorCode::InvalidType,
            EngineError::NotFound => ErrorCode::NotFound,
            EngineError::PayloadTooLarge(_) => ErrorCode::PayloadTooLarge,
            EngineError::Timeout(_) => ErrorCode::Timeout,
            EngineError::RateLimited => ErrorCode::RateLimited,
            // Everything else is an internal condition from the caller's
            // point of view: malformed bytes, disk failures, protocol
            // desync, unreachable peers. Stack traces never leave this
            // process; only the stable code and this message do.
            EngineError::MalformedPayload(_)
            | EngineError::TransportUnavailable(_)
            | EngineError::StorageIo(_)
            | EngineError::StorageCorruption(_)
            | EngineError::ProtocolError(_)
            | EngineError::PeerUnreachable(_)
            | EngineError::IncompatibleVersion(_)
            | EngineError::Internal(_) => ErrorCode::Internal,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
