//! Error taxonomy for the Exchange client.
//!
//! Every fallible public operation returns [`EngineError`]. The variants map
//! one-to-one onto the surface-visible error kinds of the Exchange wire
//! protocol: local validation failures, illegal state transitions, and
//! server-reported rejections are all distinguishable by callers without
//! string matching.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The error kinds a caller of this crate can observe.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Local address validation failed before any protocol use.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// An operation was invoked against a call or engine state that does
    /// not permit it (e.g. `answer()` on an outbound call, `send()` on a
    /// call that is not active).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A binary send was requested but the payload was not byte data.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The operation could not complete because the connection closed.
    #[error("disconnected")]
    Disconnected,

    /// A dial or heartbeat deadline elapsed before a terminal event arrived.
    #[error("timed out")]
    Timeout,

    /// An outbound dial was rejected by the Exchange with `BUSY`.
    #[error("call failed: {0}")]
    CallFailed(String),

    /// A `REGISTER` was rejected by the Exchange with `REGISTER_FAILED`.
    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    /// The underlying transport reported a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// An inbound frame could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}
