//! Error taxonomy at component boundaries.
//!
//! Internal plumbing uses `anyhow`; these types are what callers match on.
//! Transport and connection errors are recovered by the loop that sees them,
//! configuration errors are rejected before use, and capture failures degrade
//! to stale-frame service instead of surfacing here.

use thiserror::Error;

/// The capture source could not be opened or produced no readable frame.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("invalid source descriptor '{0}'")]
    InvalidDescriptor(String),

    #[error("no capture backend compiled in for {0}")]
    Unsupported(String),

    #[error("failed to open {descriptor}: {message}")]
    Backend { descriptor: String, message: String },

    #[error("{descriptor} opened but produced no readable frame: {message}")]
    NoFrame { descriptor: String, message: String },

    #[error("capture source was stopped")]
    Stopped,
}

/// Soft failure: every reconnection attempt failed. Logged, never raised.
#[derive(Debug, Clone, Error)]
#[error("reconnection to {descriptor} exhausted after {attempts} attempts; serving last cached frame")]
pub struct ReconnectExhausted {
    pub descriptor: String,
    pub attempts: u32,
}

/// Wire-level failure on a framed connection.
///
/// A zero-byte read at a frame boundary is not an error; see
/// [`crate::transport::ReadOutcome::Closed`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("peer disconnected mid-frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A configuration value is outside its valid range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must be within [{min}, {max}], got {value}")]
    QualityOutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("port must be within [1, 65535], got {0}")]
    PortOutOfRange(i64),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0}")]
    Invalid(String),
}

/// The external detector failed on a frame. The frame is skipped.
#[derive(Debug, Error)]
#[error("detector '{backend}' failed: {message}")]
pub struct DetectionError {
    pub backend: String,
    pub message: String,
}

/// Failure of the detect-then-encode step for one frame.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error("region encoding failed: {0}")]
    Encode(String),
}
