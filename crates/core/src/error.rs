//! Protocol error model.

use thiserror::Error;

use crate::id::RecordId;

/// Result type used across the protocol layer.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Protocol-level error.
///
/// Covers failures that happen while encoding, decoding, or negotiating the
/// wire shape of a job. Store and transport failures belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A payload carried a `version` tag this build does not understand.
    #[error("unknown job version {0}")]
    UnknownJobVersion(u64),

    /// A payload could not be parsed into the shape its version demands.
    #[error("malformed job payload: {0}")]
    Malformed(String),

    /// The `version` advertised by an executor could not be interpreted.
    #[error("failed to check version {version:?}: {reason}")]
    InvalidExecutorVersion { version: String, reason: String },

    /// A job cannot be expressed in the wire version the executor supports.
    #[error("job {id} cannot be sent as version {version}: file {path:?} needs a newer executor")]
    NotRepresentable {
        id: RecordId,
        version: u8,
        path: String,
    },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl ProtocolError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_executor_version(version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidExecutorVersion {
            version: version.into(),
            reason: reason.into(),
        }
    }
}
