//! Error types shared by the session engine.

use thiserror::Error;
use uuid::Uuid;

/// Failure reported by the platform BLE primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Failure(String),

    #[error("operation not supported by the transport")]
    NotSupported,

    #[error("link is disconnected")]
    Disconnected,
}

/// Malformed notification payload for a given feature.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{feature}: need {needed} bytes at offset {offset}, got {available}")]
    Truncated {
        feature: &'static str,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("{feature}: {reason}")]
    Invalid {
        feature: &'static str,
        reason: String,
    },
}

impl DecodeError {
    /// Checks that `needed` bytes are available at `offset`.
    pub fn ensure(
        feature: &'static str,
        data: &[u8],
        offset: usize,
        needed: usize,
    ) -> Result<(), DecodeError> {
        let available = data.len().saturating_sub(offset);
        if available < needed {
            return Err(DecodeError::Truncated {
                feature,
                offset,
                needed,
                available,
            });
        }
        Ok(())
    }
}

/// Characteristic or mask bit that maps to no registered feature.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("characteristic {0} does not belong to a known feature family")]
    UnknownFamily(Uuid),

    #[error("no {class} feature registered for id {id:#010x}")]
    UnknownIdentifier { class: String, id: u32 },
}

/// Errors surfaced by the session API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{operation} timed out")]
    TransportTimeout { operation: String },

    #[error("{operation} failed: {source}")]
    TransportFailure {
        operation: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    UnknownIdentifier(#[from] RegistryError),

    #[error("{0} was cancelled")]
    Cancelled(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl SessionError {
    pub fn not_connected(operation: &str) -> Self {
        SessionError::Precondition(format!("{operation} requires a connected device"))
    }

    /// Timeouts and transport failures are worth another attempt; the rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::TransportTimeout { .. } | SessionError::TransportFailure { .. }
        )
    }
}
