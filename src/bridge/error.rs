//! Bridge Error types

use std::time::Duration;

use thiserror::Error;

use super::protocol::SerializedError;

/// Failures of the underlying channel (could not deliver a message).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Serialization failed: {0}")]
    Serialize(String),

    #[error("IO error: {0}")]
    Io(String),
}

#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Call to {function} timed out after {after:?}")]
    Timeout { function: String, after: Duration },

    #[error("Worker did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("Worker failed to start: {0}")]
    WorkerFailed(SerializedError),

    #[error("{0}")]
    Remote(SerializedError),

    #[error("Bridge was reset")]
    Reset,

    #[error("Call cancelled")]
    Cancelled,

    #[error("Invalid payload: {0}")]
    Deserialize(String),
}

impl BridgeError {
    /// True for both the per-call timeout and the bootstrap ready timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. } | BridgeError::ReadyTimeout(_))
    }

    /// The worker-side error, when the failure originated in the worker.
    pub fn remote(&self) -> Option<&SerializedError> {
        match self {
            BridgeError::Remote(err) | BridgeError::WorkerFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl serde::Serialize for BridgeError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
