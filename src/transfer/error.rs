//! Transfer Error types

use thiserror::Error;

use crate::bridge::{BridgeError, SerializedError};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Size mismatch: expected {expected} bytes, wrote {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Invalid directory tree: {0}")]
    InvalidTree(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid source: {0}")]
    InvalidSource(String),
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Flatten for the bridge. Worker-originated errors keep their original name.
    pub fn to_serialized(&self) -> SerializedError {
        match self {
            TransferError::Bridge(BridgeError::Remote(err)) => err.clone(),
            TransferError::Io(_) => SerializedError::from_error("IoError", self),
            TransferError::Bridge(_) => SerializedError::from_error("BridgeError", self),
            TransferError::Cancelled => SerializedError::new("Cancelled", self.to_string()),
            TransferError::SizeMismatch { .. } => {
                SerializedError::new("SizeMismatch", self.to_string())
            }
            TransferError::InvalidTree(_) => SerializedError::new("InvalidTree", self.to_string()),
            TransferError::NotFound(msg) => SerializedError::new("NotFound", msg.clone()),
            TransferError::Backend(msg) => SerializedError::new("BackendError", msg.clone()),
            TransferError::InvalidSource(_) => {
                SerializedError::new("InvalidSource", self.to_string())
            }
        }
    }
}

impl From<SerializedError> for TransferError {
    /// Rebuild a worker-side error on the UI side.
    fn from(err: SerializedError) -> Self {
        match err.name.as_str() {
            "NotFound" => TransferError::NotFound(err.message),
            "Cancelled" => TransferError::Cancelled,
            _ => TransferError::Bridge(BridgeError::Remote(err)),
        }
    }
}

// Serializable so a UI layer can forward it as-is
impl serde::Serialize for TransferError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
