//! Transfer data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Addressing + key material needed to stream one remote file's plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudFileDescriptor {
    pub uuid: String,
    pub bucket: String,
    pub region: String,
    /// Number of storage chunks. Zero means an empty file.
    pub chunks: u64,
    pub version: u32,
    /// Opaque per-file key; only the worker interprets it.
    pub key: String,
    pub size: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
}

impl CloudFileDescriptor {
    /// Zero-byte transfers never open a stream.
    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Directory,
}

/// Transfer lifecycle.
///
/// `queued → started → (paused ↔ started)* → finished | error | stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Queued,
    Started,
    Paused,
    Finished,
    Error,
    /// Cancelled by the user
    Stopped,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Finished | TransferState::Error | TransferState::Stopped
        )
    }

    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Queued, Started | Error | Stopped) => true,
            (Started, Paused | Finished | Error | Stopped) => true,
            (Paused, Started | Error | Stopped) => true,
            _ => false,
        }
    }
}

/// One upload or download as the UI sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TransferKind,
    pub item_type: ItemType,
    /// Remote item uuid (parent folder uuid for uploads until the item exists)
    pub uuid: String,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub name: String,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
    pub progress_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TransferRecord {
    pub fn new(
        id: String,
        kind: TransferKind,
        item_type: ItemType,
        uuid: String,
        name: String,
        total_size: u64,
    ) -> Self {
        Self {
            id,
            kind,
            item_type,
            uuid,
            state: TransferState::Queued,
            bytes_transferred: 0,
            total_size,
            name,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_at: None,
            progress_at: None,
            error: None,
        }
    }

    /// Apply a state change. Returns false (and changes nothing) if the
    /// transition is not allowed, which includes every change out of a terminal state.
    pub fn transition(&mut self, next: TransferState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        match next {
            TransferState::Started if self.started_at.is_none() => self.started_at = Some(now),
            TransferState::Finished => {
                self.bytes_transferred = self.bytes_transferred.max(self.total_size);
                self.finished_at = Some(now);
            }
            TransferState::Error => self.error_at = Some(now),
            TransferState::Stopped => self.finished_at = Some(now),
            _ => {}
        }
        self.state = next;
        true
    }

    /// Record progress. Counters never go backwards and terminal records are frozen.
    pub fn record_progress(&mut self, bytes: u64) -> bool {
        if self.state.is_terminal() || bytes < self.bytes_transferred {
            return false;
        }
        self.bytes_transferred = bytes;
        self.progress_at = Some(Utc::now());
        true
    }

    /// Calculate completion percentage (0-100)
    pub fn progress_percent(&self) -> f64 {
        if self.total_size == 0 {
            return if self.state == TransferState::Finished {
                100.0
            } else {
                0.0
            };
        }
        (self.bytes_transferred as f64 / self.total_size as f64) * 100.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Remote directory listing
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFolder {
    pub uuid: String,
    /// Parent folder uuid (the root's uuid for top-level folders)
    pub parent: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    /// Parent folder uuid
    pub parent: String,
    pub file: CloudFileDescriptor,
}

/// Every folder and file below one root folder, in no particular order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryTree {
    pub folders: Vec<RemoteFolder>,
    pub files: Vec<RemoteFile>,
}
