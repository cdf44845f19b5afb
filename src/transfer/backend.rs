//! Cloud backend interface
//!
//! What the transfer engine needs from remote storage. In the UI process this
//! is a [`BridgeBackend`](super::remote::BridgeBackend) forwarding to the
//! worker; inside the worker it is the key-holding network client.

use async_trait::async_trait;
use bytes::Bytes;

use super::error::TransferError;
use super::types::{CloudFileDescriptor, DirectoryTree};

/// Storage operations, chunk-granular so callers control memory and backpressure.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Plaintext of chunk `index` (`0..file.chunks`).
    async fn read_chunk(&self, file: &CloudFileDescriptor, index: u64)
        -> Result<Bytes, TransferError>;

    /// Every folder and file below folder `uuid`.
    async fn list_directory_tree(&self, uuid: &str) -> Result<DirectoryTree, TransferError>;

    /// Create folder `name` in `parent`, returning the new folder's uuid.
    async fn create_folder(&self, parent: &str, name: &str) -> Result<String, TransferError>;

    /// Open an upload session for a file of `size` bytes; returns the upload id.
    async fn begin_upload(
        &self,
        parent: &str,
        name: &str,
        size: u64,
    ) -> Result<String, TransferError>;

    async fn write_chunk(
        &self,
        upload_id: &str,
        index: u64,
        data: Bytes,
    ) -> Result<(), TransferError>;

    /// Commit the upload; returns the new file's uuid.
    async fn finish_upload(&self, upload_id: &str) -> Result<String, TransferError>;

    /// Discard an unfinished upload. Unknown ids are not an error.
    async fn abort_upload(&self, upload_id: &str) -> Result<(), TransferError>;
}
