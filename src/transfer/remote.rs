//! Backend over the bridge
//!
//! [`BridgeBackend`] is the UI-side [`CloudBackend`]: each operation becomes a
//! typed [`WorkerRequest`]. [`BackendWorker`] is the worker-side
//! [`WorkerHandler`] that serves those requests from the key-holding backend.
//! Chunk bytes travel as standard base64 inside the JSON envelope.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use super::backend::CloudBackend;
use super::error::TransferError;
use super::types::{CloudFileDescriptor, DirectoryTree};
use crate::bridge::protocol::{ChunkPayload, CreatedId};
use crate::bridge::{BridgeError, RpcBridge, SerializedError, WorkerHandler, WorkerRequest};

/// Worker-originated errors come back under their original name.
fn from_bridge(err: BridgeError) -> TransferError {
    match err {
        BridgeError::Remote(remote) => remote.into(),
        other => TransferError::Bridge(other),
    }
}

#[derive(Clone)]
pub struct BridgeBackend {
    bridge: RpcBridge,
}

impl BridgeBackend {
    pub fn new(bridge: RpcBridge) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &RpcBridge {
        &self.bridge
    }
}

#[async_trait]
impl CloudBackend for BridgeBackend {
    async fn read_chunk(
        &self,
        file: &CloudFileDescriptor,
        index: u64,
    ) -> Result<Bytes, TransferError> {
        let payload: ChunkPayload = self
            .bridge
            .call_as(WorkerRequest::ReadChunk {
                file: file.clone(),
                index,
            })
            .await
            .map_err(from_bridge)?;
        let data = STANDARD
            .decode(payload.data.as_bytes())
            .map_err(|e| TransferError::Backend(format!("bad chunk encoding: {}", e)))?;
        Ok(Bytes::from(data))
    }

    async fn list_directory_tree(&self, uuid: &str) -> Result<DirectoryTree, TransferError> {
        self.bridge
            .call_as(WorkerRequest::ListDirectoryTree {
                uuid: uuid.to_string(),
            })
            .await
            .map_err(from_bridge)
    }

    async fn create_folder(&self, parent: &str, name: &str) -> Result<String, TransferError> {
        let created: CreatedId = self
            .bridge
            .call_as(WorkerRequest::CreateFolder {
                parent: parent.to_string(),
                name: name.to_string(),
            })
            .await
            .map_err(from_bridge)?;
        Ok(created.id)
    }

    async fn begin_upload(
        &self,
        parent: &str,
        name: &str,
        size: u64,
    ) -> Result<String, TransferError> {
        let created: CreatedId = self
            .bridge
            .call_as(WorkerRequest::BeginUpload {
                parent: parent.to_string(),
                name: name.to_string(),
                size,
            })
            .await
            .map_err(from_bridge)?;
        Ok(created.id)
    }

    async fn write_chunk(
        &self,
        upload_id: &str,
        index: u64,
        data: Bytes,
    ) -> Result<(), TransferError> {
        self.bridge
            .call(WorkerRequest::UploadChunk {
                upload_id: upload_id.to_string(),
                index,
                data: STANDARD.encode(&data),
            })
            .await
            .map_err(from_bridge)?;
        Ok(())
    }

    async fn finish_upload(&self, upload_id: &str) -> Result<String, TransferError> {
        let created: CreatedId = self
            .bridge
            .call_as(WorkerRequest::FinishUpload {
                upload_id: upload_id.to_string(),
            })
            .await
            .map_err(from_bridge)?;
        Ok(created.id)
    }

    async fn abort_upload(&self, upload_id: &str) -> Result<(), TransferError> {
        self.bridge
            .call(WorkerRequest::AbortUpload {
                upload_id: upload_id.to_string(),
            })
            .await
            .map_err(from_bridge)?;
        Ok(())
    }
}

/// Serves [`WorkerRequest`]s from a worker-local backend.
pub struct BackendWorker {
    backend: Arc<dyn CloudBackend>,
}

fn to_json<T: Serialize>(value: T) -> Result<serde_json::Value, TransferError> {
    serde_json::to_value(value).map_err(|e| TransferError::Backend(format!("encode result: {}", e)))
}

impl BackendWorker {
    pub fn new(backend: Arc<dyn CloudBackend>) -> Self {
        Self { backend }
    }

    async fn dispatch(&self, request: WorkerRequest) -> Result<serde_json::Value, TransferError> {
        let value = match request {
            WorkerRequest::Ping => serde_json::json!("pong"),
            WorkerRequest::ReadChunk { file, index } => {
                let chunk = self.backend.read_chunk(&file, index).await?;
                to_json(ChunkPayload {
                    data: STANDARD.encode(&chunk),
                })?
            }
            WorkerRequest::ListDirectoryTree { uuid } => {
                let tree = self.backend.list_directory_tree(&uuid).await?;
                to_json(tree)?
            }
            WorkerRequest::CreateFolder { parent, name } => {
                let id = self.backend.create_folder(&parent, &name).await?;
                to_json(CreatedId { id })?
            }
            WorkerRequest::BeginUpload { parent, name, size } => {
                let id = self.backend.begin_upload(&parent, &name, size).await?;
                to_json(CreatedId { id })?
            }
            WorkerRequest::UploadChunk {
                upload_id,
                index,
                data,
            } => {
                let data = STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| TransferError::InvalidSource(format!("bad chunk encoding: {}", e)))?;
                self.backend
                    .write_chunk(&upload_id, index, Bytes::from(data))
                    .await?;
                serde_json::Value::Null
            }
            WorkerRequest::FinishUpload { upload_id } => {
                let id = self.backend.finish_upload(&upload_id).await?;
                to_json(CreatedId { id })?
            }
            WorkerRequest::AbortUpload { upload_id } => {
                self.backend.abort_upload(&upload_id).await?;
                serde_json::Value::Null
            }
        };
        Ok(value)
    }
}

#[async_trait]
impl WorkerHandler for BackendWorker {
    async fn handle(&self, request: WorkerRequest) -> Result<serde_json::Value, SerializedError> {
        let function = request.function_name();
        match self.dispatch(request).await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!("[worker] {} failed: {}", function, e);
                Err(e.to_serialized())
            }
        }
    }
}
