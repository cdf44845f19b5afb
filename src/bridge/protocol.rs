//! Bridge wire protocol
//!
//! Every message crossing the UI ↔ worker boundary is one JSON object tagged by `type`:
//! - `request`: `{"type":"request","id":1,"function":"readChunk","params":{...}}`
//! - `response`: `{"type":"response","id":1,"function":"readChunk","success":true,"result":...}`
//! - `ready`: one-time handshake from the worker carrying the loopback port/token
//! - `event` / `out-of-band-progress`: worker-initiated notifications (no `id`)
//!
//! Requests are a closed enum ([`WorkerRequest`]) so every call site is checked by the
//! compiler, while the envelope itself stays a generic `function` + `params` pair.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::transfer::types::CloudFileDescriptor;

// ═══════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════

/// One unit on the channel transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Request {
        id: u64,
        function: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    Response {
        id: u64,
        function: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
    Ready {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
    Event {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    OutOfBandProgress {
        transfer_id: String,
        bytes: u64,
        total: u64,
    },
}

impl Message {
    pub fn ok(id: u64, function: impl Into<String>, result: serde_json::Value) -> Self {
        Message::Response {
            id,
            function: function.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, function: impl Into<String>, error: SerializedError) -> Self {
        Message::Response {
            id,
            function: function.into(),
            success: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn ready(info: &ReadyInfo) -> Self {
        Message::Ready {
            success: true,
            port: Some(info.port),
            token: Some(info.token.clone()),
            error: None,
        }
    }

    pub fn ready_failed(error: SerializedError) -> Self {
        Message::Ready {
            success: false,
            port: None,
            token: None,
            error: Some(error),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Ready { .. } => "ready",
            Message::Event { .. } => "event",
            Message::OutOfBandProgress { .. } => "out-of-band-progress",
        }
    }
}

/// An error flattened for transport across the execution-context boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub rendered_string: String,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let rendered_string = format!("{}: {}", name, message);
        Self {
            name,
            message,
            stack: None,
            rendered_string,
        }
    }

    /// Capture an error and its `source()` chain. The chain stands in for a stack.
    pub fn from_error(name: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut serialized = Self::new(name, err.to_string());
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        if !chain.is_empty() {
            serialized.stack = Some(chain.join("\n"));
        }
        serialized
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.rendered_string)
    }
}

impl std::error::Error for SerializedError {}

// ═══════════════════════════════════════════════════════════════════════════
// Ready handshake
// ═══════════════════════════════════════════════════════════════════════════

/// Bootstrap data published by the worker once it is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyInfo {
    /// Loopback HTTP server port.
    pub port: u16,
    /// Bearer token for the loopback server.
    pub token: String,
}

impl ReadyInfo {
    /// URL for streaming one file's plaintext through the loopback server.
    pub fn stream_url(&self, file: &CloudFileDescriptor) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(file)?;
        Ok(format!(
            "http://127.0.0.1:{}/stream?file={}",
            self.port,
            URL_SAFE_NO_PAD.encode(json)
        ))
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════

/// Every operation the worker serves. Serialized as `{"function": ..., "params": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", content = "params", rename_all = "camelCase")]
pub enum WorkerRequest {
    Ping,
    #[serde(rename_all = "camelCase")]
    ReadChunk {
        file: CloudFileDescriptor,
        index: u64,
    },
    #[serde(rename_all = "camelCase")]
    ListDirectoryTree { uuid: String },
    #[serde(rename_all = "camelCase")]
    CreateFolder { parent: String, name: String },
    #[serde(rename_all = "camelCase")]
    BeginUpload {
        parent: String,
        name: String,
        size: u64,
    },
    /// `data` is standard base64.
    #[serde(rename_all = "camelCase")]
    UploadChunk {
        upload_id: String,
        index: u64,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    FinishUpload { upload_id: String },
    #[serde(rename_all = "camelCase")]
    AbortUpload { upload_id: String },
}

/// Result of `readChunk`; the plaintext chunk as standard base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub data: String,
}

/// Result of `createFolder` / `beginUpload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedId {
    pub id: String,
}

impl WorkerRequest {
    pub fn function_name(&self) -> &'static str {
        match self {
            WorkerRequest::Ping => "ping",
            WorkerRequest::ReadChunk { .. } => "readChunk",
            WorkerRequest::ListDirectoryTree { .. } => "listDirectoryTree",
            WorkerRequest::CreateFolder { .. } => "createFolder",
            WorkerRequest::BeginUpload { .. } => "beginUpload",
            WorkerRequest::UploadChunk { .. } => "uploadChunk",
            WorkerRequest::FinishUpload { .. } => "finishUpload",
            WorkerRequest::AbortUpload { .. } => "abortUpload",
        }
    }

    /// Wrap into a `request` envelope.
    pub fn into_envelope(self, id: u64) -> Result<Message, serde_json::Error> {
        let function = self.function_name().to_string();
        let mut value = serde_json::to_value(self)?;
        let params = value
            .get_mut("params")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok(Message::Request {
            id,
            function,
            params,
        })
    }

    /// Rebuild a typed request from an envelope's `function` and `params`.
    pub fn from_envelope(
        function: &str,
        params: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let mut object = serde_json::Map::new();
        object.insert(
            "function".to_string(),
            serde_json::Value::String(function.to_string()),
        );
        if !params.is_null() {
            object.insert("params".to_string(), params);
        }
        serde_json::from_value(serde_json::Value::Object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> CloudFileDescriptor {
        CloudFileDescriptor {
            uuid: "f-1".to_string(),
            bucket: "bucket-1".to_string(),
            region: "de-1".to_string(),
            chunks: 2,
            version: 2,
            key: "k".to_string(),
            size: 10,
            name: "a.txt".to_string(),
            parent_path: None,
        }
    }

    #[test]
    fn test_response_wire_shape() {
        let msg = Message::err(7, "readChunk", SerializedError::new("NotFound", "gone"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["id"], 7);
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["name"], "NotFound");
        assert_eq!(json["error"]["renderedString"], "NotFound: gone");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_progress_wire_shape() {
        let json = serde_json::to_value(Message::OutOfBandProgress {
            transfer_id: "t".to_string(),
            bytes: 1,
            total: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "out-of-band-progress");
        assert_eq!(json["transferId"], "t");
    }

    #[test]
    fn test_request_envelope_keeps_generic_shape() {
        let msg = WorkerRequest::ReadChunk {
            file: descriptor(),
            index: 1,
        }
        .into_envelope(3)
        .unwrap();

        match &msg {
            Message::Request {
                id,
                function,
                params,
            } => {
                assert_eq!(*id, 3);
                assert_eq!(function, "readChunk");
                assert_eq!(params["index"], 1);
                assert_eq!(params["file"]["uuid"], "f-1");
            }
            other => panic!("unexpected {:?}", other),
        }

        if let Message::Request {
            function, params, ..
        } = msg
        {
            let back = WorkerRequest::from_envelope(&function, params).unwrap();
            assert_eq!(
                back,
                WorkerRequest::ReadChunk {
                    file: descriptor(),
                    index: 1
                }
            );
        }
    }

    #[test]
    fn test_unit_request_has_null_params() {
        let msg = WorkerRequest::Ping.into_envelope(1).unwrap();
        let Message::Request {
            function, params, ..
        } = msg
        else {
            panic!("expected request");
        };
        assert_eq!(function, "ping");
        assert!(params.is_null());
        assert_eq!(
            WorkerRequest::from_envelope(&function, params).unwrap(),
            WorkerRequest::Ping
        );
    }

    #[test]
    fn test_unknown_function_is_rejected() {
        assert!(WorkerRequest::from_envelope("formatDisk", serde_json::json!({})).is_err());
    }

    #[test]
    fn test_serialized_error_captures_source_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let outer = crate::transfer::error::TransferError::Io(inner);
        let serialized = SerializedError::from_error("TransferError", &outer);
        assert_eq!(serialized.name, "TransferError");
        assert!(serialized.message.contains("disk full"));
    }

    #[test]
    fn test_stream_url_encodes_descriptor() {
        let info = ReadyInfo {
            port: 4242,
            token: "tok".to_string(),
        };
        let url = info.stream_url(&descriptor()).unwrap();
        assert!(url.starts_with("http://127.0.0.1:4242/stream?file="));
        let encoded = url.split("file=").nth(1).unwrap();
        let decoded: CloudFileDescriptor =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded, descriptor());
        assert_eq!(info.authorization_header(), "Bearer tok");
    }
}
