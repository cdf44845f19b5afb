//! Worker host
//!
//! The privileged side of the bridge. Decodes each inbound `request` into a
//! [`WorkerRequest`], runs it on its own task through a [`WorkerHandler`], and
//! answers with a `response` echoing the id. Also owns the one-time `ready`
//! handshake and out-of-band notifications.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::TransportError;
use super::protocol::{Message, ReadyInfo, SerializedError, WorkerRequest};
use super::transport::{ChannelTransport, MessageHandler};

/// Serves requests inside the worker.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    async fn handle(&self, request: WorkerRequest) -> Result<serde_json::Value, SerializedError>;
}

pub struct WorkerHost {
    transport: Arc<dyn ChannelTransport>,
}

impl WorkerHost {
    /// Attach a handler to a transport. Registers (replaces) the transport's inbound handler.
    pub fn new(transport: Arc<dyn ChannelTransport>, handler: Arc<dyn WorkerHandler>) -> Self {
        let weak_transport = Arc::downgrade(&transport);
        let on_message: MessageHandler = Arc::new(move |message| match message {
            Message::Request {
                id,
                function,
                params,
            } => {
                let handler = handler.clone();
                let weak_transport = weak_transport.clone();
                tokio::spawn(async move {
                    let response = match WorkerRequest::from_envelope(&function, params) {
                        Ok(request) => match handler.handle(request).await {
                            Ok(result) => Message::ok(id, function, result),
                            Err(error) => {
                                debug!("[worker] {} #{} failed: {}", function, id, error);
                                Message::err(id, function, error)
                            }
                        },
                        Err(e) => {
                            warn!("[worker] Rejecting undecodable {} #{}: {}", function, id, e);
                            Message::err(
                                id,
                                function,
                                SerializedError::new("InvalidRequest", e.to_string()),
                            )
                        }
                    };
                    match weak_transport.upgrade() {
                        Some(transport) => {
                            if let Err(e) = transport.send(response) {
                                warn!("[worker] Failed to send response #{}: {}", id, e);
                            }
                        }
                        None => debug!("[worker] Transport gone, dropping response #{}", id),
                    }
                });
            }
            other => debug!("[worker] Ignoring inbound {}", other.kind()),
        });
        transport.on_message(on_message);

        Self { transport }
    }

    /// Send the one-time ready handshake.
    pub fn announce_ready(&self, info: &ReadyInfo) -> Result<(), TransportError> {
        info!("[worker] Ready, loopback port {}", info.port);
        self.transport.send(Message::ready(info))
    }

    /// Report a failed start; the UI side fails every queued call with this error.
    pub fn announce_failure(&self, error: SerializedError) -> Result<(), TransportError> {
        warn!("[worker] Start failed: {}", error);
        self.transport.send(Message::ready_failed(error))
    }

    pub fn emit_event(
        &self,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.transport.send(Message::Event {
            name: name.into(),
            data,
        })
    }

    pub fn emit_progress(
        &self,
        transfer_id: impl Into<String>,
        bytes: u64,
        total: u64,
    ) -> Result<(), TransportError> {
        self.transport.send(Message::OutOfBandProgress {
            transfer_id: transfer_id.into(),
            bytes,
            total,
        })
    }
}
