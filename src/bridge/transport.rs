//! Channel Transport
//!
//! A duplex message channel between two independently scheduled execution contexts.
//! Delivery is FIFO per direction; there is no request/response pairing at this layer.
//!
//! Two implementations:
//! - [`LocalChannel`]: an in-process pair (UI task ↔ worker task). Messages are still
//!   serialized to JSON on every hop so nothing but plain data ever crosses.
//! - [`StreamTransport`]: line-delimited JSON over any `AsyncRead`/`AsyncWrite` pair
//!   (IPC socket, child stdio).

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::TransportError;
use super::protocol::Message;

/// Callback invoked for every inbound message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

pub trait ChannelTransport: Send + Sync {
    /// Fire-and-forget send. Never waits for the peer.
    fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Register the inbound handler. A second registration replaces the first.
    fn on_message(&self, handler: MessageHandler);
}

/// Shared "current handler" slot. Pump tasks read it per message so a
/// re-registration takes effect for the next delivery.
#[derive(Default, Clone)]
struct HandlerSlot {
    inner: Arc<RwLock<Option<MessageHandler>>>,
}

impl HandlerSlot {
    fn set(&self, handler: MessageHandler) {
        *self.inner.write() = Some(handler);
    }

    fn current(&self) -> Option<MessageHandler> {
        self.inner.read().clone()
    }
}

fn decode_line(line: &str) -> Option<Message> {
    match serde_json::from_str::<Message>(line) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("[transport] Dropping malformed message: {}: {}", e, line);
            None
        }
    }
}

fn encode(message: &Message) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::Serialize(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════
// LocalChannel
// ═══════════════════════════════════════════════════════════════════════════

/// One end of an in-process duplex channel.
pub struct LocalChannel {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    handler: HandlerSlot,
    label: &'static str,
}

impl LocalChannel {
    /// Create both ends. The first is conventionally the UI side.
    pub fn pair() -> (LocalChannel, LocalChannel) {
        let (ui_tx, worker_rx) = mpsc::unbounded_channel();
        let (worker_tx, ui_rx) = mpsc::unbounded_channel();
        (
            LocalChannel::new(ui_tx, ui_rx, "ui"),
            LocalChannel::new(worker_tx, worker_rx, "worker"),
        )
    }

    fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<String>,
        label: &'static str,
    ) -> Self {
        Self {
            outbound,
            inbound: Mutex::new(Some(inbound)),
            handler: HandlerSlot::default(),
            label,
        }
    }

    /// Start delivering to the handler slot. Messages that arrived earlier
    /// are still queued in the channel and get delivered in order.
    fn start_pump(&self) {
        let Some(mut inbound) = self.inbound.lock().take() else {
            return;
        };
        let handler = self.handler.clone();
        let label = self.label;
        tokio::spawn(async move {
            while let Some(line) = inbound.recv().await {
                let Some(message) = decode_line(&line) else {
                    continue;
                };
                match handler.current() {
                    Some(h) => h(message),
                    None => warn!("[transport:{}] No handler, dropping {}", label, message.kind()),
                }
            }
            debug!("[transport:{}] Peer closed, pump exiting", label);
        });
    }
}

impl ChannelTransport for LocalChannel {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let line = encode(&message)?;
        self.outbound.send(line).map_err(|_| TransportError::Closed)
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handler.set(handler);
        self.start_pump();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// StreamTransport
// ═══════════════════════════════════════════════════════════════════════════

/// Line-delimited JSON over a byte stream pair.
///
/// A writer task drains an mpsc queue so each line is written atomically; a reader
/// task parses one message per line and hands it to the current handler.
pub struct StreamTransport {
    out_tx: mpsc::UnboundedSender<String>,
    handler: HandlerSlot,
}

impl StreamTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let handler = HandlerSlot::default();

        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = out_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    warn!("[transport:stream] Writer closed");
                    break;
                }
            }
        });

        let slot = handler.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let Some(message) = decode_line(&line) else {
                            continue;
                        };
                        match slot.current() {
                            Some(h) => h(message),
                            None => warn!(
                                "[transport:stream] No handler, dropping {}",
                                message.kind()
                            ),
                        }
                    }
                    Ok(None) => {
                        debug!("[transport:stream] EOF");
                        break;
                    }
                    Err(e) => {
                        warn!("[transport:stream] Read error: {}", e);
                        break;
                    }
                }
            }
        });

        Self { out_tx, handler }
    }
}

impl ChannelTransport for StreamTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let line = encode(&message)?;
        self.out_tx.send(line).map_err(|_| TransportError::Closed)
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handler.set(handler);
    }
}
