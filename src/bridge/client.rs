//! RPC Bridge (UI side)
//!
//! Correlates requests with responses over a [`ChannelTransport`]:
//! - every call gets a fresh id and a pending entry holding a oneshot reply sender
//! - a matching `response` removes the entry and resolves/rejects the caller
//! - calls made before the worker's `ready` handshake wait for it, bounded by
//!   `ready_timeout`; every call is bounded by `call_timeout`
//!
//! Pending entries are removed exactly once: by the response, by [`RpcBridge::cancel`],
//! by [`RpcBridge::reset`], or by the call's own guard when it times out or is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use super::error::{BridgeError, TransportError};
use super::protocol::{Message, ReadyInfo, SerializedError, WorkerRequest};
use super::transport::{ChannelTransport, MessageHandler};
use crate::config::BridgeConfig;

/// Readiness of the worker as seen by the UI side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    /// No `ready` handshake yet (or the bridge was reset).
    Pending,
    Ready(ReadyInfo),
    /// The worker reported a failed start.
    Failed(SerializedError),
}

/// Worker-initiated notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Event {
        name: String,
        data: serde_json::Value,
    },
    Progress {
        transfer_id: String,
        bytes: u64,
        total: u64,
    },
}

struct PendingCall {
    function: &'static str,
    reply: oneshot::Sender<Result<serde_json::Value, BridgeError>>,
    issued_at: Instant,
}

struct BridgeShared {
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_id: AtomicU64,
    ready_tx: watch::Sender<ReadyState>,
    events_tx: broadcast::Sender<WorkerEvent>,
}

/// Removes the pending entry when the call finishes in any way.
struct PendingGuard<'a> {
    shared: &'a BridgeShared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.shared.pending.lock().remove(&self.id).is_some() {
            debug!("[bridge] Pending call {} abandoned", self.id);
        }
    }
}

impl BridgeShared {
    fn handle_message(&self, message: Message, transport: &Weak<dyn ChannelTransport>) {
        match message {
            Message::Response {
                id,
                function,
                success,
                result,
                error,
            } => {
                let Some(call) = self.pending.lock().remove(&id) else {
                    warn!(
                        "[bridge] Dropping orphaned response {} ({}): no pending call",
                        id, function
                    );
                    return;
                };
                debug!(
                    "[bridge] {} #{} answered in {:?}",
                    call.function,
                    id,
                    call.issued_at.elapsed()
                );
                let outcome = if success {
                    Ok(result.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(BridgeError::Remote(error.unwrap_or_else(|| {
                        SerializedError::new("UnknownError", "Worker reported failure without error")
                    })))
                };
                // Receiver may be gone if the caller was dropped concurrently
                let _ = call.reply.send(outcome);
            }
            Message::Ready {
                success,
                port,
                token,
                error,
            } => {
                let state = match (success, port, token) {
                    (true, Some(port), Some(token)) => {
                        info!("[bridge] Worker ready, loopback on port {}", port);
                        ReadyState::Ready(ReadyInfo { port, token })
                    }
                    (true, _, _) => {
                        warn!("[bridge] Ready handshake missing loopback data");
                        ReadyState::Failed(SerializedError::new(
                            "InvalidReady",
                            "Ready handshake missing port or token",
                        ))
                    }
                    (false, _, _) => {
                        let err = error.unwrap_or_else(|| {
                            SerializedError::new("WorkerFailed", "Worker failed to start")
                        });
                        warn!("[bridge] Worker reported failed start: {}", err);
                        ReadyState::Failed(err)
                    }
                };
                self.ready_tx.send_replace(state);
            }
            Message::Event { name, data } => {
                let _ = self.events_tx.send(WorkerEvent::Event { name, data });
            }
            Message::OutOfBandProgress {
                transfer_id,
                bytes,
                total,
            } => {
                let _ = self.events_tx.send(WorkerEvent::Progress {
                    transfer_id,
                    bytes,
                    total,
                });
            }
            Message::Request { id, function, .. } => {
                warn!("[bridge] Unsolicited request {} ({}) from worker", id, function);
                if let Some(transport) = transport.upgrade() {
                    let reply = Message::err(
                        id,
                        function.clone(),
                        SerializedError::new(
                            "UnsupportedRequest",
                            format!("UI side does not serve {}", function),
                        ),
                    );
                    if let Err(e) = transport.send(reply) {
                        warn!("[bridge] Failed to reject unsolicited request: {}", e);
                    }
                }
            }
        }
    }
}

/// Handle for issuing calls to the worker. Cheap to clone; pass it to whatever needs it.
#[derive(Clone)]
pub struct RpcBridge {
    shared: Arc<BridgeShared>,
    transport: Arc<dyn ChannelTransport>,
    config: BridgeConfig,
}

impl RpcBridge {
    /// Attach to a transport. Registers (replaces) the transport's inbound handler.
    pub fn new(transport: Arc<dyn ChannelTransport>, config: BridgeConfig) -> Self {
        let (ready_tx, _) = watch::channel(ReadyState::Pending);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(BridgeShared {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ready_tx,
            events_tx,
        });

        let weak_transport = Arc::downgrade(&transport);
        let handler_shared = shared.clone();
        let handler: MessageHandler = Arc::new(move |message| {
            handler_shared.handle_message(message, &weak_transport);
        });
        transport.on_message(handler);

        Self {
            shared,
            transport,
            config,
        }
    }

    /// Issue a call and wait for its result.
    pub async fn call(&self, request: WorkerRequest) -> Result<serde_json::Value, BridgeError> {
        let function = request.function_name();
        self.wait_ready().await?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = request
            .into_envelope(id)
            .map_err(|e| TransportError::Serialize(e.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            id,
            PendingCall {
                function,
                reply: reply_tx,
                issued_at: Instant::now(),
            },
        );
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        if let Err(e) = self.transport.send(envelope) {
            warn!("[bridge] Failed to send {} #{}: {}", function, id, e);
            return Err(e.into());
        }

        let after = self.config.call_timeout();
        match tokio::time::timeout(after, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::Reset),
            Err(_) => {
                warn!("[bridge] {} #{} timed out after {:?}", function, id, after);
                Err(BridgeError::Timeout {
                    function: function.to_string(),
                    after,
                })
            }
        }
    }

    /// [`RpcBridge::call`] and decode the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        request: WorkerRequest,
    ) -> Result<T, BridgeError> {
        let value = self.call(request).await?;
        serde_json::from_value(value).map_err(|e| BridgeError::Deserialize(e.to_string()))
    }

    /// Wait for the `ready` handshake (bounded by `ready_timeout`).
    pub async fn wait_ready(&self) -> Result<ReadyInfo, BridgeError> {
        let mut rx = self.shared.ready_tx.subscribe();
        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    ReadyState::Ready(info) => return Ok(info),
                    ReadyState::Failed(err) => return Err(BridgeError::WorkerFailed(err)),
                    ReadyState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(BridgeError::Reset);
                }
            }
        };

        let limit = self.config.ready_timeout();
        match tokio::time::timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!("[bridge] Worker not ready after {:?}", limit);
                Err(BridgeError::ReadyTimeout(limit))
            }
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.ready_tx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.shared.ready_tx.borrow(), ReadyState::Ready(_))
    }

    /// Current loopback server port/token, once the worker is ready.
    pub fn loopback(&self) -> Option<ReadyInfo> {
        match &*self.shared.ready_tx.borrow() {
            ReadyState::Ready(info) => Some(info.clone()),
            _ => None,
        }
    }

    /// Observe readiness changes (including port/token rotation after a worker restart).
    pub fn subscribe_ready(&self) -> watch::Receiver<ReadyState> {
        self.shared.ready_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Reject one in-flight call with [`BridgeError::Cancelled`].
    pub fn cancel(&self, id: u64) -> bool {
        match self.shared.pending.lock().remove(&id) {
            Some(call) => {
                info!("[bridge] Cancelled {} #{}", call.function, id);
                let _ = call.reply.send(Err(BridgeError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Reject every in-flight call and forget the handshake (worker restarted).
    pub fn reset(&self) {
        let drained: Vec<(u64, PendingCall)> = self.shared.pending.lock().drain().collect();
        info!("[bridge] Reset, rejecting {} pending calls", drained.len());
        for (_, call) in drained {
            let _ = call.reply.send(Err(BridgeError::Reset));
        }
        self.shared.ready_tx.send_replace(ReadyState::Pending);
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Ids of calls currently awaiting a response, oldest first.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.shared.pending.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::LocalChannel;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            call_timeout_ms: 200,
            ready_timeout_ms: 300,
            event_capacity: 16,
        }
    }

    /// A bridge plus the raw worker end, driven by hand.
    fn raw_pair(
        config: BridgeConfig,
    ) -> (RpcBridge, Arc<LocalChannel>, mpsc::UnboundedReceiver<Message>) {
        let (ui, worker) = LocalChannel::pair();
        let bridge = RpcBridge::new(Arc::new(ui), config);
        let worker = Arc::new(worker);
        let (tx, rx) = mpsc::unbounded_channel();
        worker.on_message(Arc::new(move |m| {
            let _ = tx.send(m);
        }));
        (bridge, worker, rx)
    }

    fn ready_msg() -> Message {
        Message::ready(&ReadyInfo {
            port: 9000,
            token: "t0".to_string(),
        })
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Message>) -> (u64, String) {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Message::Request { id, function, .. } => (id, function),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_calls_before_ready_wait_for_handshake() {
        let (bridge, worker, mut rx) = raw_pair(BridgeConfig {
            ready_timeout_ms: 5_000,
            ..fast_config()
        });

        let caller = bridge.clone();
        let handle = tokio::spawn(async move { caller.call(WorkerRequest::Ping).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(bridge.pending_count(), 0);
        assert!(rx.try_recv().is_err());

        worker.send(ready_msg()).unwrap();
        let (id, function) = next_request(&mut rx).await;
        assert_eq!(function, "ping");
        worker
            .send(Message::ok(id, "ping", serde_json::json!("pong")))
            .unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!("pong"));
        assert_eq!(bridge.loopback().unwrap().port, 9000);
    }

    #[tokio::test]
    async fn test_ready_timeout_rejects_queued_call() {
        let (bridge, _worker, _rx) = raw_pair(fast_config());
        let err = bridge.call(WorkerRequest::Ping).await.unwrap_err();
        assert!(matches!(err, BridgeError::ReadyTimeout(_)));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_failed_ready_fails_queued_calls() {
        let (bridge, worker, _rx) = raw_pair(BridgeConfig {
            ready_timeout_ms: 5_000,
            ..fast_config()
        });
        let caller = bridge.clone();
        let handle = tokio::spawn(async move { caller.call(WorkerRequest::Ping).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        worker
            .send(Message::ready_failed(SerializedError::new(
                "KeyError",
                "master keys unavailable",
            )))
            .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        match err {
            BridgeError::WorkerFailed(e) => assert_eq!(e.name, "KeyError"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_error_is_propagated_verbatim() {
        let (bridge, worker, mut rx) = raw_pair(fast_config());
        worker.send(ready_msg()).unwrap();

        let caller = bridge.clone();
        let handle = tokio::spawn(async move { caller.call(WorkerRequest::Ping).await });
        let (id, _) = next_request(&mut rx).await;

        let mut error = SerializedError::new("RangeError", "chunk out of range");
        error.stack = Some("at readChunk".to_string());
        worker.send(Message::err(id, "ping", error.clone())).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.remote(), Some(&error));
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let (bridge, worker, mut rx) = raw_pair(fast_config());
        worker.send(ready_msg()).unwrap();

        let caller = bridge.clone();
        let handle = tokio::spawn(async move { caller.call(WorkerRequest::Ping).await });
        let (id, _) = next_request(&mut rx).await;

        worker.send(Message::ok(id, "ping", serde_json::json!(1))).unwrap();
        worker.send(Message::ok(id, "ping", serde_json::json!(2))).unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), serde_json::json!(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.pending_count(), 0);

        // Bridge still usable afterwards
        let caller = bridge.clone();
        let handle = tokio::spawn(async move { caller.call(WorkerRequest::Ping).await });
        let (id2, _) = next_request(&mut rx).await;
        assert_ne!(id, id2);
        worker.send(Message::ok(id2, "ping", serde_json::json!(3))).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_call_timeout_is_distinguishable_and_cleans_up() {
        let (bridge, worker, mut rx) = raw_pair(fast_config());
        worker.send(ready_msg()).unwrap();

        let err = bridge.call(WorkerRequest::Ping).await.unwrap_err();
        match &err {
            BridgeError::Timeout { function, .. } => assert_eq!(function, "ping"),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(err.is_timeout());
        assert_eq!(bridge.pending_count(), 0);

        // Late response for the timed-out call is dropped without effect
        let (id, _) = next_request(&mut rx).await;
        worker.send(Message::ok(id, "ping", serde_json::json!(null))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_does_not_leak_pending_entry() {
        let (bridge, worker, mut rx) = raw_pair(BridgeConfig {
            call_timeout_ms: 60_000,
            ..fast_config()
        });
        worker.send(ready_msg()).unwrap();

        let caller = bridge.clone();
        let handle = tokio::spawn(async move { caller.call(WorkerRequest::Ping).await });
        next_request(&mut rx).await;
        assert_eq!(bridge.pending_count(), 1);

        handle.abort();
        let _ = handle.await;
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_and_reset_reject_pending_calls() {
        let (bridge, worker, mut rx) = raw_pair(BridgeConfig {
            call_timeout_ms: 60_000,
            ..fast_config()
        });
        worker.send(ready_msg()).unwrap();

        let c1 = bridge.clone();
        let first = tokio::spawn(async move { c1.call(WorkerRequest::Ping).await });
        let (id1, _) = next_request(&mut rx).await;
        let c2 = bridge.clone();
        let second = tokio::spawn(async move { c2.call(WorkerRequest::Ping).await });
        next_request(&mut rx).await;

        assert!(bridge.cancel(id1));
        assert!(!bridge.cancel(id1));
        assert!(matches!(
            first.await.unwrap().unwrap_err(),
            BridgeError::Cancelled
        ));

        bridge.reset();
        assert!(matches!(second.await.unwrap().unwrap_err(), BridgeError::Reset));
        assert_eq!(bridge.pending_count(), 0);
        assert_eq!(bridge.ready_state(), ReadyState::Pending);
    }

    #[tokio::test]
    async fn test_ready_after_reset_rotates_loopback() {
        let (bridge, worker, _rx) = raw_pair(fast_config());
        let mut ready_rx = bridge.subscribe_ready();
        worker.send(ready_msg()).unwrap();
        ready_rx.changed().await.unwrap();
        assert_eq!(bridge.loopback().unwrap().token, "t0");

        bridge.reset();
        assert!(bridge.loopback().is_none());

        worker
            .send(Message::ready(&ReadyInfo {
                port: 9001,
                token: "t1".to_string(),
            }))
            .unwrap();
        let info = bridge.wait_ready().await.unwrap();
        assert_eq!(info.port, 9001);
        assert_eq!(info.token, "t1");
    }

    #[tokio::test]
    async fn test_events_and_progress_are_broadcast() {
        let (bridge, worker, _rx) = raw_pair(fast_config());
        let mut events = bridge.subscribe_events();

        worker
            .send(Message::Event {
                name: "cacheCleared".to_string(),
                data: serde_json::json!({"bytes": 3}),
            })
            .unwrap();
        worker
            .send(Message::OutOfBandProgress {
                transfer_id: "t".to_string(),
                bytes: 5,
                total: 10,
            })
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            WorkerEvent::Event {
                name: "cacheCleared".to_string(),
                data: serde_json::json!({"bytes": 3})
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            WorkerEvent::Progress {
                transfer_id: "t".to_string(),
                bytes: 5,
                total: 10
            }
        );
    }

    #[tokio::test]
    async fn test_unsolicited_request_is_rejected() {
        let (_bridge, worker, mut rx) = raw_pair(fast_config());
        worker
            .send(Message::Request {
                id: 77,
                function: "openCamera".to_string(),
                params: serde_json::Value::Null,
            })
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match reply {
            Message::Response {
                id, success, error, ..
            } => {
                assert_eq!(id, 77);
                assert!(!success);
                assert_eq!(error.unwrap().name, "UnsupportedRequest");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    /// UI endpoint whose outbound side can be switched off.
    struct SwitchableTransport {
        inner: LocalChannel,
        down: std::sync::atomic::AtomicBool,
    }

    impl ChannelTransport for SwitchableTransport {
        fn send(&self, message: Message) -> Result<(), TransportError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.inner.send(message)
        }

        fn on_message(&self, handler: MessageHandler) {
            self.inner.on_message(handler)
        }
    }

    #[tokio::test]
    async fn test_send_failure_rejects_call_and_bridge_recovers() {
        let (ui, worker) = LocalChannel::pair();
        let transport = Arc::new(SwitchableTransport {
            inner: ui,
            down: std::sync::atomic::AtomicBool::new(false),
        });
        let bridge = RpcBridge::new(transport.clone(), fast_config());
        let worker = Arc::new(worker);
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.on_message(Arc::new(move |m| {
            let _ = tx.send(m);
        }));
        worker.send(ready_msg()).unwrap();
        bridge.wait_ready().await.unwrap();

        transport.down.store(true, Ordering::SeqCst);
        let err = bridge.call(WorkerRequest::Ping).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(TransportError::Closed)));
        assert!(!err.is_timeout());
        assert_eq!(bridge.pending_count(), 0);
        assert!(rx.try_recv().is_err());

        transport.down.store(false, Ordering::SeqCst);
        let caller = bridge.clone();
        let handle = tokio::spawn(async move { caller.call(WorkerRequest::Ping).await });
        let (id, function) = next_request(&mut rx).await;
        worker
            .send(Message::ok(id, &function, serde_json::json!("pong")))
            .unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), serde_json::json!("pong"));
        assert_eq!(bridge.pending_count(), 0);
    }
}
