//! Transfer Registry
//!
//! Process-wide table of active and finished transfers, the single source of
//! truth for progress rendering.
//!
//! # Architecture
//!
//! One owner task holds the lists. Every mutation is a transform sent to it over
//! an mpsc channel and applied serially, so two transfers finishing in the same
//! tick can never lose each other's update. After each transform the owner
//! publishes an immutable snapshot on a `watch` channel for readers.
//!
//! ```ignore
//! let registry = TransferRegistry::spawn();
//! registry.enqueue(record).await;
//! registry.set_transfers(ListUpdate::with(|mut list| { list.retain(|r| r.name != "x"); list })).await;
//! let snapshot = registry.snapshot();
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::types::{TransferRecord, TransferState};

/// What the UI observes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub active: Vec<TransferRecord>,
    pub finished: Vec<TransferRecord>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &str) -> Option<&TransferRecord> {
        self.active
            .iter()
            .chain(self.finished.iter())
            .find(|r| r.id == id)
    }
}

/// Full replacement or a function of the previous list.
pub enum ListUpdate {
    Replace(Vec<TransferRecord>),
    With(Box<dyn FnOnce(Vec<TransferRecord>) -> Vec<TransferRecord> + Send>),
}

impl ListUpdate {
    pub fn with<F>(f: F) -> Self
    where
        F: FnOnce(Vec<TransferRecord>) -> Vec<TransferRecord> + Send + 'static,
    {
        ListUpdate::With(Box::new(f))
    }

    fn apply(self, previous: Vec<TransferRecord>) -> Vec<TransferRecord> {
        match self {
            ListUpdate::Replace(list) => list,
            ListUpdate::With(f) => f(previous),
        }
    }
}

type Transform = Box<dyn FnOnce(&mut RegistrySnapshot) + Send>;

struct RegistryCommand {
    transform: Transform,
    reply_tx: Option<oneshot::Sender<()>>,
}

/// Restore the invariants after an arbitrary transform.
fn normalize(state: &mut RegistrySnapshot) {
    let finished_ids: std::collections::HashSet<&str> =
        state.finished.iter().map(|r| r.id.as_str()).collect();
    let before = state.active.len();
    state.active.retain(|r| !finished_ids.contains(r.id.as_str()));
    if state.active.len() != before {
        warn!(
            "Dropped {} active records that were also finished",
            before - state.active.len()
        );
    }
}

fn find_active<'a>(state: &'a mut RegistrySnapshot, id: &str) -> Option<&'a mut TransferRecord> {
    state.active.iter_mut().find(|r| r.id == id)
}

/// Handle to the registry owner task. Cheap to clone.
#[derive(Clone)]
pub struct TransferRegistry {
    cmd_tx: mpsc::UnboundedSender<RegistryCommand>,
    snapshot_rx: watch::Receiver<Arc<RegistrySnapshot>>,
}

impl TransferRegistry {
    /// Spawn the owner task. It exits once every handle is dropped.
    pub fn spawn() -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<RegistryCommand>();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(RegistrySnapshot::default()));

        tokio::spawn(async move {
            let mut state = RegistrySnapshot::default();
            while let Some(RegistryCommand {
                transform,
                reply_tx,
            }) = cmd_rx.recv().await
            {
                transform(&mut state);
                normalize(&mut state);
                snapshot_tx.send_replace(Arc::new(state.clone()));
                if let Some(tx) = reply_tx {
                    let _ = tx.send(());
                }
            }
            debug!("Transfer registry owner exiting");
        });

        Self {
            cmd_tx,
            snapshot_rx,
        }
    }

    /// Submit a transform and wait until the owner has applied it.
    pub async fn apply<F>(&self, transform: F)
    where
        F: FnOnce(&mut RegistrySnapshot) + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = RegistryCommand {
            transform: Box::new(transform),
            reply_tx: Some(reply_tx),
        };
        if self.cmd_tx.send(command).is_err() {
            warn!("Transfer registry owner is gone");
            return;
        }
        let _ = reply_rx.await;
    }

    /// Submit a transform without waiting.
    pub fn submit<F>(&self, transform: F)
    where
        F: FnOnce(&mut RegistrySnapshot) + Send + 'static,
    {
        let command = RegistryCommand {
            transform: Box::new(transform),
            reply_tx: None,
        };
        if self.cmd_tx.send(command).is_err() {
            warn!("Transfer registry owner is gone");
        }
    }

    pub async fn set_transfers(&self, update: ListUpdate) {
        self.apply(move |state| {
            let previous = std::mem::take(&mut state.active);
            state.active = update.apply(previous);
        })
        .await
    }

    pub async fn set_finished_transfers(&self, update: ListUpdate) {
        self.apply(move |state| {
            let previous = std::mem::take(&mut state.finished);
            state.finished = update.apply(previous);
        })
        .await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Engine helpers
    // ═══════════════════════════════════════════════════════════════════

    pub async fn enqueue(&self, record: TransferRecord) {
        self.apply(move |state| {
            state.active.retain(|r| r.id != record.id);
            state.active.push(record);
        })
        .await
    }

    pub async fn mark_started(&self, id: &str) {
        self.transition(id, TransferState::Started).await
    }

    pub async fn mark_paused(&self, id: &str) {
        self.transition(id, TransferState::Paused).await
    }

    pub async fn mark_resumed(&self, id: &str) {
        self.transition(id, TransferState::Started).await
    }

    async fn transition(&self, id: &str, next: TransferState) {
        let id = id.to_string();
        self.apply(move |state| {
            if let Some(record) = find_active(state, &id) {
                if !record.transition(next) {
                    debug!(
                        "Ignoring transition {:?} -> {:?} for {}",
                        record.state, next, id
                    );
                }
            }
        })
        .await
    }

    /// Progress never moves backwards; stale reports are ignored.
    pub async fn report_progress(&self, id: &str, bytes: u64) {
        let id = id.to_string();
        self.apply(move |state| {
            if let Some(record) = find_active(state, &id) {
                record.record_progress(bytes);
            }
        })
        .await
    }

    /// Move a record to the finished list in one step, with its terminal state.
    pub async fn finish(&self, id: &str, terminal: TransferState, error: Option<String>) {
        debug_assert!(terminal.is_terminal());
        let id = id.to_string();
        self.apply(move |state| {
            let Some(pos) = state.active.iter().position(|r| r.id == id) else {
                debug!("finish: {} not active", id);
                return;
            };
            let mut record = state.active.remove(pos);
            // Queued/paused records may only stop or fail directly
            if !record.transition(terminal) && !record.state.is_terminal() {
                record.state = terminal;
            }
            if error.is_some() {
                record.error = error;
            }
            state.finished.push(record);
        })
        .await
    }

    pub async fn remove(&self, id: &str) {
        let id = id.to_string();
        self.apply(move |state| {
            state.active.retain(|r| r.id != id);
            state.finished.retain(|r| r.id != id);
        })
        .await
    }

    pub async fn clear_finished(&self) {
        self.set_finished_transfers(ListUpdate::Replace(Vec::new()))
            .await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Readers
    // ═══════════════════════════════════════════════════════════════════

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<TransferRecord> {
        self.snapshot_rx.borrow().get(id).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.snapshot_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::{ItemType, TransferKind};

    fn record(id: &str, size: u64) -> TransferRecord {
        TransferRecord::new(
            id.to_string(),
            TransferKind::Download,
            ItemType::File,
            format!("uuid-{}", id),
            format!("{}.bin", id),
            size,
        )
    }

    #[tokio::test]
    async fn test_lifecycle_moves_record_atomically() {
        let registry = TransferRegistry::spawn();
        let mut rx = registry.subscribe();

        registry.enqueue(record("a", 10)).await;
        registry.mark_started("a").await;
        registry.report_progress("a", 10).await;
        registry.finish("a", TransferState::Finished, None).await;

        let snap = registry.snapshot();
        assert!(snap.active.is_empty());
        assert_eq!(snap.finished.len(), 1);
        assert_eq!(snap.finished[0].state, TransferState::Finished);

        // Every published snapshot has the id in exactly one list
        let seen = rx.borrow_and_update().clone();
        let count = seen.active.iter().filter(|r| r.id == "a").count()
            + seen.finished.iter().filter(|r| r.id == "a").count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_functional_updates_are_not_lost() {
        let registry = TransferRegistry::spawn();
        let mut handles = Vec::new();
        for i in 0..50 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .set_transfers(ListUpdate::with(move |mut list| {
                        list.push(record(&format!("t{}", i), 1));
                        list
                    }))
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(registry.snapshot().active.len(), 50);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_terminal_is_frozen() {
        let registry = TransferRegistry::spawn();
        registry.enqueue(record("a", 100)).await;
        registry.mark_started("a").await;
        registry.report_progress("a", 60).await;
        registry.report_progress("a", 30).await;
        assert_eq!(registry.get("a").unwrap().bytes_transferred, 60);

        registry
            .finish("a", TransferState::Error, Some("boom".to_string()))
            .await;
        registry.mark_started("a").await;
        registry.report_progress("a", 90).await;

        let r = registry.get("a").unwrap();
        assert_eq!(r.state, TransferState::Error);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert_eq!(r.bytes_transferred, 60);
        assert!(r.error_at.is_some());
    }

    #[tokio::test]
    async fn test_replace_cannot_duplicate_finished_id() {
        let registry = TransferRegistry::spawn();
        registry.enqueue(record("a", 1)).await;
        registry.mark_started("a").await;
        registry.finish("a", TransferState::Stopped, None).await;

        registry
            .set_transfers(ListUpdate::Replace(vec![record("a", 1), record("b", 1)]))
            .await;

        let snap = registry.snapshot();
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.active[0].id, "b");
        assert_eq!(snap.finished[0].id, "a");
    }

    #[tokio::test]
    async fn test_finish_from_queued_stops() {
        let registry = TransferRegistry::spawn();
        registry.enqueue(record("q", 5)).await;
        registry.finish("q", TransferState::Stopped, None).await;
        assert_eq!(registry.get("q").unwrap().state, TransferState::Stopped);
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let registry = TransferRegistry::spawn();
        registry.enqueue(record("a", 1)).await;
        registry.enqueue(record("b", 1)).await;
        registry.mark_started("a").await;
        registry.finish("a", TransferState::Finished, None).await;

        registry.clear_finished().await;
        registry.remove("b").await;
        assert_eq!(*registry.snapshot(), RegistrySnapshot::default());
    }

    #[tokio::test]
    async fn test_submit_is_applied_in_order() {
        let registry = TransferRegistry::spawn();
        registry.submit(|state| state.active.push(record("x", 1)));
        registry.submit(|state| state.active.retain(|r| r.id != "x"));
        registry.enqueue(record("y", 1)).await;
        let snap = registry.snapshot();
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.active[0].id, "y");
    }
}
