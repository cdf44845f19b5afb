//! Transfer controls
//!
//! Per-transfer cancel/pause signals and the table that routes UI commands to them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Transfer control signals
#[derive(Debug)]
pub struct TransferControl {
    /// Cancellation signal via watch channel
    cancel_tx: watch::Sender<bool>,
    /// Pause signal via watch channel (independent from cancellation)
    pause_tx: watch::Sender<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (pause_tx, _) = watch::channel(false);
        Self {
            cancel_tx,
            pause_tx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    /// Resolves once the transfer is cancelled (immediately if it already is).
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        // Sender lives in self, so wait_for only fails if self is gone
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Block while paused. Returns false if cancelled meanwhile.
    pub async fn wait_while_paused(&self) -> bool {
        if !self.is_paused() {
            return !self.is_cancelled();
        }
        debug!("Transfer paused, waiting for resume");
        let mut pause_rx = self.pause_tx.subscribe();
        tokio::select! {
            _ = pause_rx.wait_for(|paused| !*paused) => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Active transfer controls, keyed by transfer id.
#[derive(Default)]
pub struct TransferControls {
    controls: DashMap<String, Arc<TransferControl>>,
}

impl TransferControls {
    pub fn new() -> Self {
        Self {
            controls: DashMap::new(),
        }
    }

    /// Register a new transfer and get its control handle
    pub fn register(&self, transfer_id: &str) -> Arc<TransferControl> {
        let control = Arc::new(TransferControl::new());
        self.controls
            .insert(transfer_id.to_string(), control.clone());
        debug!("Registered transfer control: {}", transfer_id);
        control
    }

    pub fn get(&self, transfer_id: &str) -> Option<Arc<TransferControl>> {
        self.controls.get(transfer_id).map(|c| c.value().clone())
    }

    pub fn unregister(&self, transfer_id: &str) {
        self.controls.remove(transfer_id);
        debug!("Unregistered transfer control: {}", transfer_id);
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    pub fn cancel(&self, transfer_id: &str) -> bool {
        self.with_control(transfer_id, "cancel", |c| c.cancel())
    }

    pub fn pause(&self, transfer_id: &str) -> bool {
        self.with_control(transfer_id, "pause", |c| c.pause())
    }

    pub fn resume(&self, transfer_id: &str) -> bool {
        self.with_control(transfer_id, "resume", |c| c.resume())
    }

    pub fn cancel_all(&self) {
        for entry in self.controls.iter() {
            entry.value().cancel();
            info!("Cancelled transfer: {}", entry.key());
        }
    }

    fn with_control(&self, transfer_id: &str, action: &str, f: impl FnOnce(&TransferControl)) -> bool {
        match self.controls.get(transfer_id) {
            Some(control) => {
                f(control.value());
                info!("Transfer {}: {}", action, transfer_id);
                true
            }
            None => {
                warn!("Transfer not found for {}: {}", action, transfer_id);
                false
            }
        }
    }
}

/// Unregisters a transfer's control on drop, so no early return leaks an entry.
pub struct ControlGuard {
    controls: Arc<TransferControls>,
    transfer_id: String,
}

impl ControlGuard {
    pub fn new(controls: Arc<TransferControls>, transfer_id: String) -> Self {
        Self {
            controls,
            transfer_id,
        }
    }
}

impl Drop for ControlGuard {
    fn drop(&mut self) {
        self.controls.unregister(&self.transfer_id);
    }
}
