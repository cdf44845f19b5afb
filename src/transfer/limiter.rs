//! Concurrency Limiter
//!
//! Bounded-concurrency primitive for file streams. Backed by
//! `tokio::sync::Semaphore`, which queues waiters FIFO and hands a released
//! permit straight to the next waiter (no polling).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::control::TransferControl;
use super::error::TransferError;

#[derive(Debug, Default)]
struct LimiterStats {
    in_use: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// FIFO semaphore with acquire/release accounting.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    stats: Arc<LimiterStats>,
}

/// Admission ticket. Released exactly once: explicitly via [`LimiterPermit::release`]
/// or implicitly on drop, so every exit path of the holder gives it back.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<LimiterStats>,
}

impl LimiterPermit {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        let result = self
            .stats
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if result.is_err() {
            warn!("LimiterPermit dropped with in_use already 0");
        }
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    /// `max_concurrent` is clamped to at least 1.
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            stats: Arc::new(LimiterStats::default()),
        }
    }

    /// Wait for a permit. Waiting at the cap is normal backpressure.
    pub async fn acquire(&self) -> Result<LimiterPermit, TransferError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Backend("Concurrency limiter closed".to_string()))?;
        Ok(self.admit(permit))
    }

    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.admit(permit))
    }

    /// Wait for a permit unless the transfer is cancelled first.
    /// A cancelled waiter leaves the queue without taking a permit.
    pub async fn acquire_or_cancel(
        &self,
        control: &TransferControl,
    ) -> Result<LimiterPermit, TransferError> {
        if control.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = control.cancelled() => Err(TransferError::Cancelled),
            permit = self.acquire() => permit,
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> LimiterPermit {
        let now = self.stats.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(now, Ordering::SeqCst);
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        debug!("Acquired limiter permit, in use: {}/{}", now, self.capacity);
        LimiterPermit {
            _permit: permit,
            stats: self.stats.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.stats.in_use.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously held permits so far.
    pub fn peak(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    pub fn acquired_total(&self) -> u64 {
        self.stats.acquired.load(Ordering::SeqCst)
    }

    pub fn released_total(&self) -> u64 {
        self.stats.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let limiter = ConcurrencyLimiter::new(3);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire().await.unwrap();
                assert!(limiter.in_use() <= 3);
                tokio::time::sleep(Duration::from_millis(2)).await;
                permit.release();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(limiter.peak() <= 3);
        assert_eq!(limiter.in_use(), 0);
        assert_eq!(limiter.acquired_total(), 20);
        assert_eq!(limiter.released_total(), 20);
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test]
    async fn test_waiters_admitted_in_fifo_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire().await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for i in 0..5 {
            let limiter = limiter.clone();
            let order_tx = order_tx.clone();
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire().await.unwrap();
                order_tx.send(i).unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
                drop(permit);
            }));
            // Let this waiter enqueue before the next one is spawned
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        drop(order_tx);

        let mut order = Vec::new();
        while let Some(i) = order_rx.recv().await {
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_release_admits_exactly_one_waiter() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert!(limiter.try_acquire().is_none());

        let waiter1 = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await.unwrap() }
        });
        let waiter2 = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        a.release();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            [waiter1.is_finished(), waiter2.is_finished()]
                .iter()
                .filter(|f| **f)
                .count(),
            1
        );
        assert_eq!(limiter.in_use(), 2);
        waiter1.abort();
        waiter2.abort();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let limiter = ConcurrencyLimiter::new(1);
        let _held = limiter.acquire().await.unwrap();
        let control = Arc::new(TransferControl::new());

        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            let control = control.clone();
            async move { limiter.acquire_or_cancel(&control).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        control.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(limiter.acquired_total(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        assert!(limiter.try_acquire().is_some());
    }
}
