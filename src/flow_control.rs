//! Acknowledgment credits for streamed printing.
//!
//! At most `depth` lines may be unacknowledged at once. The writer takes a
//! credit before each line; the reader hands one back per acknowledgment.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{AcquireError, Semaphore};

#[derive(Debug)]
pub struct CreditGate {
    depth: usize,
    permits: Semaphore,
    outstanding: AtomicUsize,
    active: AtomicBool,
}

impl CreditGate {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            permits: Semaphore::new(depth),
            outstanding: AtomicUsize::new(0),
            active: AtomicBool::new(false),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start counting acknowledgments for a new streamed print.
    pub fn activate(&self) {
        self.reset();
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.reset();
    }

    /// Wait for a credit and consume it.
    pub async fn acquire(&self) -> Result<(), AcquireError> {
        let permit = self.permits.acquire().await?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        permit.forget();
        Ok(())
    }

    /// Return one credit for an acknowledgment. Returns `false` (and changes
    /// nothing) when the gate is idle or no line is outstanding, so the pool
    /// can never grow past `depth`.
    pub fn release(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let released = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if released {
            self.permits.add_permits(1);
        }
        released
    }

    /// Hand back a credit taken for a line that was never written.
    pub fn refund(&self) {
        let refunded = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refunded {
            self.permits.add_permits(1);
        }
    }

    /// Wait until every outstanding line has been acknowledged, giving up
    /// after `bound`. Returns whether the drain completed.
    pub async fn drain(&self, bound: Duration) -> bool {
        let all = self.depth as u32;
        match tokio::time::timeout(bound, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                drop(permits);
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(
                    "Gave up waiting for {} unacknowledged lines after {:?}",
                    self.outstanding(),
                    bound
                );
                false
            }
        }
    }

    /// Restore the full pool, forgetting any unacknowledged lines.
    fn reset(&self) {
        let missing = self.outstanding.swap(0, Ordering::SeqCst);
        if missing > 0 {
            self.permits.add_permits(missing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_never_more_than_depth_outstanding() {
        let gate = Arc::new(CreditGate::new(4));
        gate.activate();
        for _ in 0..4 {
            gate.acquire().await.unwrap();
        }
        assert_eq!(gate.outstanding(), 4);
        let blocked = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(blocked.is_err());
        assert!(gate.outstanding() <= gate.depth());
    }

    #[tokio::test]
    async fn test_release_unblocks_waiting_writer() {
        let gate = Arc::new(CreditGate::new(2));
        gate.activate();
        gate.acquire().await.unwrap();
        gate.acquire().await.unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert!(gate.release());
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_release_is_bounded() {
        let gate = CreditGate::new(3);
        assert!(!gate.release(), "idle gate ignores acks");
        gate.activate();
        assert!(!gate.release(), "nothing outstanding");
        assert_eq!(gate.available(), 3);
        gate.acquire().await.unwrap();
        assert!(gate.release());
        assert!(!gate.release());
        assert_eq!(gate.available(), 3);
    }

    #[tokio::test]
    async fn test_drain_waits_for_acknowledgments() {
        let gate = Arc::new(CreditGate::new(4));
        gate.activate();
        gate.acquire().await.unwrap();
        gate.acquire().await.unwrap();
        let drainer = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.drain(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        gate.release();
        gate.release();
        assert!(drainer.await.unwrap());
        assert_eq!(gate.available(), 4);
    }

    #[tokio::test]
    async fn test_refunded_credit_does_not_hold_up_drain() {
        let gate = CreditGate::new(2);
        gate.activate();
        gate.acquire().await.unwrap();
        gate.acquire().await.unwrap();
        assert!(gate.release());
        gate.refund();
        assert_eq!(gate.outstanding(), 0);
        assert_eq!(gate.available(), 2);
        let drained = tokio::time::timeout(Duration::from_millis(100), gate.drain(Duration::from_secs(5))).await;
        assert!(matches!(drained, Ok(true)));
        gate.refund();
        assert_eq!(gate.available(), 2, "nothing outstanding, nothing refunded");
    }

    #[tokio::test]
    async fn test_drain_timeout_then_reset_restores_pool() {
        let gate = CreditGate::new(2);
        gate.activate();
        gate.acquire().await.unwrap();
        assert!(!gate.drain(Duration::from_millis(10)).await);
        gate.deactivate();
        assert_eq!(gate.available(), 2);
        assert_eq!(gate.outstanding(), 0);
    }
}
