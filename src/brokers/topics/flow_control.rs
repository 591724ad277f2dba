//! Backlog-based flow control shared by publishers and subscribers.
//!
//! Admission is allowed while the backlog is at or below the threshold.
//! Once it goes over, blocking callers park until `release` brings it back.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

pub struct FlowControl {
    threshold: u64,
    backlog: AtomicU64,
    notify: Notify,
}

impl FlowControl {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            backlog: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn backlog(&self) -> u64 {
        self.backlog.load(Ordering::Acquire)
    }

    pub fn is_excessive(&self) -> bool {
        self.backlog() > self.threshold
    }

    fn try_acquire(&self, units: u64) -> bool {
        let mut current = self.backlog.load(Ordering::Acquire);
        loop {
            if current > self.threshold {
                return false;
            }
            match self.backlog.compare_exchange_weak(
                current,
                current + units,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Waits until the backlog is back at or below the threshold, then adds `units`.
    pub async fn acquire(&self, units: u64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire(units) {
                return;
            }
            notified.await;
        }
    }

    /// Adds `units` regardless of the current backlog.
    pub fn acquire_unchecked(&self, units: u64) {
        self.backlog.fetch_add(units, Ordering::AcqRel);
    }

    pub fn release(&self, units: u64) {
        let previous = self
            .backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(units)))
            .unwrap_or(0);
        let now = previous.saturating_sub(units);
        if previous > self.threshold && now <= self.threshold {
            self.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_admits_until_over_threshold() {
        let flow = FlowControl::new(2);
        flow.acquire(1).await;
        flow.acquire(1).await;
        flow.acquire(1).await; // backlog 2 <= 2: still admitted
        assert_eq!(flow.backlog(), 3);
        assert!(flow.is_excessive());

        let blocked = tokio::time::timeout(Duration::from_millis(50), flow.acquire(1)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_release_wakes_blocked_acquire() {
        let flow = Arc::new(FlowControl::new(1));
        flow.acquire_unchecked(5);

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        flow.release(4);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(flow.backlog(), 2);
    }

    #[test]
    fn test_release_saturates() {
        let flow = FlowControl::new(10);
        flow.acquire_unchecked(3);
        flow.release(10);
        assert_eq!(flow.backlog(), 0);
    }
}
