//! Backpressure accounting between the PTY pump and the socket writer.
//!
//! The pump [`acquire`](FlowControl::acquire)s bytes when it queues an
//! `output` message and the writer [`release`](FlowControl::release)s them
//! once the frame is on the wire. When the outstanding total reaches the
//! high-water mark the pump stops reading from the PTY until the writer has
//! drained it down to the low-water mark. Outstanding bytes therefore never
//! exceed `high_water` plus one message.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

#[derive(Debug)]
pub struct FlowControl {
    outstanding: AtomicUsize,
    peak: AtomicUsize,
    high_water: usize,
    low_water: usize,
    drained: Notify,
}

impl FlowControl {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            high_water,
            low_water: low_water.min(high_water),
            drained: Notify::new(),
        }
    }

    pub fn acquire(&self, bytes: usize) {
        let now = self.outstanding.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    pub fn release(&self, bytes: usize) {
        let prev = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            })
            .unwrap_or(0);
        if prev.saturating_sub(bytes) <= self.low_water {
            self.drained.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Highest outstanding total seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.outstanding() >= self.high_water
    }

    /// Return immediately while below the high-water mark; otherwise wait
    /// until the writer has drained to the low-water mark.
    pub async fn wait_for_capacity(&self) {
        if !self.is_paused() {
            return;
        }
        tracing::trace!(outstanding = self.outstanding(), "output paused");
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() <= self.low_water {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn below_high_water_does_not_wait() {
        let flow = FlowControl::new(100, 10);
        flow.acquire(99);
        tokio::time::timeout(Duration::from_millis(50), flow.wait_for_capacity())
            .await
            .expect("should not block below high water");
    }

    #[tokio::test]
    async fn pauses_until_low_water() {
        let flow = Arc::new(FlowControl::new(100, 10));
        flow.acquire(120);
        assert!(flow.is_paused());

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.wait_for_capacity().await })
        };
        // Let the waiter park while still above the high-water mark.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Draining to between the marks keeps the pump paused.
        flow.release(60);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        flow.release(55);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resumes after draining")
            .unwrap();
        assert_eq!(flow.outstanding(), 5);
        assert_eq!(flow.peak(), 120);
    }

    #[test]
    fn release_saturates_at_zero() {
        let flow = FlowControl::new(100, 10);
        flow.acquire(5);
        flow.release(50);
        assert_eq!(flow.outstanding(), 0);
    }
}
