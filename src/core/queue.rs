//! Bounded, backpressure-aware work queue feeding the Remediator pool

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::info;

/// Intake result: producers slow down on `Backpressure`, stop on `Rejected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    Backpressure,
    Rejected,
}

/// FIFO of pending work items, bounded at construction.
pub struct RemediatorQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    shutdown: AtomicBool,
    notify: Notify,
}

impl<T> RemediatorQueue<T> {
    pub fn new(capacity: usize) -> Self {
        RemediatorQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, item: T) -> EnqueueOutcome {
        if self.shutdown.load(Ordering::Acquire) {
            return EnqueueOutcome::Rejected;
        }
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return EnqueueOutcome::Backpressure;
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        EnqueueOutcome::Accepted
    }

    /// Waits for the next item; `None` once shut down and drained.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            {
                let mut items = self.items.lock();
                if let Some(item) = items.pop_front() {
                    return Some(item);
                }
                if self.shutdown.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
        info!("[Queue] shutdown signalled");
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_until_full_then_backpressure() {
        let queue = RemediatorQueue::new(2);
        assert_eq!(queue.enqueue(1), EnqueueOutcome::Accepted);
        assert_eq!(queue.enqueue(2), EnqueueOutcome::Accepted);
        assert_eq!(queue.enqueue(3), EnqueueOutcome::Backpressure);
        assert_eq!(queue.dequeue().await, Some(1));
        assert_eq!(queue.enqueue(3), EnqueueOutcome::Accepted);
    }

    #[tokio::test]
    async fn rejected_after_shutdown_and_drains() {
        let queue = RemediatorQueue::new(4);
        queue.enqueue("a");
        queue.shutdown();
        assert_eq!(queue.enqueue("b"), EnqueueOutcome::Rejected);
        assert_eq!(queue.dequeue().await, Some("a"));
        assert_eq!(queue.dequeue().await, None);
    }
}
