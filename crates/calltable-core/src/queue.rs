//! Hand-off queues between the registry and asynchronous consumers
//!
//! Each queue has its own lock, taken only for a push or a pop and never
//! while an index lock is held. Consumers can poll (`pop`, `drain`) from a
//! blocking worker or await (`recv`) from an async task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
pub struct HandoffQueue<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    pushed: AtomicU64,
}

impl<T> HandoffQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            pushed: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Take everything queued so far
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Total items ever pushed
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Wait for the next item
    pub async fn recv(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.pop() {
                return item;
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

    #[test]
    fn test_fifo_and_drain() {
        let queue = HandoffQueue::new("test");
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.drain(), vec![2, 3]);
        assert!(queue.is_empty());
        assert_eq!(queue.pushed(), 3);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = Arc::new(HandoffQueue::new("test"));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("job");
        let got = tokio::time::timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(got, "job");
    }
}
