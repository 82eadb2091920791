//! # Message Box
//!
//! Bounded, thread-safe queue of pending payloads between caller threads
//! and engine loops. A full box is not an error: `try_enqueue` returning
//! `false` is the designed backpressure signal and the caller retries
//! with backoff.
//!
//! `dequeue_with_wait` polls `try_dequeue` at a fixed short interval so a
//! `close()` during shutdown is observed within one poll interval.

use crate::config::POLL_INTERVAL;
use crate::core::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::trace;

/// Bounded queue of marshallable values. Capacity is fixed at
/// construction from config; owned exclusively by one engine instance.
#[derive(Debug)]
pub struct MessageBox {
    inner: Mutex<VecDeque<Value>>,
    capacity: usize,
    closed: AtomicBool,
}

impl MessageBox {
    /// Create a box with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Non-blocking enqueue. Returns `false` when the box is full or
    /// closed -- the sole backpressure signal.
    pub fn try_enqueue(&self, value: Value) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut queue = match self.inner.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() >= self.capacity {
            trace!(capacity = self.capacity, "Message box full");
            return false;
        }
        queue.push_back(value);
        true
    }

    /// Non-blocking dequeue
    pub fn try_dequeue(&self) -> Option<Value> {
        let mut queue = match self.inner.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Poll `try_dequeue` until a value appears, the timeout elapses, or
    /// the box is closed. Returns `None` on timeout or closure.
    pub async fn dequeue_with_wait(&self, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_dequeue() {
                return Some(value);
            }
            if self.is_closed() || tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Mark the box closed so in-flight wait loops observe termination
    /// within one poll interval. Enqueues fail afterwards; already
    /// queued values remain dequeueable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of queued values
    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(q) => q.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard all queued values
    pub fn clear(&self) {
        let mut queue = match self.inner.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_until_full() {
        let mbox = MessageBox::new(2);
        assert!(mbox.try_enqueue(Value::U8(1)));
        assert!(mbox.try_enqueue(Value::U8(2)));
        assert!(!mbox.try_enqueue(Value::U8(3)));
        assert_eq!(mbox.len(), 2);
    }

    #[test]
    fn fifo_order() {
        let mbox = MessageBox::new(4);
        mbox.try_enqueue(Value::U8(1));
        mbox.try_enqueue(Value::U8(2));
        assert_eq!(mbox.try_dequeue(), Some(Value::U8(1)));
        assert_eq!(mbox.try_dequeue(), Some(Value::U8(2)));
        assert_eq!(mbox.try_dequeue(), None);
    }

    #[test]
    fn closed_box_rejects_enqueue_but_drains() {
        let mbox = MessageBox::new(4);
        mbox.try_enqueue(Value::U8(1));
        mbox.close();
        assert!(!mbox.try_enqueue(Value::U8(2)));
        assert_eq!(mbox.try_dequeue(), Some(Value::U8(1)));
    }

    #[tokio::test]
    async fn wait_loop_times_out() {
        let mbox = MessageBox::new(1);
        let start = std::time::Instant::now();
        let result = mbox.dequeue_with_wait(Duration::from_millis(40)).await;
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn wait_loop_observes_close() {
        let mbox = std::sync::Arc::new(MessageBox::new(1));
        let waiter = mbox.clone();
        let handle = tokio::spawn(async move {
            waiter.dequeue_with_wait(Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        mbox.close();
        let result = handle.await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn wait_loop_picks_up_value() {
        let mbox = std::sync::Arc::new(MessageBox::new(1));
        let producer = mbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.try_enqueue(Value::Str("late".into()));
        });
        let result = mbox.dequeue_with_wait(Duration::from_secs(1)).await;
        assert_eq!(result, Some(Value::Str("late".into())));
    }
}
