//! Transaction timers.
//!
//! One pending timer per [`TransactionKey`], backed by a [`DelayQueue`]. Arming a key
//! that is already pending resets its deadline, so a stale expiry can never reach a
//! transaction that has moved on.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio_util::time::{delay_queue, DelayQueue};

use crate::app::TransactionKey;

#[derive(Debug)]
pub struct TransactionTimers {
    queue: DelayQueue<TransactionKey>,
    pending: HashMap<TransactionKey, delay_queue::Key>,
}

impl TransactionTimers {
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            pending: HashMap::new(),
        }
    }

    /// Fire `key` after `after`, replacing any pending deadline
    pub fn arm(&mut self, key: TransactionKey, after: Duration) {
        match self.pending.get(&key) {
            Some(queue_key) => self.queue.reset(queue_key, after),
            None => {
                let queue_key = self.queue.insert(key.clone(), after);
                self.pending.insert(key, queue_key);
            }
        }
    }

    /// Returns false when nothing was pending for `key`
    pub fn cancel(&mut self, key: &TransactionKey) -> bool {
        match self.pending.remove(key) {
            Some(queue_key) => {
                self.queue.remove(&queue_key);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: &TransactionKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// `Ready(None)` when no timer is pending
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<TransactionKey>> {
        match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let key = expired.into_inner();
                self.pending.remove(&key);
                Poll::Ready(Some(key))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Default for TransactionTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for TransactionTimers {
    type Item = TransactionKey;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_expired(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkAddress;
    use futures::StreamExt;

    fn key(invoke_id: u8) -> TransactionKey {
        TransactionKey::client(NetworkAddress::local(vec![10, 0, 0, 1, 0xBA, 0xC0]), invoke_id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_order() {
        let mut timers = TransactionTimers::new();
        timers.arm(key(1), Duration::from_millis(300));
        timers.arm(key(2), Duration::from_millis(100));

        assert_eq!(timers.next().await, Some(key(2)));
        assert!(!timers.is_armed(&key(2)));
        assert_eq!(timers.next().await, Some(key(1)));
        assert!(timers.is_empty());
        assert_eq!(timers.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_deadline() {
        let mut timers = TransactionTimers::new();
        let start = tokio::time::Instant::now();
        timers.arm(key(1), Duration::from_millis(100));
        timers.arm(key(1), Duration::from_millis(500));
        assert_eq!(timers.len(), 1);

        assert_eq!(timers.next().await, Some(key(1)));
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let mut timers = TransactionTimers::new();
        timers.arm(key(1), Duration::from_millis(100));
        timers.arm(key(2), Duration::from_millis(200));

        assert!(timers.cancel(&key(1)));
        assert!(!timers.cancel(&key(1)));
        assert_eq!(timers.next().await, Some(key(2)));
        assert_eq!(timers.next().await, None);
    }
}
