//! The bridging queue between synchronous callers and worker threads.
//!
//! A [`BridgeQueue`] is an unbounded FIFO that can be pushed to and popped from
//! any thread. The synchronous side blocks with [`BridgeQueue::pop`]; the
//! asynchronous side awaits [`BridgeQueue::notified`] and drains with
//! [`BridgeQueue::try_pop`].
//!
//! # Design
//! Items travel over a [`crossbeam`] channel, which provides the blocking and
//! timed receives the caller side needs. Every push also stores a permit in a
//! [`Notify`], so a worker that starts waiting after a push still wakes up.
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tokio::sync::Notify;

pub struct BridgeQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    notify: Notify,
}

impl<T> Default for BridgeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BridgeQueue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender,
            receiver,
            notify: Notify::new(),
        }
    }

    /// Append an item. Never blocks.
    pub fn push(&self, item: T) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.sender.send(item);
        self.notify.notify_one();
    }

    /// Dequeue one item.
    ///
    /// - `block = false`: return immediately.
    /// - `block = true`, `timeout = None`: wait until an item arrives.
    /// - `block = true`, `timeout = Some(t)`: wait at most `t`.
    pub fn pop(&self, block: bool, timeout: Option<Duration>) -> Option<T> {
        match (block, timeout) {
            (false, _) => self.try_pop(),
            (true, None) => self.receiver.recv().ok(),
            (true, Some(timeout)) => match self.receiver.recv_timeout(timeout) {
                Ok(item) => Some(item),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Discard everything currently queued, returning how many items were
    /// dropped.
    pub fn clear(&self) -> usize {
        self.receiver.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Resolves once an item has been pushed since the last wake-up.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn preserves_fifo_order() {
        let queue = BridgeQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn non_blocking_pop_on_empty_returns_none() {
        let queue: BridgeQueue<u8> = BridgeQueue::new();
        let start = Instant::now();
        assert_eq!(queue.pop(false, None), None);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn timed_pop_gives_up_after_the_timeout() {
        let queue: BridgeQueue<u8> = BridgeQueue::new();
        let start = Instant::now();
        assert_eq!(queue.pop(true, Some(Duration::from_millis(30))), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn blocking_pop_wakes_on_push_from_another_thread() {
        let queue = Arc::new(BridgeQueue::new());
        let pusher = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push("hello");
            })
        };
        assert_eq!(queue.pop(true, None), Some("hello"));
        pusher.join().unwrap();
    }

    #[test]
    fn clear_discards_pending_items() {
        let queue = BridgeQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn push_before_wait_still_notifies() {
        let queue = BridgeQueue::new();
        queue.push(1);
        tokio::time::timeout(Duration::from_secs(1), queue.notified())
            .await
            .unwrap();
        assert_eq!(queue.len(), 1);
    }
}
