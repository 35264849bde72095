//! Bounded Result Channels
//!
//! Single responsibility: hand asynchronous results from the session's
//! dispatch loop to the application, without ever growing past a fixed size.
//!
//! # Overflow Policies
//!
//! | Policy         | When full                                  | Used for                  |
//! |----------------|--------------------------------------------|---------------------------|
//! | `RejectNewest` | the incoming item is discarded             | query replies, samples    |
//! | `EvictOldest`  | the oldest queued item is discarded first  | latest-value-wins streams |
//!
//! A capacity of zero is legal: every send is accepted and immediately
//! discarded, so the channel only ever reports liveness.
//!
//! # Terminal State
//!
//! Closing a channel keeps already-queued items receivable in order. Once the
//! queue is drained every receive returns [`Received::Disconnected`], forever.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::trace;

use crate::error::SessionError;

/// What happens to a send when the channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Keep what is queued, silently discard the new item.
    RejectNewest,
    /// Discard the single oldest queued item, then enqueue the new one.
    EvictOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed,
}

/// Outcome of a receive-style operation.
///
/// Failures are values, not errors, so polling loops stay branch-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received<T> {
    /// A result produced for this operation.
    Value(T),
    /// The broker sent something for this operation that could not be decoded.
    Malformed(String),
    /// Nothing queued yet (only returned by `try_receive`).
    NotYetAvailable,
    /// The channel is closed and drained.
    Disconnected,
}

impl<T> Received<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Received::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Received::Disconnected)
    }
}

enum Slot<T> {
    Value(T),
    Malformed(String),
}

impl<T> From<Slot<T>> for Received<T> {
    fn from(slot: Slot<T>) -> Self {
        match slot {
            Slot::Value(v) => Received::Value(v),
            Slot::Malformed(reason) => Received::Malformed(reason),
        }
    }
}

struct Queue<T> {
    items: VecDeque<Slot<T>>,
    closed: bool,
    dropped: u64,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

/// A fixed-capacity queue shared by a producer (the session) and a consumer
/// (the application).
///
/// Cloning yields another handle to the same queue.
pub struct BoundedChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("capacity", &self.shared.capacity)
            .field("policy", &self.shared.policy)
            .field("len", &self.len())
            .field("state", &self.state())
            .finish()
    }
}

impl<T> BoundedChannel<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    items: VecDeque::with_capacity(capacity.min(1024)),
                    closed: false,
                    dropped: 0,
                }),
                notify: Notify::new(),
                capacity,
                policy,
            }),
        }
    }

    /// Reject-newest channel.
    pub fn fifo(capacity: usize) -> Self {
        Self::new(capacity, OverflowPolicy::RejectNewest)
    }

    /// Evict-oldest channel.
    pub fn ring(capacity: usize) -> Self {
        Self::new(capacity, OverflowPolicy::EvictOldest)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Enqueue a value.
    ///
    /// Fails only when the channel is closed. A full reject-newest channel
    /// accepts the call and discards the item without telling the producer.
    pub fn send(&self, item: T) -> Result<(), SessionError> {
        self.push(Slot::Value(item))
    }

    /// Enqueue an in-band "malformed reply" marker.
    pub fn send_malformed(&self, reason: impl Into<String>) -> Result<(), SessionError> {
        self.push(Slot::Malformed(reason.into()))
    }

    /// Wait for the next item, or `Disconnected` once closed and drained.
    pub async fn receive(&self) -> Received<T> {
        loop {
            // Registered before the check so a close between the check and the
            // await still wakes us.
            let notified = self.shared.notify.notified();
            match self.try_receive() {
                Received::NotYetAvailable => notified.await,
                other => return other,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_receive(&self) -> Received<T> {
        let mut queue = self.lock();
        match queue.items.pop_front() {
            Some(slot) => slot.into(),
            None if queue.closed => Received::Disconnected,
            None => Received::NotYetAvailable,
        }
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        {
            let mut queue = self.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
        }
        self.shared.notify.notify_waiters();
    }

    pub fn state(&self) -> ChannelState {
        if self.lock().closed {
            ChannelState::Closed
        } else {
            ChannelState::Open
        }
    }

    fn push(&self, slot: Slot<T>) -> Result<(), SessionError> {
        {
            let mut queue = self.lock();
            if queue.closed {
                return Err(SessionError::Closed);
            }
            if self.shared.capacity == 0 {
                queue.dropped += 1;
                return Ok(());
            }
            if queue.items.len() >= self.shared.capacity {
                queue.dropped += 1;
                match self.shared.policy {
                    OverflowPolicy::RejectNewest => {
                        trace!(capacity = self.shared.capacity, "Channel full, dropping newest item");
                        return Ok(());
                    }
                    OverflowPolicy::EvictOldest => {
                        queue.items.pop_front();
                    }
                }
            }
            queue.items.push_back(slot);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain<T>(channel: &BoundedChannel<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Received::Value(v) = channel.try_receive() {
            out.push(v);
        }
        out
    }

    #[tokio::test]
    async fn test_reject_newest_keeps_first_items() {
        let channel = BoundedChannel::fifo(2);
        channel.send(1).unwrap();
        channel.send(2).unwrap();
        channel.send(3).unwrap();

        assert_eq!(channel.receive().await, Received::Value(1));
        assert_eq!(channel.receive().await, Received::Value(2));
        assert_eq!(channel.try_receive(), Received::NotYetAvailable);
    }

    #[tokio::test]
    async fn test_evict_oldest_keeps_latest_items() {
        let channel = BoundedChannel::ring(2);
        channel.send(1).unwrap();
        channel.send(2).unwrap();
        channel.send(3).unwrap();

        assert_eq!(channel.receive().await, Received::Value(2));
        assert_eq!(channel.receive().await, Received::Value(3));
    }

    #[test]
    fn test_overflow_retains_capacity_items_in_order() {
        let capacity = 5;
        let extra = 7;

        let fifo = BoundedChannel::fifo(capacity);
        let ring = BoundedChannel::ring(capacity);
        for i in 0..capacity + extra {
            fifo.send(i).unwrap();
            ring.send(i).unwrap();
        }

        assert_eq!(drain(&fifo), (0..capacity).collect::<Vec<_>>());
        assert_eq!(drain(&ring), (extra..capacity + extra).collect::<Vec<_>>());
    }

    // Overflowing a reject-newest channel is silent for the producer; the
    // only trace is the dropped counter.
    #[test]
    fn test_reject_newest_overflow_is_silent() {
        let channel = BoundedChannel::fifo(1);
        assert!(channel.send("kept").is_ok());
        assert!(channel.send("lost").is_ok());
        assert_eq!(channel.len(), 1);
        assert_eq!(channel.dropped(), 1);
    }

    #[test]
    fn test_zero_capacity_ring_is_always_empty() {
        let channel = BoundedChannel::ring(0);
        for i in 0..10 {
            channel.send(i).unwrap();
        }
        assert!(channel.is_empty());
        assert_eq!(channel.try_receive(), Received::NotYetAvailable);
    }

    #[tokio::test]
    async fn test_close_drains_then_disconnects_forever() {
        let channel = BoundedChannel::fifo(8);
        channel.send("a").unwrap();
        channel.send("b").unwrap();
        channel.close();

        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.receive().await, Received::Value("a"));
        assert_eq!(channel.receive().await, Received::Value("b"));
        for _ in 0..3 {
            assert_eq!(channel.receive().await, Received::Disconnected);
            assert_eq!(channel.try_receive(), Received::Disconnected);
        }
    }

    #[test]
    fn test_send_after_close_fails() {
        let channel = BoundedChannel::fifo(4);
        channel.close();
        channel.close();
        assert!(matches!(channel.send(1), Err(SessionError::Closed)));
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receiver() {
        let channel: BoundedChannel<u32> = BoundedChannel::fifo(4);
        let receiver = channel.clone();
        let waiter = tokio::spawn(async move { receiver.receive().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("receiver should wake on close")
            .unwrap();
        assert_eq!(result, Received::Disconnected);
    }

    #[tokio::test]
    async fn test_send_wakes_pending_receiver() {
        let channel = BoundedChannel::fifo(4);
        let receiver = channel.clone();
        let waiter = tokio::spawn(async move { receiver.receive().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.send(42u32).unwrap();

        assert_eq!(waiter.await.unwrap(), Received::Value(42));
    }

    #[tokio::test]
    async fn test_malformed_marker_is_delivered_in_order() {
        let channel = BoundedChannel::fifo(4);
        channel.send(1).unwrap();
        channel.send_malformed("bad reply").unwrap();
        channel.send(2).unwrap();

        assert_eq!(channel.receive().await, Received::Value(1));
        assert_eq!(channel.receive().await, Received::Malformed("bad reply".into()));
        assert_eq!(channel.receive().await, Received::Value(2));
    }
}
