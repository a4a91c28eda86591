//! Connection handle
//!
//! `ConnectionHandle` models one live client session. It owns a bounded
//! outbound queue that the publisher fills with `enqueue` and that the
//! connection's own drain loop empties with `next_delivery`.
//!
//! `enqueue` never blocks: when the queue is full the oldest queued delivery
//! is discarded in favor of the new one and the drop counter is bumped.
//! Once the handle is closed every further `enqueue` is silently refused.
//!
//! The set of joined topics lives here as well, behind the same lock that
//! guards the closed flag, so a join racing a disconnect can never leave a
//! stale registry entry behind.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::broker::message::Delivery;
use crate::broker::topic::{Topic, UserId};
use crate::utils::error::FeedError;

pub type ConnectionId = String;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Enqueued after discarding the oldest queued delivery.
    DroppedOldest,
    /// The connection is closed; nothing was queued.
    Closed,
}

#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Option<UserId>,
    capacity: usize,
    queue: Mutex<VecDeque<Delivery>>,
    ready: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    topics: Mutex<HashSet<Topic>>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh `conn-<uuid>` id. A zero capacity is
    /// raised to one.
    pub fn new(identity: Option<UserId>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: format!("conn-{}", Uuid::new_v4()),
            identity,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            topics: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Authenticated user behind this connection, if any.
    pub fn identity(&self) -> Option<UserId> {
        self.identity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn enqueue(&self, delivery: Delivery) -> EnqueueOutcome {
        if self.is_closed() {
            return EnqueueOutcome::Closed;
        }

        let outcome = {
            let mut queue = self.queue.lock();
            let outcome = if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::DroppedOldest
            } else {
                EnqueueOutcome::Enqueued
            };
            queue.push_back(delivery);
            outcome
        };

        self.ready.notify_one();
        outcome
    }

    pub fn try_next(&self) -> Option<Delivery> {
        self.queue.lock().pop_front()
    }

    /// Wait for the next queued delivery. Returns `None` once the handle is
    /// closed; deliveries still queued at that point are abandoned.
    pub async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.ready.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(delivery) = self.try_next() {
                return Some(delivery);
            }
            notified.await;
        }
    }

    /// Close the handle. Idempotent; returns `true` only for the call that
    /// actually closed it.
    pub fn close(&self) -> bool {
        let _topics = self.topics.lock();
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.queue.lock().clear();
            // wake the drain loop so it observes the closed flag
            self.ready.notify_one();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of deliveries discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.lock().iter().cloned().collect()
    }

    /// Run `f` against the joined-topic set while the handle is known to be
    /// open. Fails with `ConnectionClosed` otherwise.
    pub(crate) fn with_topics<R>(
        &self,
        f: impl FnOnce(&mut HashSet<Topic>) -> R,
    ) -> Result<R, FeedError> {
        let mut topics = self.topics.lock();
        if self.is_closed() {
            return Err(FeedError::ConnectionClosed(self.id.clone()));
        }
        Ok(f(&mut topics))
    }

    /// Empty the joined-topic set, returning what it held.
    pub(crate) fn take_topics(&self) -> Vec<Topic> {
        self.topics.lock().drain().collect()
    }
}
