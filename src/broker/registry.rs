//! Topic registry
//!
//! Maps each topic to the connections currently subscribed to it. The map is
//! a `DashMap`, so mutations on one topic only contend with topics hashed to
//! the same shard, and never with a global lock.
//!
//! The registry holds back-references: it never closes a connection it
//! finds in a subscriber set. Empty topics are removed on the spot and
//! recreated on the next join.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::broker::topic::Topic;
use crate::client::{ConnectionHandle, ConnectionId};
use crate::utils::error::FeedError;

type Subscribers = HashMap<ConnectionId, Arc<ConnectionHandle>>;

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: DashMap<Topic, Subscribers>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to the subscribers of `topic`. Joining twice is a no-op.
    ///
    /// Fails with `Unauthorized` when `topic` is another user's personal
    /// feed, and with `ConnectionClosed` when `conn` has already been
    /// closed. The registry is left untouched on failure.
    pub fn join(&self, topic: &Topic, conn: &Arc<ConnectionHandle>) -> Result<(), FeedError> {
        if let Some(owner) = topic.required_identity() {
            if conn.identity() != Some(owner) {
                return Err(FeedError::Unauthorized(format!(
                    "{} may not join {topic}",
                    conn.id()
                )));
            }
        }

        conn.with_topics(|joined| {
            self.topics
                .entry(topic.clone())
                .or_default()
                .insert(conn.id().to_string(), conn.clone());
            joined.insert(topic.clone());
        })?;

        debug!("{} joined {topic}", conn.id());
        Ok(())
    }

    /// Remove `conn` from `topic`. No-op when it was not subscribed.
    ///
    /// Both sides are updated under the connection's topic lock, mirroring
    /// `join`, so a concurrent join of the same topic cannot interleave.
    pub fn leave(&self, topic: &Topic, conn: &ConnectionHandle) {
        let removed = conn.with_topics(|joined| {
            joined.remove(topic);
            self.remove_subscriber(topic, conn.id());
        });
        if removed.is_err() {
            // closed: leave_all owns the topic set, only the registry side is left
            self.remove_subscriber(topic, conn.id());
        }
        debug!("{} left {topic}", conn.id());
    }

    /// Remove `conn` from every topic it joined and close it for further
    /// joins. Returns the topics it was removed from.
    pub fn leave_all(&self, conn: &ConnectionHandle) -> Vec<Topic> {
        conn.close();
        let topics = conn.take_topics();
        for topic in &topics {
            self.remove_subscriber(topic, conn.id());
        }
        debug!("{} removed from {} topics", conn.id(), topics.len());
        topics
    }

    /// Snapshot of the subscribers of `topic` at call time.
    pub fn subscribers_of(&self, topic: &Topic) -> Vec<Arc<ConnectionHandle>> {
        self.topics
            .get(topic)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, topic: &Topic, conn: &ConnectionHandle) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subs| subs.contains_key(conn.id()))
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    fn remove_subscriber(&self, topic: &Topic, id: &str) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.remove(id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }
}
