//! Publisher / fan-out engine
//!
//! `Publisher::publish` delivers one `FleetUpdateEvent` to every connection
//! subscribed to any of its target topics:
//! - for each target topic, take the topic's ordering lock, snapshot its
//!   subscribers, assign the next sequence number and enqueue to every
//!   connection in the snapshot
//! - a connection reached through an earlier target topic of the same event
//!   is skipped, so it sees the event once
//! - notification events on a `user:*` topic are first written to the
//!   notification store, bounded by `persist_timeout`; a failed or slow
//!   write is reported to the error sink and fan-out proceeds anyway
//!
//! Concurrency notes:
//! - the ordering lock is per topic, so per-topic FIFO holds even when
//!   several tasks publish concurrently, and unrelated topics never wait on
//!   each other
//! - `enqueue` never blocks, so a slow client cannot stall the loop
//! - no registry or ordering lock is held across the store's await points

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::broker::message::{Delivery, EventKind, FleetUpdateEvent};
use crate::broker::registry::TopicRegistry;
use crate::broker::topic::{Topic, UserId};
use crate::client::EnqueueOutcome;
use crate::persistence::{NewNotification, NotificationId, NotificationKind, NotificationStore};
use crate::utils::error::FeedError;
use crate::utils::report::ErrorSink;

pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of one `publish` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Deliveries queued without loss.
    pub delivered: usize,
    /// Deliveries queued after discarding an older one.
    pub dropped: usize,
    /// Subscribers skipped because their connection was already closed.
    pub skipped: usize,
    /// Durable notification records written for this event.
    pub records: Vec<(UserId, NotificationId)>,
}

impl PublishReport {
    /// Connections that received the event, lossy or not.
    pub fn reached(&self) -> usize {
        self.delivered + self.dropped
    }
}

pub struct Publisher {
    registry: Arc<TopicRegistry>,
    store: Arc<dyn NotificationStore>,
    errors: Arc<dyn ErrorSink>,
    persist_timeout: Duration,
    sequences: DashMap<Topic, Arc<Mutex<u64>>>,
}

impl Publisher {
    pub fn new(
        registry: Arc<TopicRegistry>,
        store: Arc<dyn NotificationStore>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            registry,
            store,
            errors,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
            sequences: DashMap::new(),
        }
    }

    pub fn with_persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Last sequence number assigned on `topic` (0 if none yet).
    pub fn last_seq(&self, topic: &Topic) -> u64 {
        self.sequences.get(topic).map_or(0, |seq| {
            let last = *seq.lock();
            last
        })
    }

    pub async fn publish(&self, event: FleetUpdateEvent) -> PublishReport {
        let event = Arc::new(event);
        let kind = event.kind();
        let mut report = PublishReport::default();
        let mut reached: HashSet<String> = HashSet::new();

        for topic in &event.targets {
            let record = match topic {
                Topic::User(user) if kind.is_notification() => {
                    self.persist(*user, &event).await.map(|id| (*user, id))
                }
                _ => None,
            };

            let before = report.reached();
            self.fan_out(topic, &event, record.map(|(_, id)| id), &mut reached, &mut report);
            let reached_here = report.reached() - before;

            if let Some((user, id)) = record {
                report.records.push((user, id));
                if reached_here > 0 {
                    self.confirm_delivery(user, id).await;
                }
            }
        }

        trace!(
            "published {} to {} topics: {:?}",
            kind.wire_type(),
            event.targets.len(),
            report
        );
        report
    }

    fn fan_out(
        &self,
        topic: &Topic,
        event: &Arc<FleetUpdateEvent>,
        record_id: Option<NotificationId>,
        reached: &mut HashSet<String>,
        report: &mut PublishReport,
    ) {
        let sequence = self
            .sequences
            .entry(topic.clone())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone();

        let mut seq = sequence.lock();
        let subscribers = self.registry.subscribers_of(topic);
        *seq += 1;

        let delivery = Delivery {
            topic: topic.clone(),
            seq: *seq,
            record_id,
            event: event.clone(),
        };

        for conn in subscribers {
            if !reached.insert(conn.id().to_string()) {
                continue;
            }
            match conn.enqueue(delivery.clone()) {
                EnqueueOutcome::Enqueued => report.delivered += 1,
                EnqueueOutcome::DroppedOldest => {
                    report.dropped += 1;
                    self.errors.report(&FeedError::SlowConsumer {
                        connection: conn.id().to_string(),
                        dropped: conn.dropped(),
                    });
                }
                EnqueueOutcome::Closed => report.skipped += 1,
            }
        }
    }

    async fn persist(&self, user: UserId, event: &FleetUpdateEvent) -> Option<NotificationId> {
        let notice = event.notice()?;
        let kind = match event.kind() {
            EventKind::NotificationDelay => NotificationKind::Delay,
            _ => NotificationKind::Arrival,
        };
        let record = NewNotification {
            recipient: user,
            kind,
            title: notice.title.clone(),
            body: notice.body.clone(),
            line: notice.line_id.clone(),
            station: notice.station.clone(),
        };

        let reason = match tokio::time::timeout(
            self.persist_timeout,
            self.store.record_notification(record),
        )
        .await
        {
            Ok(Ok(id)) => return Some(id),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.persist_timeout),
        };

        self.errors
            .report(&FeedError::PersistenceFailure { user, reason });
        None
    }

    async fn confirm_delivery(&self, user: UserId, id: NotificationId) {
        let reason = match tokio::time::timeout(
            self.persist_timeout,
            self.store.mark_delivered(user, id),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!("notification {id} delivered to user {user}");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.persist_timeout),
        };

        self.errors
            .report(&FeedError::PersistenceFailure { user, reason });
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("persist_timeout", &self.persist_timeout)
            .field("topics", &self.sequences.len())
            .finish()
    }
}
