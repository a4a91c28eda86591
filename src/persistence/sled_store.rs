//! Notification store backed by `sled`
//!
//! Each recipient gets its own tree (`notifications:<user>`). Keys are the
//! big-endian ids handed out by `Db::generate_id`, so a reverse scan yields
//! the newest records first.
//!
//! Configuration options supported:
//! - `retention`: optional age after which records are removed by
//!   `purge_expired` (30 days in the default configuration)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, error, info};

use crate::broker::topic::{LineId, UserId};
use crate::persistence::PersistenceError;

pub type NotificationId = u64;

const TREE_PREFIX: &str = "notifications:";

/// Newest records returned by `notifications_for`.
pub const LIST_LIMIT: usize = 50;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    #[serde(rename = "chegada")]
    Arrival,
    #[serde(rename = "atraso")]
    Delay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub recipient: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub line: Option<LineId>,
    pub station: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub recipient: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub line: Option<LineId>,
    pub station: Option<String>,
    pub read: bool,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn record_notification(
        &self,
        notification: NewNotification,
    ) -> Result<NotificationId, PersistenceError>;

    async fn mark_delivered(
        &self,
        recipient: UserId,
        id: NotificationId,
    ) -> Result<(), PersistenceError>;

    /// Set the read flag on one of `recipient`'s own records.
    async fn mark_read(&self, recipient: UserId, id: NotificationId)
    -> Result<(), PersistenceError>;

    async fn notifications_for(
        &self,
        recipient: UserId,
        unread_only: bool,
    ) -> Result<Vec<NotificationRecord>, PersistenceError>;
}

#[derive(Clone)]
pub struct SledNotificationStore {
    db: Db,
    retention: Option<chrono::Duration>,
}

impl SledNotificationStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str, retention: Option<Duration>) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Ok(Self::with_db(db, retention))
    }

    pub fn with_db(db: Db, retention: Option<Duration>) -> Self {
        Self {
            db,
            retention: retention.and_then(|r| chrono::Duration::from_std(r).ok()),
        }
    }

    fn tree_for(&self, recipient: UserId) -> Result<Tree, PersistenceError> {
        Ok(self.db.open_tree(format!("{TREE_PREFIX}{recipient}"))?)
    }

    /// Apply `apply` to a stored record with a compare-and-swap loop, so
    /// concurrent flag updates on the same record never overwrite each
    /// other.
    fn update(
        &self,
        recipient: UserId,
        id: NotificationId,
        apply: fn(&mut NotificationRecord),
    ) -> Result<(), PersistenceError> {
        let tree = self.tree_for(recipient)?;
        let key = id.to_be_bytes();
        loop {
            let current = tree.get(key)?.ok_or(PersistenceError::NotFound(id))?;
            let mut record: NotificationRecord = serde_json::from_slice(&current)?;
            apply(&mut record);
            let updated = serde_json::to_vec(&record)?;
            match tree.compare_and_swap(key, Some(&current), Some(updated))? {
                Ok(()) => return Ok(()),
                Err(_) => debug!("notification {id} changed concurrently, retrying"),
            }
        }
    }

    fn insert_record(
        &self,
        notification: NewNotification,
    ) -> Result<NotificationId, PersistenceError> {
        let id = self.db.generate_id()?;
        let record = NotificationRecord {
            id,
            recipient: notification.recipient,
            kind: notification.kind,
            title: notification.title,
            body: notification.body,
            line: notification.line,
            station: notification.station,
            read: false,
            delivered: false,
            created_at: Utc::now(),
        };

        let tree = self.tree_for(record.recipient)?;
        tree.insert(id.to_be_bytes(), serde_json::to_vec(&record)?)?;
        Ok(id)
    }

    fn list(
        &self,
        recipient: UserId,
        unread_only: bool,
    ) -> Result<Vec<NotificationRecord>, PersistenceError> {
        let tree = self.tree_for(recipient)?;
        let mut records = Vec::new();
        for entry in tree.iter().rev() {
            let (_, val) = entry?;
            let record: NotificationRecord = serde_json::from_slice(&val)?;
            if unread_only && record.read {
                continue;
            }
            records.push(record);
            if records.len() == LIST_LIMIT {
                break;
            }
        }
        Ok(records)
    }

    /// Run sled work on the blocking pool. Callers awaiting the result may
    /// give up on it (e.g. through `tokio::time::timeout`) without stalling
    /// a runtime worker.
    async fn blocking<T, F>(&self, work: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(SledNotificationStore) -> Result<T, PersistenceError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || work(store)).await?
    }

    /// Remove records older than the retention period across all
    /// recipients. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, PersistenceError> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let cutoff = Utc::now() - retention;
        let mut removed = 0;

        for name in self.db.tree_names() {
            if !name.starts_with(TREE_PREFIX.as_bytes()) {
                continue;
            }
            let tree = self.db.open_tree(&name)?;
            let expired: Vec<_> = tree
                .iter()
                .filter_map(|res| res.ok())
                .filter(|(_, val)| {
                    serde_json::from_slice::<NotificationRecord>(val)
                        .is_ok_and(|record| record.created_at < cutoff)
                })
                .map(|(key, _)| key)
                .collect();

            for key in expired {
                tree.remove(key)?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Periodically purge expired records. Runs until the task is dropped.
    pub async fn start_retention_loop(store: Arc<SledNotificationStore>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let sweep = {
                let store = store.clone();
                tokio::task::spawn_blocking(move || store.purge_expired()).await
            };
            match sweep {
                Ok(Ok(0)) => debug!("retention sweep: nothing to purge"),
                Ok(Ok(n)) => info!("retention sweep removed {n} notifications"),
                Ok(Err(e)) => error!("retention sweep failed: {e}"),
                Err(e) => error!("retention sweep task failed: {e}"),
            }
        }
    }
}

#[async_trait]
impl NotificationStore for SledNotificationStore {
    async fn record_notification(
        &self,
        notification: NewNotification,
    ) -> Result<NotificationId, PersistenceError> {
        self.blocking(move |store| store.insert_record(notification))
            .await
    }

    async fn mark_delivered(
        &self,
        recipient: UserId,
        id: NotificationId,
    ) -> Result<(), PersistenceError> {
        self.blocking(move |store| store.update(recipient, id, |record| record.delivered = true))
            .await
    }

    async fn mark_read(
        &self,
        recipient: UserId,
        id: NotificationId,
    ) -> Result<(), PersistenceError> {
        self.blocking(move |store| store.update(recipient, id, |record| record.read = true))
            .await
    }

    async fn notifications_for(
        &self,
        recipient: UserId,
        unread_only: bool,
    ) -> Result<Vec<NotificationRecord>, PersistenceError> {
        self.blocking(move |store| store.list(recipient, unread_only))
            .await
    }
}

impl std::fmt::Debug for SledNotificationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledNotificationStore")
            .field("db", &"sled::Db")
            .field("retention", &self.retention)
            .finish()
    }
}
