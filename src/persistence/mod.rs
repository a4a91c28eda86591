//! The `persistence` module holds the collaborators the fan-out core reads
//! from and writes through.
//!
//! - `sled_store`: durable notification records, one `sled` tree per
//!   recipient, with retention-based cleanup.
//! - `topology`: read-only view of lines and their ordered stations.

pub mod sled_store;
pub mod topology;

use thiserror::Error;

pub use sled_store::{
    NewNotification, NotificationId, NotificationKind, NotificationRecord, NotificationStore,
    SledNotificationStore,
};
pub use topology::{Line, StaticTopology, Station, Topology};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("notification {0} not found")]
    NotFound(NotificationId),
}
