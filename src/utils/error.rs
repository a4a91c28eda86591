//! The `error` module defines the error taxonomy of the feed.
//!
//! Every failure in the fan-out core is local to one connection or to the
//! notification-durability side effect; none of them is fatal to the
//! process. `FeedError` is `Clone` so observability sinks can keep what
//! they were handed.

use thiserror::Error;

use crate::broker::topic::{LineId, UserId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    /// Joining another user's topic, or reaching the notification feed
    /// without credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("malformed topic '{0}'")]
    MalformedTopic(String),

    #[error("unknown line '{0}'")]
    UnknownLine(LineId),

    /// The outbound queue was full; the oldest queued delivery was dropped.
    #[error("slow consumer {connection}: {dropped} deliveries dropped so far")]
    SlowConsumer { connection: String, dropped: u64 },

    #[error("dead connection {connection}: {reason}")]
    DeadConnection { connection: String, reason: String },

    #[error("notification persistence failed for user {user}: {reason}")]
    PersistenceFailure { user: UserId, reason: String },

    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    #[error("connection limit of {0} reached")]
    TooManyConnections(usize),
}

impl FeedError {
    /// Errors after which the offending connection is closed rather than
    /// kept open.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            FeedError::Unauthorized(_)
                | FeedError::DeadConnection { .. }
                | FeedError::ConnectionClosed(_)
        )
    }
}
