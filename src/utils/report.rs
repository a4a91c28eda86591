//! Observability sink for contained failures.
//!
//! The publisher and the transport never propagate per-connection or
//! persistence failures to their callers; they hand them to an `ErrorSink`
//! instead.

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::utils::error::FeedError;

pub trait ErrorSink: Send + Sync {
    fn report(&self, err: &FeedError);
}

/// Logs every reported error through `tracing`.
#[derive(Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, err: &FeedError) {
        match err {
            // drops are routine under backpressure
            FeedError::SlowConsumer { .. } => debug!("{err}"),
            FeedError::PersistenceFailure { .. } => error!("{err}"),
            _ => warn!("{err}"),
        }
    }
}

/// Keeps reported errors in memory.
#[derive(Debug, Default)]
pub struct RecordingErrorSink {
    reported: Mutex<Vec<FeedError>>,
}

impl RecordingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported(&self) -> Vec<FeedError> {
        self.reported.lock().clone()
    }

    pub fn count_matching(&self, pred: impl Fn(&FeedError) -> bool) -> usize {
        self.reported.lock().iter().filter(|e| pred(e)).count()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, err: &FeedError) {
        self.reported.lock().push(err.clone());
    }
}
