//! railsub broker
//!
//! The broker holds the real-time core: typed topics, the registry of
//! subscribers per topic, the events that flow through it, and the
//! publisher that fans events out to connection queues.

pub mod engine;
pub mod message;
pub mod registry;
pub mod topic;

pub use engine::{PublishReport, Publisher};
pub use message::{Delivery, EventKind, FleetUpdateEvent};
pub use registry::TopicRegistry;
pub use topic::{LineId, Topic, UserId};

#[cfg(test)]
mod tests;
