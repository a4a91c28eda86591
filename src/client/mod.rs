//! The `client` module defines the representation of a client in the feed.
//!
//! It provides `ConnectionHandle`, which encapsulates the state of a single
//! connected client: its id, optional authenticated identity, bounded
//! outbound queue and the topics it has joined.

pub mod connection;
pub use connection::{ConnectionHandle, ConnectionId, EnqueueOutcome};
