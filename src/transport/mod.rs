//! The `transport` module is responsible for network communication with
//! clients over WebSockets.
//!
//! It defines the JSON control and event protocol, bearer-token
//! authentication for the notification feed, the subscription manager that
//! maps client sessions onto the topic registry, and the WebSocket server
//! itself.

pub mod auth;
pub mod message;
pub mod session;
pub mod websocket;

pub use auth::TokenAuthority;
pub use session::{Endpoint, Session, SubscriptionManager};
pub use websocket::{FeedServer, start_websocket_server};
