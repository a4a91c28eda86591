//! Subscription manager
//!
//! Owns the lifecycle of client sessions against the topic registry:
//! - `open` creates the connection handle and joins the topic implied by the
//!   endpoint (`fleet` or `user:<id>`) before any client message is read
//! - `handle_client_message` turns `subscribe_linha` / `unsubscribe_linha`
//!   into joins and leaves on `line:<id>`, and `marcar_lida` into a read
//!   acknowledgment on the caller's own notification record
//! - `close` removes the connection from every topic exactly once, however
//!   the session ended

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, info};

use crate::broker::registry::TopicRegistry;
use crate::broker::topic::{Topic, UserId};
use crate::client::ConnectionHandle;
use crate::client::connection::DEFAULT_QUEUE_CAPACITY;
use crate::persistence::{NotificationStore, PersistenceError, Topology};
use crate::transport::message::ClientMessage;
use crate::utils::error::FeedError;

pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// The two feeds a client can connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// `/ws/trens/`: fleet and per-line updates, anonymous allowed.
    Fleet,
    /// `/ws/notificacoes/`: personal notifications, token required.
    Notifications,
}

impl Endpoint {
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/ws/trens" => Some(Endpoint::Fleet),
            "/ws/notificacoes" => Some(Endpoint::Notifications),
            _ => None,
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Fleet => "/ws/trens/",
            Endpoint::Notifications => "/ws/notificacoes/",
        }
    }

    pub fn requires_identity(self) -> bool {
        matches!(self, Endpoint::Notifications)
    }
}

/// One open client session.
#[derive(Debug)]
pub struct Session {
    conn: Arc<ConnectionHandle>,
    endpoint: Endpoint,
    released: AtomicBool,
}

impl Session {
    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.conn
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn identity(&self) -> Option<UserId> {
        self.conn.identity()
    }
}

pub struct SubscriptionManager {
    registry: Arc<TopicRegistry>,
    topology: Arc<dyn Topology>,
    store: Arc<dyn NotificationStore>,
    queue_capacity: usize,
    max_connections: usize,
    active: AtomicUsize,
}

impl SubscriptionManager {
    pub fn new(
        registry: Arc<TopicRegistry>,
        topology: Arc<dyn Topology>,
        store: Arc<dyn NotificationStore>,
    ) -> Self {
        Self {
            registry,
            topology,
            store,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            active: AtomicUsize::new(0),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Open sessions.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Open a session on `endpoint` and auto-join its topic.
    pub fn open(&self, endpoint: Endpoint, identity: Option<UserId>) -> Result<Session, FeedError> {
        let topic = match (endpoint, identity) {
            (Endpoint::Fleet, _) => Topic::Fleet,
            (Endpoint::Notifications, Some(user)) => Topic::User(user),
            (Endpoint::Notifications, None) => {
                return Err(FeedError::Unauthorized(
                    "notification feed requires a token".to_string(),
                ));
            }
        };

        let max = self.max_connections;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map_err(|_| FeedError::TooManyConnections(max))?;

        let conn = ConnectionHandle::new(identity, self.queue_capacity);
        if let Err(e) = self.registry.join(&topic, &conn) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }

        info!("{} opened on {} ({topic})", conn.id(), endpoint.path());
        Ok(Session {
            conn,
            endpoint,
            released: AtomicBool::new(false),
        })
    }

    /// Apply one inbound text frame to `session`.
    ///
    /// Unknown message types are ignored. Every error returned is local to
    /// this session; see `FeedError::closes_connection` for which ones end it.
    pub async fn handle_client_message(
        &self,
        session: &Session,
        text: &str,
    ) -> Result<(), FeedError> {
        let Some(message) = ClientMessage::parse(text)? else {
            debug!("{} sent an unhandled message type", session.conn.id());
            return Ok(());
        };

        match message {
            ClientMessage::SubscribeLine { line } => {
                if !self.topology.has_line(&line) {
                    return Err(FeedError::UnknownLine(line));
                }
                self.registry.join(&Topic::Line(line), &session.conn)
            }
            ClientMessage::UnsubscribeLine { line } => {
                self.registry.leave(&Topic::Line(line), &session.conn);
                Ok(())
            }
            ClientMessage::MarkRead { id } => {
                let user = session.identity().ok_or_else(|| {
                    FeedError::Unauthorized("marking notifications requires a token".to_string())
                })?;
                match self.store.mark_read(user, id).await {
                    Ok(()) => {
                        debug!("user {user} read notification {id}");
                        Ok(())
                    }
                    Err(PersistenceError::NotFound(id)) => Err(FeedError::MalformedMessage(
                        format!("no notification {id} for user {user}"),
                    )),
                    Err(e) => Err(FeedError::PersistenceFailure {
                        user,
                        reason: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Remove the session from every topic. Only the first call has any
    /// effect; returns whether this call was it.
    pub fn close(&self, session: &Session) -> bool {
        if session.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        let topics = self.registry.leave_all(&session.conn);
        self.active.fetch_sub(1, Ordering::SeqCst);
        info!(
            "{} closed, left {} topics, {} deliveries dropped",
            session.conn.id(),
            topics.len(),
            session.conn.dropped()
        );
        true
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("queue_capacity", &self.queue_capacity)
            .field("max_connections", &self.max_connections)
            .field("active", &self.connection_count())
            .finish()
    }
}
