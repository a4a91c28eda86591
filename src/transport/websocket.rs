//! WebSocket transport
//!
//! This file implements the WebSocket server in front of the subscription
//! manager. Responsibilities:
//! - Route the handshake by path (`/ws/trens/`, `/ws/notificacoes/`) and
//!   authenticate it from the `token` query parameter or bearer header;
//!   the session is opened and auto-joined before the handshake completes
//! - Run one drain loop (queue -> socket, bounded by a write timeout) and
//!   one receive loop (socket -> subscription manager) per connection
//! - Close the session through the manager when either loop ends, whether
//!   the client left cleanly or not
//!
//! Failures are reported to the configured `ErrorSink`; none of them
//! affects other connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message as WsMessage;

use crate::client::ConnectionHandle;
use crate::transport::auth::{TokenAuthority, token_from_request};
use crate::transport::message::ServerMessage;
use crate::transport::session::{Endpoint, Session, SubscriptionManager};
use crate::utils::error::FeedError;
use crate::utils::report::ErrorSink;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything a connection task needs.
pub struct FeedServer {
    pub manager: Arc<SubscriptionManager>,
    pub authority: Arc<TokenAuthority>,
    pub errors: Arc<dyn ErrorSink>,
    pub write_timeout: Duration,
}

impl FeedServer {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        authority: Arc<TokenAuthority>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            manager,
            authority,
            errors,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

pub async fn start_websocket_server(listener: TcpListener, server: Arc<FeedServer>) {
    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket server listening on ws://{addr}");
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let server = server.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, server).await;
                });
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, server: Arc<FeedServer>) {
    let mut opened: Option<Session> = None;
    // a peer that never sends the upgrade request must not hold the task
    let handshake = tokio::time::timeout(
        server.write_timeout,
        accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                opened = Some(route(&server, req)?);
                Ok(resp)
            },
        ),
    )
    .await;

    let outcome = match handshake {
        Ok(Ok(ws)) => Ok(ws),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("no upgrade within {:?}", server.write_timeout)),
    };
    let ws_stream = match outcome {
        Ok(ws) => ws,
        Err(reason) => {
            if let Some(session) = opened.take() {
                server.manager.close(&session);
            }
            debug!("WebSocket handshake with {peer} failed: {reason}");
            return;
        }
    };
    let Some(session) = opened else {
        warn!("handshake with {peer} completed without a session");
        return;
    };

    let (ws_sender, ws_receiver) = ws_stream.split();
    let drain = drain_outbound(
        ws_sender,
        session.connection().clone(),
        server.write_timeout,
    );
    let receive = receive_loop(ws_receiver, &session, &server);

    tokio::select! {
        result = drain => {
            if let Err(e) = result {
                server.errors.report(&e);
            }
        }
        _ = receive => {}
    }

    server.manager.close(&session);
    debug!("{peer} disconnected");
}

/// Pick the endpoint, authenticate and open the session, or build the HTTP
/// rejection sent instead of the upgrade.
fn route(server: &FeedServer, req: &Request) -> Result<Session, ErrorResponse> {
    let Some(endpoint) = Endpoint::from_path(req.uri().path()) else {
        return Err(reject(StatusCode::NOT_FOUND, "unknown endpoint"));
    };

    // a presented token must be valid, even on the anonymous endpoint
    let identity = match token_from_request(req) {
        Some(token) => match server.authority.verify(&token) {
            Ok(user) => Some(user),
            Err(e) => {
                server.errors.report(&e);
                return Err(reject(StatusCode::UNAUTHORIZED, &e.to_string()));
            }
        },
        None => None,
    };

    server.manager.open(endpoint, identity).map_err(|e| {
        server.errors.report(&e);
        let status = match e {
            FeedError::TooManyConnections(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        };
        reject(status, &e.to_string())
    })
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Write queued deliveries to `sink` until the connection is closed.
///
/// A write that fails, or does not finish within `write_timeout`, ends the
/// loop with `DeadConnection`.
pub async fn drain_outbound<S>(
    mut sink: S,
    conn: Arc<ConnectionHandle>,
    write_timeout: Duration,
) -> Result<(), FeedError>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(delivery) = conn.next_delivery().await {
        let text = match ServerMessage::encode(&delivery) {
            Ok(text) => text,
            Err(e) => {
                warn!("dropping unencodable delivery on {}: {e}", delivery.topic);
                continue;
            }
        };

        match tokio::time::timeout(write_timeout, sink.send(WsMessage::Text(text.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(FeedError::DeadConnection {
                    connection: conn.id().to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(FeedError::DeadConnection {
                    connection: conn.id().to_string(),
                    reason: format!("write timed out after {write_timeout:?}"),
                });
            }
        }
    }

    let _ = sink.close().await;
    Ok(())
}

async fn receive_loop<S>(mut ws_receiver: S, session: &Session, server: &FeedServer)
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let conn_id = session.connection().id();
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if let Err(e) = server
                    .manager
                    .handle_client_message(session, text.as_str())
                    .await
                {
                    server.errors.report(&e);
                    if e.closes_connection() {
                        break;
                    }
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("{conn_id} read error: {e}");
                break;
            }
        }
    }
}
