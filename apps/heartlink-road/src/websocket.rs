use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use heartlink_proto::{ClientMessage, EndpointId, ServerMessage, SessionErrorKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pairing::{PairingError, PairingRegistry, PairingStats, SessionSnapshot};

/// Relay-side state for one websocket connection.
#[derive(Clone)]
struct Connection {
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_heartbeat: Arc<RwLock<Instant>>,
    shutdown: Arc<Notify>,
}

/// Shared state for the relay: live connections plus room pairing.
#[derive(Clone)]
pub struct RelayState {
    connections: Arc<DashMap<EndpointId, Connection>>,
    pairing: Arc<Mutex<PairingRegistry>>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            pairing: Arc::new(Mutex::new(PairingRegistry::new())),
        }
    }

    /// Periodically drops connections whose last ping is older than `timeout`.
    pub fn spawn_heartbeat_monitor(&self, sweep: Duration, timeout: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep);
            loop {
                interval.tick().await;
                state.sweep_stale(timeout).await;
            }
        })
    }

    async fn sweep_stale(&self, timeout: Duration) {
        // Clone the locks out first so no DashMap guard is held across await.
        let heartbeats: Vec<(EndpointId, Arc<RwLock<Instant>>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_heartbeat.clone()))
            .collect();

        for (endpoint, heartbeat) in heartbeats {
            if heartbeat.read().await.elapsed() <= timeout {
                continue;
            }
            info!(
                target = "heartlink::road",
                endpoint = %endpoint,
                "dropping connection after heartbeat timeout"
            );
            if let Some((_, connection)) = self.connections.remove(&endpoint) {
                connection.shutdown.notify_one();
            }
            self.release(&endpoint);
        }
    }

    pub fn sessions(&self) -> (Vec<SessionSnapshot>, PairingStats) {
        let pairing = self.pairing.lock();
        (pairing.snapshot(), pairing.stats())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn send_to(&self, endpoint: &EndpointId, message: ServerMessage) -> Result<()> {
        let connection = self
            .connections
            .get(endpoint)
            .ok_or_else(|| anyhow::anyhow!("endpoint {endpoint} is not connected"))?;
        connection
            .tx
            .send(message)
            .map_err(|_| anyhow::anyhow!("endpoint {endpoint} is closing"))?;
        Ok(())
    }

    /// Frees the endpoint's seat and tells the remaining occupant.
    fn release(&self, endpoint: &EndpointId) {
        let departure = self.pairing.lock().leave(endpoint);
        let Some(departure) = departure else {
            return;
        };
        info!(
            target = "heartlink::road",
            endpoint = %endpoint,
            room = %departure.room,
            role = %departure.role,
            "endpoint left room"
        );
        if let Some(remaining) = departure.remaining {
            let _ = self.send_to(
                &remaining,
                ServerMessage::UserLeft {
                    id: endpoint.clone(),
                },
            );
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let endpoint = EndpointId::new(Uuid::new_v4().to_string());
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let shutdown = Arc::new(Notify::new());

    // One writer per connection keeps delivery in send order.
    let writer_endpoint = endpoint.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match heartlink_proto::encode(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(target = "heartlink::road", "failed to encode message: {err}"),
            }
        }
        debug!(
            target = "heartlink::road",
            endpoint = %writer_endpoint,
            "writer task ended"
        );
    });

    state.connections.insert(
        endpoint.clone(),
        Connection {
            tx: tx.clone(),
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            shutdown: shutdown.clone(),
        },
    );
    let _ = tx.send(ServerMessage::UserId {
        id: endpoint.clone(),
    });
    debug!(target = "heartlink::road", endpoint = %endpoint, "websocket connected");

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = shutdown.notified() => break,
        };
        let Some(frame) = frame else {
            break;
        };
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(
                        target = "heartlink::road",
                        endpoint = %endpoint,
                        "ignoring non-utf8 binary frame"
                    );
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(target = "heartlink::road", endpoint = %endpoint, "websocket error: {err}");
                break;
            }
        };

        match heartlink_proto::decode_client(&text) {
            Ok(message) => {
                if let Err(err) = handle_client_message(message, &endpoint, &state, &tx).await {
                    warn!(
                        target = "heartlink::road",
                        endpoint = %endpoint,
                        "failed to handle message: {err}"
                    );
                    let _ = tx.send(ServerMessage::Error {
                        message: err.to_string(),
                    });
                }
            }
            Err(err) => {
                let _ = tx.send(ServerMessage::Error {
                    message: err.to_string(),
                });
            }
        }
    }

    state.connections.remove(&endpoint);
    state.release(&endpoint);
    drop(tx);
    let _ = writer.await;
    debug!(target = "heartlink::road", endpoint = %endpoint, "websocket disconnected");
}

async fn handle_client_message(
    message: ClientMessage,
    endpoint: &EndpointId,
    state: &RelayState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Result<()> {
    match message {
        ClientMessage::Join { room } => {
            let result = state.pairing.lock().join(endpoint, &room);
            match result {
                Ok(assignment) => {
                    info!(
                        target = "heartlink::road",
                        endpoint = %endpoint,
                        room = %room,
                        role = %assignment.role,
                        "endpoint joined room"
                    );
                    tx.send(ServerMessage::SessionInfo {
                        session_id: assignment.session_id.clone(),
                        role: assignment.role,
                        status: assignment.status,
                    })?;
                    if assignment.newly_paired {
                        if let Some(peer) = assignment.peer {
                            state.send_to(
                                &peer,
                                ServerMessage::UserJoined {
                                    id: endpoint.clone(),
                                },
                            )?;
                            tx.send(ServerMessage::UserJoined { id: peer })?;
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        target = "heartlink::road",
                        endpoint = %endpoint,
                        room = %room,
                        "join rejected: {err}"
                    );
                    let error = match err {
                        PairingError::SessionFull { .. } => SessionErrorKind::SessionFull,
                        PairingError::AlreadySeated { .. } => SessionErrorKind::AlreadySeated,
                    };
                    tx.send(ServerMessage::SessionError {
                        error,
                        message: err.to_string(),
                    })?;
                }
            }
        }
        ClientMessage::Leave => state.release(endpoint),
        ClientMessage::Ping => {
            let heartbeat = state
                .connections
                .get(endpoint)
                .map(|connection| connection.last_heartbeat.clone());
            if let Some(heartbeat) = heartbeat {
                *heartbeat.write().await = Instant::now();
            }
            tx.send(ServerMessage::Pong)?;
        }
        relayed => {
            let Some((target, delivered)) = ServerMessage::relayed_from(endpoint, relayed) else {
                return Ok(());
            };
            debug!(
                target = "heartlink::road",
                sender = %endpoint,
                to = %target,
                "forwarding signal"
            );
            state.send_to(&target, delivered)?;
        }
    }
    Ok(())
}
