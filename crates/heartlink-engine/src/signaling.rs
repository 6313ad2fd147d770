//! Websocket client for the HeartLink relay.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use heartlink_proto::{
    ClientMessage, EndpointId, Role, ServerMessage, SessionErrorKind, SessionStatus,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::EngineError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type JoinReply = oneshot::Sender<Result<SessionAssignment, EngineError>>;

/// Seat granted by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAssignment {
    pub session_id: String,
    pub role: Role,
    pub status: SessionStatus,
}

/// One relay connection. Outbound envelopes are written in send order by a
/// single writer task; everything the relay sends, including the
/// join replies, is forwarded to the inbound stream.
pub struct SignalingClient {
    endpoint_id: EndpointId,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    inbound_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    pending_join: Arc<Mutex<Option<JoinReply>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connects and waits for the relay to assign an endpoint id.
    pub async fn connect(relay_url: &str) -> Result<Arc<Self>, EngineError> {
        let websocket_url = websocket_url(relay_url)?;
        let (ws_stream, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(websocket_url.as_str()))
            .await
            .map_err(|_| EngineError::Signaling(format!("connect to {websocket_url} timed out")))?
            .map_err(|err| EngineError::Signaling(format!("websocket connect failed: {err}")))?;
        debug!(
            target = "heartlink::signaling",
            url = %websocket_url,
            "relay websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (id_tx, id_rx) = oneshot::channel::<EndpointId>();
        let pending_join: Arc<Mutex<Option<JoinReply>>> = Arc::new(Mutex::new(None));

        let writer_handle = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match heartlink_proto::encode(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(
                        target = "heartlink::signaling",
                        "failed to encode message: {err}"
                    ),
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_join = Arc::clone(&pending_join);
        let reader_handle = tokio::spawn(async move {
            let mut id_tx = Some(id_tx);
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                debug!(
                                    target = "heartlink::signaling",
                                    "relay websocket closed: {err}"
                                );
                            }
                            _ => warn!(
                                target = "heartlink::signaling",
                                "relay websocket error: {err}"
                            ),
                        }
                        break;
                    }
                };
                let message = match heartlink_proto::decode_server(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(
                            target = "heartlink::signaling",
                            "unreadable relay message: {err}"
                        );
                        continue;
                    }
                };
                trace!(target = "heartlink::signaling", message = ?message, "ws_in");
                if let ServerMessage::UserId { id } = &message {
                    if let Some(tx) = id_tx.take() {
                        let _ = tx.send(id.clone());
                    }
                }
                resolve_join(&reader_join, &message);
                if inbound_tx.send(message).is_err() {
                    trace!(target = "heartlink::signaling", "inbound stream dropped");
                }
            }
            // Fails any join still waiting for a reply.
            reader_join.lock().take();
            debug!(target = "heartlink::signaling", "relay reader ended");
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let tasks = vec![writer_handle, reader_handle, heartbeat_handle];
        let endpoint_id = match timeout(HANDSHAKE_TIMEOUT, id_rx).await {
            Ok(Ok(id)) => id,
            Ok(Err(_)) | Err(_) => {
                for task in &tasks {
                    task.abort();
                }
                return Err(EngineError::Signaling(
                    "relay did not assign an endpoint id".into(),
                ));
            }
        };
        debug!(
            target = "heartlink::signaling",
            endpoint = %endpoint_id,
            "relay assigned endpoint id"
        );

        Ok(Arc::new(SignalingClient {
            endpoint_id,
            send_tx,
            inbound_rx: AsyncMutex::new(Some(inbound_rx)),
            pending_join,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    /// Sender for envelopes bound for the relay; hand it to the engine.
    pub fn outbound(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.send_tx.clone()
    }

    /// Stream of relay messages, starting with the endpoint id. Can be
    /// taken once.
    pub async fn inbound(&self) -> Result<mpsc::UnboundedReceiver<ServerMessage>, EngineError> {
        self.inbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::Signaling("inbound stream already taken".into()))
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), EngineError> {
        self.send_tx
            .send(message)
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Joins `room` and waits for the relay's verdict.
    pub async fn join(&self, room: &str) -> Result<SessionAssignment, EngineError> {
        let (reply, rx) = oneshot::channel();
        *self.pending_join.lock() = Some(reply);
        self.send(ClientMessage::Join {
            room: room.to_string(),
        })?;
        debug!(target = "heartlink::signaling", room, "sent join");
        match timeout(HANDSHAKE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::ChannelClosed),
            Err(_) => Err(EngineError::Signaling(format!(
                "no reply to join of room {room}"
            ))),
        }
    }

    pub fn leave(&self) -> Result<(), EngineError> {
        self.send(ClientMessage::Leave)
    }

    /// Stops the connection's tasks; the relay sees a disconnect.
    pub fn close(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve_join(pending: &Mutex<Option<JoinReply>>, message: &ServerMessage) {
    let result = match message {
        ServerMessage::SessionInfo {
            session_id,
            role,
            status,
        } => Ok(SessionAssignment {
            session_id: session_id.clone(),
            role: *role,
            status: *status,
        }),
        ServerMessage::SessionError { error, message } => Err(match error {
            SessionErrorKind::SessionFull => EngineError::SessionFull(message.clone()),
            SessionErrorKind::AlreadySeated => EngineError::JoinRejected(message.clone()),
        }),
        _ => return,
    };
    if let Some(reply) = pending.lock().take() {
        let _ = reply.send(result);
    }
}

/// Accepts `ws(s)://` or `http(s)://` relay addresses, with or without the
/// trailing `/ws`.
fn websocket_url(relay_url: &str) -> Result<Url, EngineError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| EngineError::Signaling(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(EngineError::Signaling(format!(
                "unsupported relay scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| EngineError::Signaling("invalid websocket scheme".into()))?;
    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with("/ws") {
        url.set_path(&format!("{path}/ws"));
    }
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn relay_url_gets_ws_path() {
        assert_eq!(
            websocket_url("http://localhost:8765").unwrap().as_str(),
            "ws://localhost:8765/ws"
        );
        assert_eq!(
            websocket_url("wss://relay.example/base/").unwrap().as_str(),
            "wss://relay.example/base/ws"
        );
        assert_eq!(
            websocket_url("ws://127.0.0.1:9/ws").unwrap().as_str(),
            "ws://127.0.0.1:9/ws"
        );
        assert!(websocket_url("ftp://x").is_err());
    }

    #[test_timeout::timeout]
    fn session_full_fails_pending_join() {
        let pending = Mutex::new(None);
        let (reply, mut rx) = oneshot::channel();
        *pending.lock() = Some(reply);

        resolve_join(&pending, &ServerMessage::Pong);
        assert!(pending.lock().is_some());

        resolve_join(
            &pending,
            &ServerMessage::SessionError {
                error: SessionErrorKind::SessionFull,
                message: "room r is full".into(),
            },
        );
        assert!(matches!(
            rx.try_recv(),
            Ok(Err(EngineError::SessionFull(message))) if message.contains("full")
        ));
    }
}
