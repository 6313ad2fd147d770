use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use heartlink_proto::{ClientMessage, ServerMessage};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "heartlink-road")]
#[command(about = "HeartLink signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Interface to bind (overrides HEARTLINK_ROAD_BIND)
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on (overrides HEARTLINK_ROAD_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Heartbeat timeout in seconds (overrides HEARTLINK_HEARTBEAT_TIMEOUT)
    #[arg(long)]
    pub heartbeat_timeout: Option<u64>,
}

impl Cli {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.heartbeat_timeout {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room and print every relay message until interrupted
    Probe {
        /// Relay URL (e.g., ws://localhost:8765)
        #[arg(short, long, default_value = "ws://localhost:8765")]
        url: String,

        /// Room to join
        #[arg(short, long, default_value = "matchmaking")]
        room: String,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

pub async fn run_probe(url: String, room: String, seconds: Option<u64>) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => return Err(anyhow::anyhow!("Connection to {} timed out", ws_url)),
    };
    let (mut write, mut read) = ws_stream.split();

    let join = heartlink_proto::encode(&ClientMessage::Join { room })?;
    write.send(Message::Text(join.into())).await?;

    let listen = async {
        while let Some(frame) = read.next().await {
            match frame? {
                Message::Text(text) => match heartlink_proto::decode_server(&text) {
                    Ok(message) => print_message(&message),
                    Err(err) => println!("unparsed: {text} ({err})"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    match seconds {
        Some(secs) => match timeout(Duration::from_secs(secs), listen).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        },
        None => listen.await,
    }
}

fn print_message(message: &ServerMessage) {
    match message {
        ServerMessage::UserId { id } => println!("connected as {id}"),
        ServerMessage::SessionInfo {
            session_id,
            role,
            status,
        } => println!("session {session_id}: role {role}, status {status:?}"),
        ServerMessage::SessionError { message, .. } => println!("join rejected: {message}"),
        ServerMessage::UserJoined { id } => println!("peer joined: {id}"),
        ServerMessage::UserLeft { id } => println!("peer left: {id}"),
        other => println!("{other:?}"),
    }
}
