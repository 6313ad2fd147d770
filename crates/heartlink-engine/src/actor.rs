//! Runs a [`NegotiationEngine`] on its own task.
//!
//! Relay messages, peer-connection callbacks and user commands are all
//! funnelled into one `select!` loop, so at most one engine step is ever in
//! progress and an offer is fully answered before the next message is read.

use heartlink_proto::{EndpointId, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::NegotiationEngine;
use crate::error::EngineError;
use crate::media::LocalTrack;
use crate::state::EngineStatus;

enum Command {
    AcquireMedia {
        want_video: bool,
        reply: oneshot::Sender<Result<Vec<LocalTrack>, EngineError>>,
    },
    StartCall {
        remote: Option<EndpointId>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    EnableVideo {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    DisableVideo {
        reply: oneshot::Sender<bool>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    HangUp {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown,
}

/// Cloneable handle for driving a spawned engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    pub async fn acquire_local_media(
        &self,
        want_video: bool,
    ) -> Result<Vec<LocalTrack>, EngineError> {
        self.request(|reply| Command::AcquireMedia { want_video, reply })
            .await?
    }

    /// Calls `remote`, or the peer announced by the relay when `None`.
    pub async fn start_call(&self, remote: Option<EndpointId>) -> Result<(), EngineError> {
        self.request(|reply| Command::StartCall { remote, reply })
            .await?
    }

    pub async fn enable_video(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::EnableVideo { reply }).await?
    }

    pub async fn disable_video(&self) -> Result<bool, EngineError> {
        self.request(|reply| Command::DisableVideo { reply }).await
    }

    pub async fn toggle_video(&self) -> Result<bool, EngineError> {
        self.request(|reply| Command::ToggleVideo { reply }).await?
    }

    pub async fn hang_up(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stops media, ends the call and exits the engine task.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Spawns `engine`, feeding it relay messages from `signals`. The task ends
/// on shutdown, when every handle is dropped, or when the relay stream
/// closes; it always runs [`NegotiationEngine::cleanup`] on the way out.
pub fn spawn_engine(
    engine: NegotiationEngine,
    signals: mpsc::UnboundedReceiver<ServerMessage>,
) -> (EngineHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(32);
    let task = tokio::spawn(run(engine, signals, commands_rx));
    (
        EngineHandle {
            commands: commands_tx,
        },
        task,
    )
}

async fn run(
    mut engine: NegotiationEngine,
    mut signals: mpsc::UnboundedReceiver<ServerMessage>,
    mut commands: mpsc::Receiver<Command>,
) {
    loop {
        tokio::select! {
            biased;
            Some(event) = engine.next_peer_event() => engine.handle_peer_event(event).await,
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => execute(&mut engine, command).await,
            },
            signal = signals.recv() => match signal {
                Some(message) => engine.handle_server_message(message).await,
                None => {
                    info!(target = "heartlink::engine", "relay stream closed");
                    break;
                }
            },
        }
    }
    engine.cleanup().await;
    debug!(target = "heartlink::engine", "engine task stopped");
}

async fn execute(engine: &mut NegotiationEngine, command: Command) {
    // Reply failures mean the caller stopped waiting.
    match command {
        Command::AcquireMedia { want_video, reply } => {
            let _ = reply.send(engine.acquire_local_media(want_video).await);
        }
        Command::StartCall { remote, reply } => {
            let result = match remote {
                Some(remote) => engine.start_call(remote).await,
                None => engine.call_remote().await,
            };
            let _ = reply.send(result);
        }
        Command::EnableVideo { reply } => {
            let _ = reply.send(engine.enable_video().await);
        }
        Command::DisableVideo { reply } => {
            let _ = reply.send(engine.disable_video());
        }
        Command::ToggleVideo { reply } => {
            let _ = reply.send(engine.toggle_video().await);
        }
        Command::HangUp { reply } => {
            engine.hang_up().await;
            let _ = reply.send(());
        }
        Command::Status { reply } => {
            let _ = reply.send(engine.status());
        }
        Command::Shutdown => {}
    }
}
