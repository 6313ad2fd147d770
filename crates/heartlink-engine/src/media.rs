use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn video_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Handle to a captured local track. Clones share the enabled flag;
/// toggling it never changes what was negotiated.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Releases the capture device. A stopped track never restarts.
    pub fn stop(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
        self.inner.enabled.store(false, Ordering::SeqCst);
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

/// What a capture backend hands back for one request.
#[derive(Debug)]
pub struct CapturedMedia {
    pub tracks: Vec<LocalTrack>,
    /// Raw encoded audio from the microphone, if the backend exposes it.
    pub audio_frames: Option<mpsc::Receiver<Bytes>>,
}

/// Platform camera and microphone access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<CapturedMedia, MediaError>;
}

/// The engine's local stream: its tracks plus the audio chunking task.
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
    chunker: Option<JoinHandle<()>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks,
            chunker: None,
        }
    }

    pub fn attach_chunker(&mut self, handle: JoinHandle<()>) {
        if let Some(previous) = self.chunker.replace(handle) {
            previous.abort();
        }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn add_track(&mut self, track: LocalTrack) {
        self.tracks.push(track);
    }

    pub fn stop(self) {
        for track in &self.tracks {
            track.stop();
        }
        if let Some(chunker) = self.chunker {
            chunker.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub sequence: u64,
    pub data: Bytes,
}

/// Groups raw audio frames into fixed time windows for a downstream
/// consumer. Delivery never blocks capture: a full consumer loses chunks.
#[derive(Debug)]
pub struct AudioChunker {
    window: Duration,
    min_bytes: usize,
    output: mpsc::Sender<AudioChunk>,
    buffer: BytesMut,
    sequence: u64,
}

impl AudioChunker {
    pub fn new(window: Duration, min_bytes: usize, output: mpsc::Sender<AudioChunk>) -> Self {
        Self {
            window,
            min_bytes,
            output,
            buffer: BytesMut::new(),
            sequence: 0,
        }
    }

    pub fn spawn(self, frames: mpsc::Receiver<Bytes>) -> JoinHandle<()> {
        tokio::spawn(self.run(frames))
    }

    async fn run(mut self, mut frames: mpsc::Receiver<Bytes>) {
        let mut interval = tokio::time::interval(self.window);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => self.buffer.extend_from_slice(&frame),
                    None => {
                        self.flush();
                        debug!(target = "heartlink::media", "audio source ended");
                        return;
                    }
                },
                _ = interval.tick() => {
                    if !self.flush() {
                        return;
                    }
                }
            }
        }
    }

    /// Emits the current window. Returns false once the consumer is gone.
    fn flush(&mut self) -> bool {
        if self.buffer.len() < self.min_bytes {
            if !self.buffer.is_empty() {
                trace!(
                    target = "heartlink::media",
                    bytes = self.buffer.len(),
                    "discarding short audio window"
                );
            }
            self.buffer.clear();
            return true;
        }
        let chunk = AudioChunk {
            sequence: self.sequence,
            data: self.buffer.split().freeze(),
        };
        self.sequence += 1;
        match self.output.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(chunk)) => {
                warn!(
                    target = "heartlink::media",
                    sequence = chunk.sequence,
                    "audio consumer is behind, dropping chunk"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target = "heartlink::media", "audio consumer closed");
                false
            }
        }
    }
}
