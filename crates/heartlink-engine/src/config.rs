use std::env;
use std::time::Duration;

/// Tunables for a [`NegotiationEngine`](crate::NegotiationEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// STUN/TURN URLs handed to every new peer connection.
    pub ice_servers: Vec<String>,
    /// Role B places the call as soon as both media and peer are known.
    pub auto_call: bool,
    /// How much local audio is collected into one chunk.
    pub audio_chunk_window: Duration,
    /// Windows with fewer bytes than this are discarded.
    pub min_audio_chunk_bytes: usize,
    /// Chunks buffered for the consumer before new ones are dropped.
    pub audio_chunk_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            auto_call: true,
            audio_chunk_window: Duration::from_secs(2),
            min_audio_chunk_bytes: 2000,
            audio_chunk_capacity: 32,
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by `HEARTLINK_ICE_SERVERS` (comma separated) and
    /// `HEARTLINK_LOCALHOST_ONLY` (drops every ICE server).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(servers) = env::var("HEARTLINK_ICE_SERVERS") {
            config.ice_servers = parse_server_list(&servers);
        }
        if env::var("HEARTLINK_LOCALHOST_ONLY").is_ok() {
            config.ice_servers.clear();
        }
        config
    }

    pub fn localhost_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_auto_call(mut self, auto_call: bool) -> Self {
        self.auto_call = auto_call;
        self
    }

    pub fn with_audio_window(mut self, window: Duration, min_bytes: usize) -> Self {
        self.audio_chunk_window = window;
        self.min_audio_chunk_bytes = min_bytes;
        self
    }
}

fn parse_server_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
