use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// Connections silent for longer than this are dropped.
    pub heartbeat_timeout: Duration,
    /// How often the heartbeat monitor sweeps.
    pub heartbeat_sweep: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env::var("HEARTLINK_ROAD_BIND").unwrap_or(defaults.bind),
            port: env::var("HEARTLINK_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            heartbeat_timeout: env::var("HEARTLINK_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            heartbeat_sweep: env::var("HEARTLINK_HEARTBEAT_SWEEP")
                .ok()
                .and_then(|t| t.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_sweep),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8765,
            heartbeat_timeout: Duration::from_secs(600), // 10 minutes
            heartbeat_sweep: Duration::from_secs(60),
        }
    }
}
