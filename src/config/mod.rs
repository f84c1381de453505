use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub url: String,
}

/// How a broadcast reaches clients.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastMode {
    /// Copies go only to clients subscribed through the sending process.
    Local,
    /// One canonical copy on the broadcast channel, which every process listens to.
    Shared,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub history_key: String,
    pub history_size: usize,
    pub poll_timeout_ms: u64,
    pub broadcast_mode: BroadcastMode,
}

impl RelayConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history_key: "messages".to_string(),
            history_size: 50,
            poll_timeout_ms: 1000,
            broadcast_mode: BroadcastMode::Shared,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub websocket: WebSocketConfig,
    pub broker: BrokerConfig,
    pub relay: RelayConfig,
    pub cors: CorsConfig,
    pub log: LogConfig,
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("environment", "development")?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8000)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("websocket.host", "127.0.0.1")?
        .set_default("websocket.port", 8001)?
        .set_default("broker.kind", "redis")?
        .set_default("broker.url", "redis://127.0.0.1:6379")?
        .set_default("relay.history_key", "messages")?
        .set_default("relay.history_size", 50)?
        .set_default("relay.poll_timeout_ms", 1000)?
        .set_default("relay.broadcast_mode", "shared")?
        .set_default("cors.enabled", true)?
        .set_default("cors.allow_any_origin", true)?
        .set_default("cors.max_age", 3600)?
        .set_default("log.level", "info")
}

fn env_source() -> Environment {
    // E.g., `APP_BROKER__URL=redis://cache:6379` sets `Settings.broker.url`
    Environment::with_prefix("app")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let settings: Settings = with_defaults(Config::builder())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Settings for tests: in-memory broker, short poll interval, no files.
    pub fn new_for_test() -> Result<Self, ConfigError> {
        let settings: Settings = with_defaults(Config::builder())?
            .set_override("environment", "test")?
            .set_override("server.port", 0)?
            .set_override("websocket.port", 0)?
            .set_override("broker.kind", "memory")?
            .set_override("relay.poll_timeout_ms", 50)?
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.kind == BrokerKind::Redis {
            let url = url::Url::parse(&self.broker.url)
                .map_err(|e| ConfigError::Message(format!("invalid broker.url: {}", e)))?;
            if !matches!(url.scheme(), "redis" | "rediss") {
                return Err(ConfigError::Message(format!(
                    "unsupported broker.url scheme: {}",
                    url.scheme()
                )));
            }
        }
        if self.relay.history_size == 0 {
            return Err(ConfigError::Message("relay.history_size must be positive".into()));
        }
        if self.relay.poll_timeout_ms == 0 {
            return Err(ConfigError::Message("relay.poll_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
