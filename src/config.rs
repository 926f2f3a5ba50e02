use crate::chat::Limits;
use crate::error::{ConfigError, Result as AppResult};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    /// Port the downstream line server listens on.
    pub port: u16,
    /// Shared password clients must present in PASS. Unset means any
    /// client may connect.
    #[serde(default)]
    pub pass: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub server: String,
    pub port: u16,
}

impl UpstreamConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// Upstream throughput limits as configuration. The server-side values
/// these mirror change occasionally, so operators can override them
/// without a rebuild.
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    pub channels_per_conn: usize,
    pub msgs_per_window: i32,
    pub rate_window_secs: u64,
    pub join_interval_ms: u64,
    pub probe_period_secs: u64,
    pub probe_grace_secs: u64,
    pub send_idle_cutoff_secs: u64,
    pub send_pool_floor: usize,
    pub say_attempts: u32,
}

impl LimitsConfig {
    pub fn to_limits(&self) -> Limits {
        Limits {
            channels_per_conn: self.channels_per_conn,
            msgs_per_window: self.msgs_per_window,
            rate_window: Duration::from_secs(self.rate_window_secs),
            join_interval: Duration::from_millis(self.join_interval_ms),
            probe_period: Duration::from_secs(self.probe_period_secs),
            probe_grace: Duration::from_secs(self.probe_grace_secs),
            send_idle_cutoff: Duration::from_secs(self.send_idle_cutoff_secs),
            send_pool_floor: self.send_pool_floor,
            say_attempts: self.say_attempts,
            ..Limits::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AppSettings {
    pub broker: BrokerConfig,
    pub upstream: UpstreamConfig,
    pub limits: LimitsConfig,
}

pub fn load_settings() -> AppResult<AppSettings> {
    let defaults = Limits::default();
    let builder = Config::builder()
        .add_source(
            Environment::with_prefix("RELAYBROKER")
                .separator("__")
                .try_parsing(true),
        )
        .add_source(File::with_name("config").required(false))
        .set_default("broker.port", 3333)
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default("upstream.server", "irc.chat.twitch.tv")
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default("upstream.port", 6667)
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default("limits.channels_per_conn", defaults.channels_per_conn as u64)
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default("limits.msgs_per_window", defaults.msgs_per_window as i64)
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default("limits.rate_window_secs", defaults.rate_window.as_secs())
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default(
            "limits.join_interval_ms",
            defaults.join_interval.as_millis() as u64,
        )
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default("limits.probe_period_secs", defaults.probe_period.as_secs())
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default("limits.probe_grace_secs", defaults.probe_grace.as_secs())
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default(
            "limits.send_idle_cutoff_secs",
            defaults.send_idle_cutoff.as_secs(),
        )
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default("limits.send_pool_floor", defaults.send_pool_floor as u64)
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .set_default("limits.say_attempts", defaults.say_attempts as u64)
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let settings = builder
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    settings
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()).into())
}
