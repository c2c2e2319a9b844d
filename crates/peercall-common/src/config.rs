//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call peercall_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("relay.host", "0.0.0.0")?
        .set_default("relay.port", 8080)?
        .set_default("relay.max_frame_bytes", 64 * 1024)?
        .set_default("relay.outbox_capacity", 128)?
        .set_default("call.relay_url", "ws://localhost:8080/ws")?
        .set_default("call.candidate_buffer_capacity", 256)?
        .set_default("call.early_candidate_window_ms", 5000)?
        .set_default("call.negotiation_timeout_secs", 30)?
        .set_default("call.auto_accept_delay_ms", 2000)?
        .set_default("call.audio", true)?
        .set_default("call.video", true)?
        .set_default("call.rtc_bind", "127.0.0.1:0")?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (PEERCALL__RELAY__PORT, PEERCALL__CALL__RELAY_URL, etc.)
        .add_source(
            config::Environment::with_prefix("PEERCALL")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub relay: RelayConfig,
    pub call: CallConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Text frames larger than this are dropped without parsing.
    pub max_frame_bytes: usize,
    /// Queued outbound frames per connection before forwarding starts dropping.
    pub outbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_frame_bytes: 64 * 1024,
            outbox_capacity: 128,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallConfig {
    /// WebSocket URL of the signaling relay.
    pub relay_url: String,
    /// Early candidates kept per endpoint; the oldest is dropped on overflow.
    pub candidate_buffer_capacity: usize,
    /// How long a candidate may precede the offer it belongs to. Older ones
    /// are treated as leftovers of a previous call.
    pub early_candidate_window_ms: u64,
    /// Seconds a call may take to become active. 0 disables the deadline.
    pub negotiation_timeout_secs: u64,
    /// Delay before an incoming call is answered automatically by the CLI endpoint.
    pub auto_accept_delay_ms: u64,
    pub audio: bool,
    pub video: bool,
    /// Local UDP address the transport engine binds to.
    pub rtc_bind: String,
}

impl CallConfig {
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        (self.negotiation_timeout_secs > 0)
            .then(|| Duration::from_secs(self.negotiation_timeout_secs))
    }

    pub fn early_candidate_window(&self) -> Duration {
        Duration::from_millis(self.early_candidate_window_ms)
    }

    pub fn auto_accept_delay(&self) -> Duration {
        Duration::from_millis(self.auto_accept_delay_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8080/ws".into(),
            candidate_buffer_capacity: 256,
            early_candidate_window_ms: 5000,
            negotiation_timeout_secs: 30,
            auto_accept_delay_ms: 2000,
            audio: true,
            video: true,
            rtc_bind: "127.0.0.1:0".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_disables_deadline() {
        let mut cfg = CallConfig::default();
        assert_eq!(cfg.negotiation_timeout(), Some(Duration::from_secs(30)));
        cfg.negotiation_timeout_secs = 0;
        assert_eq!(cfg.negotiation_timeout(), None);
    }
}
