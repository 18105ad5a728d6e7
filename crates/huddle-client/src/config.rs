use huddle_protocol::{IceServer, IceTransportPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::signaling::RetryPolicy;

/// Engine configuration.
///
/// Loaded from an optional `huddle.toml` and `HUDDLE_*` environment
/// variables; nested keys use a double underscore (`HUDDLE_RETRY__RETRIES`).
/// Values left unset fall back to the token's claims or built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Overrides the signaling URL carried in the token
    pub signaling_url: Option<String>,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Replaces the token's ICE servers when non-empty
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: Option<IceTransportPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signaling_url: None,
            request_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            ice_servers: Vec::new(),
            ice_transport_policy: None,
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        Self::load_from("huddle")
    }

    /// Load from `<name>.toml` (optional) overlaid with the environment
    pub fn load_from(name: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(name).required(false))
            .add_source(config::Environment::with_prefix("HUDDLE").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn from_toml(toml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry.retries, 10);
        assert!(config.signaling_url.is_none());
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = EngineConfig::from_toml(
            r#"
            signaling_url = "wss://sfu.example.com/ws"
            request_timeout_ms = 2500
            ice_transport_policy = "relay"

            [retry]
            retries = 3

            [[ice_servers]]
            urls = "turn:turn.example.com:3478"
            username = "u"
            credential = "p"
            "#,
        )
        .unwrap();

        assert_eq!(config.signaling_url.as_deref(), Some("wss://sfu.example.com/ws"));
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.retry.retries, 3);
        assert_eq!(config.retry.min_timeout_ms, 1000);
        assert_eq!(config.ice_transport_policy, Some(IceTransportPolicy::Relay));
        assert_eq!(config.ice_servers[0].urls, vec!["turn:turn.example.com:3478"]);
    }

    #[test]
    fn test_missing_file_is_fine() {
        let config = EngineConfig::load_from("does-not-exist-huddle").unwrap();
        assert_eq!(config.retry.factor, 1.5);
    }
}
