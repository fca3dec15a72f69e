//! Client configuration: TOML file with defaults, overridden by environment.
//!
//! ```toml
//! ws_url = "wss://ws.justjio.example/ws"
//! api_url = "https://api.justjio.example"
//! token_file = "~/.justjio/token"
//!
//! [reconnect]
//! mode = "backoff"
//! initial_ms = 500
//! max_ms = 30000
//! max_retries = 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

pub const ENV_WS_URL: &str = "JUSTJIO_WS_URL";
pub const ENV_API_URL: &str = "JUSTJIO_API_URL";
pub const ENV_TOKEN: &str = "JUSTJIO_TOKEN";
pub const ENV_TOKEN_FILE: &str = "JUSTJIO_TOKEN_FILE";

/// Liveness poll interval used when nothing else is configured.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// How the connection manager recovers a dropped socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Check the socket every `interval_ms` and reopen it if closed. Never gives up.
    Poll {
        #[serde(default = "default_poll_interval_ms")]
        interval_ms: u64,
    },
    /// Reopen as soon as the socket closes, doubling the delay from
    /// `initial_ms` up to `max_ms`. After `max_retries` consecutive failures
    /// the connection is reported lost.
    Backoff {
        initial_ms: u64,
        max_ms: u64,
        max_retries: u32,
    },
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Poll { interval_ms: DEFAULT_POLL_INTERVAL_MS }
    }
}

impl ReconnectPolicy {
    pub fn poll(interval: Duration) -> Self {
        ReconnectPolicy::Poll { interval_ms: interval.as_millis() as u64 }
    }

    pub fn backoff(initial: Duration, max: Duration, max_retries: u32) -> Self {
        ReconnectPolicy::Backoff {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            max_retries,
        }
    }

    /// Base delay before reconnect attempt number `attempt` (1-based), without jitter.
    ///
    /// Poll mode always waits one interval.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            ReconnectPolicy::Poll { interval_ms } => Duration::from_millis(*interval_ms),
            ReconnectPolicy::Backoff { initial_ms, max_ms, .. } => {
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(initial_ms.saturating_mul(factor).min(*max_ms))
            }
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        match self {
            ReconnectPolicy::Poll { .. } => true,
            ReconnectPolicy::Backoff { max_retries, .. } => failures < *max_retries,
        }
    }
}

/// Full client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Streaming endpoint; the bearer token is appended as `?token=`.
    pub ws_url: String,
    /// Base URL of the REST API.
    pub api_url: String,
    /// Inline access token. Normally supplied through the environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// File holding the access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8081/ws".to_string(),
            api_url: "http://localhost:8080".to_string(),
            token: None,
            token_file: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 15_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from `path` (when given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from an environment lookup. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get(ENV_WS_URL) {
            self.ws_url = v;
        }
        if let Some(v) = get(ENV_API_URL) {
            self.api_url = v;
        }
        if let Some(v) = get(ENV_TOKEN) {
            self.token = Some(v);
        }
        if let Some(v) = get(ENV_TOKEN_FILE) {
            self.token_file = Some(PathBuf::from(v));
        }
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_policy_polls_every_five_seconds() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.reconnect, ReconnectPolicy::Poll { interval_ms: 5_000 });
        assert_eq!(cfg.reconnect.delay_for(1), Duration::from_secs(5));
        assert_eq!(cfg.reconnect.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn poll_policy_never_gives_up() {
        assert!(ReconnectPolicy::default().allows_retry(u32::MAX - 1));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = ReconnectPolicy::backoff(Duration::from_millis(100), Duration::from_millis(1_000), 5);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(64), Duration::from_millis(1_000));
    }

    #[test]
    fn backoff_respects_retry_cap() {
        let p = ReconnectPolicy::backoff(Duration::from_millis(1), Duration::from_millis(2), 3);
        assert!(p.allows_retry(0));
        assert!(p.allows_retry(2));
        assert!(!p.allows_retry(3));
    }

    #[test]
    fn toml_partial_keeps_defaults() {
        let cfg = ClientConfig::from_toml_str(r#"ws_url = "wss://ws.example/ws""#).unwrap();
        assert_eq!(cfg.ws_url, "wss://ws.example/ws");
        assert_eq!(cfg.api_url, ClientConfig::default().api_url);
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn toml_backoff_section() {
        let cfg = ClientConfig::from_toml_str(
            r#"
            [reconnect]
            mode = "backoff"
            initial_ms = 250
            max_ms = 8000
            max_retries = 4
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.reconnect,
            ReconnectPolicy::Backoff { initial_ms: 250, max_ms: 8000, max_retries: 4 }
        );
    }

    #[test]
    fn toml_poll_section_without_interval_uses_default() {
        let cfg = ClientConfig::from_toml_str("[reconnect]\nmode = \"poll\"\n").unwrap();
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn toml_rejects_unknown_mode() {
        assert!(ClientConfig::from_toml_str("[reconnect]\nmode = \"yolo\"\n").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_WS_URL, "ws://env/ws"),
            (ENV_TOKEN, "abc"),
            (ENV_API_URL, "  "),
        ]
        .into_iter()
        .collect();
        let mut cfg = ClientConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.ws_url, "ws://env/ws");
        assert_eq!(cfg.token.as_deref(), Some("abc"));
        // blank values are ignored
        assert_eq!(cfg.api_url, ClientConfig::default().api_url);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("justjio.toml");
        std::fs::write(&path, "api_url = \"http://api.test\"\nrequest_timeout_ms = 250\n").unwrap();
        let cfg = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.request_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = ClientConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, crate::error::ClientError::Io(_)));
    }

    #[test]
    fn builder_setters() {
        let cfg = ClientConfig::default()
            .with_ws_url("ws://a")
            .with_api_url("http://b")
            .with_token("t")
            .with_connect_timeout(Duration::from_secs(2))
            .with_reconnect(ReconnectPolicy::poll(Duration::from_millis(50)));
        assert_eq!(cfg.ws_url, "ws://a");
        assert_eq!(cfg.api_url, "http://b");
        assert_eq!(cfg.token.as_deref(), Some("t"));
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.reconnect.delay_for(1), Duration::from_millis(50));
    }
}
