use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ChannelError;
use crate::transport::ConnectTarget;

// =============================================================================
// File config (figment-deserialized from defaults / channel.toml / env vars)
// =============================================================================
//
//   channel.toml:   heartbeat_interval_ms = 15000
//
//   env var:        LIVE_CHANNEL_HEARTBEAT_INTERVAL_MS=15000
//
// Either `url` or `origin` must be set. `origin` is the page origin the
// dashboard is served from; the socket target is derived from it.

/// Path appended to the origin when the target is derived.
pub const DEFAULT_PATH: &str = "/ws";

/// Env var prefix for figment.
pub const ENV_PREFIX: &str = "LIVE_CHANNEL_";

/// Tunables as they appear on disk / in the environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelFileConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// 0 keeps the heartbeat one-way.
    #[serde(default)]
    pub heartbeat_timeout_ms: u64,
    #[serde(default)]
    pub protocols: Vec<String>,
}

impl Default for ChannelFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            origin: None,
            path: default_path(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: 0,
            protocols: Vec::new(),
        }
    }
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

/// Build a figment that layers: defaults → TOML file (if given) → LIVE_CHANNEL_* env vars.
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(ChannelFileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Derive the socket target from the hosting page's origin: `https` origins
/// get `wss`, anything else gets `ws`.
pub fn resolve_target_url(origin: &str, path: &str) -> Result<String, ChannelError> {
    let origin = origin.trim().trim_end_matches('/');
    let (secure, host) = if let Some(host) = origin.strip_prefix("https://") {
        (true, host)
    } else if let Some(host) = origin.strip_prefix("http://") {
        (false, host)
    } else {
        return Err(ChannelError::invalid_url(
            origin,
            "origin must start with http:// or https://",
        ));
    };
    if host.is_empty() || host.contains('/') {
        return Err(ChannelError::invalid_url(origin, "origin must be scheme://host[:port]"));
    }

    let scheme = if secure { "wss" } else { "ws" };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    Ok(format!("{scheme}://{host}{path}"))
}

// =============================================================================
// Runtime config
// =============================================================================

/// Immutable per-client configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub url: String,
    /// 0 disables reconnection.
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Zero disables stale-connection detection. Any inbound frame counts
    /// as traffic, protocol-level pings and pongs included.
    pub heartbeat_timeout: Duration,
    pub protocols: Vec<String>,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        let fc = ChannelFileConfig::default();
        Self {
            url: url.into(),
            max_reconnect_attempts: fc.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(fc.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(fc.reconnect_max_delay_ms),
            heartbeat_interval: Duration::from_millis(fc.heartbeat_interval_ms),
            heartbeat_timeout: Duration::ZERO,
            protocols: Vec::new(),
        }
    }

    /// Resolve a file config. An explicit `url` wins over `origin`.
    pub fn from_file(fc: &ChannelFileConfig) -> Result<Self, ChannelError> {
        let url = match (&fc.url, &fc.origin) {
            (Some(url), _) if !url.trim().is_empty() => url.trim().to_string(),
            (_, Some(origin)) => resolve_target_url(origin, &fc.path)?,
            _ => {
                return Err(ChannelError::Config(
                    "either `url` or `origin` must be set".to_string(),
                ));
            }
        };
        Ok(Self {
            url,
            max_reconnect_attempts: fc.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(fc.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(fc.reconnect_max_delay_ms),
            heartbeat_interval: Duration::from_millis(fc.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(fc.heartbeat_timeout_ms),
            protocols: fc.protocols.clone(),
        })
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn target(&self) -> ConnectTarget {
        ConnectTarget {
            url: self.url.clone(),
            protocols: self.protocols.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let d = ChannelFileConfig::default();
        assert!(d.url.is_none());
        assert_eq!(d.path, "/ws");
        assert_eq!(d.max_reconnect_attempts, 10);
        assert_eq!(d.reconnect_base_delay_ms, 1000);
        assert_eq!(d.reconnect_max_delay_ms, 30_000);
        assert_eq!(d.heartbeat_interval_ms, 30_000);
        assert_eq!(d.heartbeat_timeout_ms, 0);
        assert!(d.protocols.is_empty());
    }

    #[test]
    fn test_channel_config_new_uses_defaults() {
        let c = ChannelConfig::new("ws://localhost:8000/ws");
        assert_eq!(c.max_reconnect_attempts, 10);
        assert_eq!(c.reconnect_base_delay, Duration::from_secs(1));
        assert_eq!(c.reconnect_max_delay, Duration::from_secs(30));
        assert_eq!(c.heartbeat_interval, Duration::from_secs(30));
        assert!(c.heartbeat_timeout.is_zero());
    }

    // ── target resolution ───────────────────────────────────────────────

    #[test]
    fn test_resolve_https_origin_uses_wss() {
        assert_eq!(
            resolve_target_url("https://dash.example.com", "/ws").unwrap(),
            "wss://dash.example.com/ws"
        );
    }

    #[test]
    fn test_resolve_http_origin_uses_ws() {
        assert_eq!(
            resolve_target_url("http://localhost:5173/", "ws").unwrap(),
            "ws://localhost:5173/ws"
        );
    }

    #[test]
    fn test_resolve_rejects_other_schemes() {
        assert!(resolve_target_url("ftp://example.com", "/ws").is_err());
        assert!(resolve_target_url("https://", "/ws").is_err());
        assert!(resolve_target_url("https://a.com/app", "/ws").is_err());
    }

    // ── ChannelConfig::from_file ────────────────────────────────────────

    #[test]
    fn test_from_file_explicit_url_wins() {
        let fc = ChannelFileConfig {
            url: Some("ws://10.0.0.2:9000/events".into()),
            origin: Some("https://dash.example.com".into()),
            ..Default::default()
        };
        let c = ChannelConfig::from_file(&fc).unwrap();
        assert_eq!(c.url, "ws://10.0.0.2:9000/events");
    }

    #[test]
    fn test_from_file_derives_from_origin() {
        let fc = ChannelFileConfig {
            origin: Some("https://dash.example.com".into()),
            heartbeat_interval_ms: 0,
            heartbeat_timeout_ms: 45_000,
            ..Default::default()
        };
        let c = ChannelConfig::from_file(&fc).unwrap();
        assert_eq!(c.url, "wss://dash.example.com/ws");
        assert!(c.heartbeat_interval.is_zero());
        assert_eq!(c.heartbeat_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_from_file_requires_target() {
        let err = ChannelConfig::from_file(&ChannelFileConfig::default()).unwrap_err();
        assert!(matches!(err, ChannelError::Config(_)));
    }

    #[test]
    fn test_target_carries_protocols() {
        let c = ChannelConfig::new("ws://h/ws").with_protocols(vec!["events.v1".into()]);
        let t = c.target();
        assert_eq!(t.url, "ws://h/ws");
        assert_eq!(t.protocols, vec!["events.v1".to_string()]);
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let fc: ChannelFileConfig = load_config(None).extract().unwrap();
        assert_eq!(fc.max_reconnect_attempts, 10);
        assert_eq!(fc.path, "/ws");
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("channel.toml");
        std::fs::write(
            &path,
            "origin = \"http://127.0.0.1:8000\"\nmax_reconnect_attempts = 3\nprotocols = [\"events.v1\"]\n",
        )
        .unwrap();
        let fc: ChannelFileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.origin.as_deref(), Some("http://127.0.0.1:8000"));
        assert_eq!(fc.max_reconnect_attempts, 3);
        assert_eq!(fc.protocols, vec!["events.v1".to_string()]);
        assert_eq!(fc.heartbeat_interval_ms, 30_000);

        let c = ChannelConfig::from_file(&fc).unwrap();
        assert_eq!(c.url, "ws://127.0.0.1:8000/ws");
    }

    #[test]
    fn test_load_config_missing_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: ChannelFileConfig = load_config(Some(&tmp.path().join("absent.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc, ChannelFileConfig::default());
    }
}
