//! Configuration types for call establishment

use crate::error::{CallError, CallResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a call orchestrator
///
/// Defines where sessions live in the signaling store, the STUN/TURN servers
/// handed to the peer connection, and the timing of retries and timeouts.
/// TURN credentials are always injected (file, environment, or CLI), never
/// compiled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Root segment of every session node (`/<root>/<conversation>/calls`)
    pub session_root: String,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN servers, including TCP/TLS fallbacks for restrictive networks
    pub turn_servers: Vec<TurnServer>,

    /// Which candidates ICE may use
    pub ice_transport_policy: IceTransportPolicy,

    /// How long a caller waits in PENDING before giving up (None = forever)
    pub answer_timeout_ms: Option<u64>,

    /// Extra attempts for idempotent writes (status, error, sdp overwrite)
    pub publish_retries: u32,

    /// Backoff step between write attempts (multiplied by the attempt number)
    pub publish_retry_backoff_ms: u64,

    /// Re-subscriptions allowed per path after transport errors
    pub max_resubscribe_attempts: u32,

    /// Delay before re-subscribing
    pub resubscribe_backoff_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            session_root: "sessions".to_string(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: vec![],
            ice_transport_policy: IceTransportPolicy::All,
            answer_timeout_ms: Some(45_000),
            publish_retries: 3,
            publish_retry_backoff_ms: 250,
            max_resubscribe_attempts: 3,
            resubscribe_backoff_ms: 500,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    /// `turn:` / `turns:` URLs, e.g. `turn:relay.example.com:443?transport=tcp`
    pub urls: Vec<String>,
    /// Username
    pub username: String,
    /// Credential
    pub credential: String,
}

/// ICE candidate policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// Host, server-reflexive and relay candidates
    All,
    /// Relay candidates only
    Relay,
}

impl CallConfig {
    /// Load from a TOML file; missing fields take their defaults
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Create config from environment variables on top of the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `CALLRTC_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("CALLRTC_SESSION_ROOT") {
            if !root.is_empty() {
                self.session_root = root;
            }
        }

        if let Ok(stun) = std::env::var("CALLRTC_STUN_URLS") {
            self.stun_servers = split_list(&stun);
        }

        if let (Ok(urls), Ok(username), Ok(credential)) = (
            std::env::var("CALLRTC_TURN_URLS"),
            std::env::var("CALLRTC_TURN_USERNAME"),
            std::env::var("CALLRTC_TURN_CREDENTIAL"),
        ) {
            self.turn_servers.push(TurnServer {
                urls: split_list(&urls),
                username,
                credential,
            });
        }

        if let Ok(relay) = std::env::var("CALLRTC_FORCE_RELAY") {
            if relay == "1" || relay.eq_ignore_ascii_case("true") {
                self.ice_transport_policy = IceTransportPolicy::Relay;
            }
        }

        if let Ok(timeout) = std::env::var("CALLRTC_ANSWER_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                self.answer_timeout_ms = if val == 0 { None } else { Some(val) };
            }
        }
    }

    /// Answer timeout as a duration
    pub fn answer_timeout(&self) -> Option<Duration> {
        self.answer_timeout_ms.map(Duration::from_millis)
    }

    /// Backoff before write attempt number `attempt` (1-based)
    pub fn publish_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.publish_retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Delay before re-subscribing
    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> CallResult<()> {
        if self.session_root.trim_matches('/').is_empty() {
            return Err(CallError::validation("session_root", "must not be empty"));
        }

        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(CallError::validation(
                "ice_servers",
                "at least one STUN or TURN server is required",
            ));
        }

        for (i, turn) in self.turn_servers.iter().enumerate() {
            if turn.urls.is_empty() {
                return Err(CallError::validation(
                    format!("turn_servers[{}].urls", i),
                    "must list at least one URL",
                ));
            }
            if turn.username.is_empty() || turn.credential.is_empty() {
                return Err(CallError::validation(
                    format!("turn_servers[{}]", i),
                    "TURN servers need a username and credential",
                ));
            }
        }

        if self.ice_transport_policy == IceTransportPolicy::Relay && self.turn_servers.is_empty() {
            return Err(CallError::validation(
                "ice_transport_policy",
                "relay-only policy requires a TURN server",
            ));
        }

        if self.publish_retry_backoff_ms == 0 || self.resubscribe_backoff_ms == 0 {
            return Err(CallError::validation("backoff", "backoff must be > 0"));
        }

        if self.answer_timeout_ms == Some(0) {
            return Err(CallError::validation(
                "answer_timeout_ms",
                "use no value to disable the timeout",
            ));
        }

        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.answer_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.publish_backoff(2), Duration::from_millis(500));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = CallConfig::default();
        config.stun_servers.clear();
        assert!(config.validate().is_err());

        let mut config = CallConfig::default();
        config.turn_servers.push(TurnServer {
            urls: vec!["turn:relay.example.com:3478".into()],
            username: String::new(),
            credential: "secret".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(CallError::Validation { .. })
        ));

        let mut config = CallConfig::default();
        config.ice_transport_policy = IceTransportPolicy::Relay;
        assert!(config.validate().is_err());

        let mut config = CallConfig::default();
        config.answer_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
session_root = "calls-test"
answer_timeout_ms = 10000
ice_transport_policy = "relay"

[[turn_servers]]
urls = ["turn:relay.example.com:3478", "turns:relay.example.com:443?transport=tcp"]
username = "user"
credential = "pass"
"#
        )
        .unwrap();

        let config = CallConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.session_root, "calls-test");
        assert_eq!(config.answer_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.ice_transport_policy, IceTransportPolicy::Relay);
        assert_eq!(config.turn_servers[0].urls.len(), 2);
        // Unspecified fields keep defaults
        assert_eq!(config.publish_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = CallConfig::from_toml_file(Path::new("/nonexistent/callrtc.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(" stun:a:1, ,stun:b:2 "),
            vec!["stun:a:1".to_string(), "stun:b:2".to_string()]
        );
    }
}
