//! Configuration types for the RTC engine

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Main configuration shared by the signaling channel and the peer session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    /// Room signaling endpoint URL (ws:// or wss://)
    pub signaling_url: String,

    /// Authentication token appended to the signaling URL as a query
    /// parameter. Without a token the channel will not attempt to connect.
    pub auth_token: Option<String>,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Reconnection policy for the signaling transport
    pub reconnect: ReconnectPolicy,

    /// Heartbeat interval while joined to a room, in seconds (default: 30)
    pub heartbeat_interval_secs: u64,

    /// Delay before re-sending the join request after a reconnect, in
    /// milliseconds (default: 1000). Gives the server time to clean up the
    /// prior session.
    pub rejoin_delay_ms: u64,

    /// Maximum number of buffered unrouted `webrtc_*` envelopes (default: 50)
    pub buffer_capacity: usize,

    /// Age after which a buffered envelope is evicted, in seconds
    /// (default: 300)
    pub buffer_ttl_secs: u64,

    /// Interval between buffer janitor sweeps, in seconds (default: 60)
    pub sweep_interval_secs: u64,

    /// Handler-list length above which the janitor logs a leak warning
    /// (default: 10). Diagnostic only, never enforced.
    pub handler_warn_threshold: usize,

    /// Constraints applied when opening the local capture stream
    pub capture: CaptureConstraints,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Reconnection policy for the signaling transport
///
/// Backoff is linear: the delay before attempt *n* is `delay_base_ms * n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum number of automatic reconnection attempts (default: 5)
    pub max_attempts: u32,

    /// Base delay in milliseconds, multiplied by the attempt number
    /// (default: 1000)
    pub delay_base_ms: u64,
}

impl ReconnectPolicy {
    /// Delay to wait before the given attempt (1-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_base_ms.saturating_mul(attempt as u64))
    }

    /// Check if another automatic attempt is allowed
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_base_ms: 1000,
        }
    }
}

/// Capture constraints for the local microphone stream
///
/// Mirrors the audio processing toggles of the platform capture API. No
/// video is ever requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Enable acoustic echo cancellation (default: true)
    pub echo_cancellation: bool,

    /// Enable noise suppression (default: true)
    pub noise_suppression: bool,

    /// Enable automatic gain control (default: true)
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            signaling_url: "wss://localhost:8443/ws/rooms".to_string(),
            auth_token: None,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval_secs: 30,
            rejoin_delay_ms: 1000,
            buffer_capacity: 50,
            buffer_ttl_secs: 300,
            sweep_interval_secs: 60,
            handler_warn_threshold: 10,
            capture: CaptureConstraints::default(),
        }
    }
}

impl RtcConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if the signaling URL is not a ws/wss URL, no STUN
    /// server is configured, or a bound/interval is zero.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.signaling_url)
            .map_err(|e| Error::InvalidConfig(format!("signaling_url: {}", e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must be ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one STUN server is required".to_string(),
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.buffer_capacity == 0 {
            return Err(Error::InvalidConfig(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }

        if self.heartbeat_interval_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat and sweep intervals must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Buffered-envelope TTL as a [`Duration`]
    pub fn buffer_ttl(&self) -> Duration {
        Duration::from_secs(self.buffer_ttl_secs)
    }

    /// Janitor sweep interval as a [`Duration`]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Heartbeat interval as a [`Duration`]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Rejoin delay as a [`Duration`]
    pub fn rejoin_delay(&self) -> Duration {
        Duration::from_millis(self.rejoin_delay_ms)
    }

    /// Build the connection URL with the auth token attached, or `None`
    /// when no token is available.
    pub fn connection_url(&self) -> Option<Url> {
        let token = self.auth_token.as_deref()?;
        let mut url = Url::parse(&self.signaling_url).ok()?;
        url.query_pairs_mut().append_pair("token", token);
        Some(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RtcConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_ws_url() {
        let config = RtcConfig {
            signaling_url: "https://example.com/ws/rooms".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_stun_list() {
        let config = RtcConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_linear_backoff() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            delay_base_ms: 1000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(5000));
    }

    #[test]
    fn test_should_retry_bound() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            delay_base_ms: 1000,
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn test_connection_url_requires_token() {
        let mut config = RtcConfig::default();
        assert!(config.connection_url().is_none());

        config.auth_token = Some("abc 123".to_string());
        let url = config.connection_url().unwrap();
        assert!(url.query().unwrap().contains("token=abc+123"));
    }
}
