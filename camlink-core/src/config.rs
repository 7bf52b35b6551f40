use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::logging::{parse_log_level, LogFormat};
use crate::types::Protocol;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub adaptive: ReconnectPolicy,
    pub negotiated: ReconnectPolicy,
    pub hls: HlsConfig,
    pub webrtc: WebRtcConfig,
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json", "pretty" or "compact"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Reconnection policy of one protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Schedule a retry after a failure
    pub auto_reconnect: bool,
    /// Delay between a failure and its retry
    pub reconnect_delay_ms: u64,
    /// Consecutive retries before giving up
    pub max_reconnect_attempts: u32,
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: 3,
        }
    }
}

/// Managed HLS session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    /// Timeout of a single playlist or segment request
    pub request_timeout_ms: u64,
    /// Pause before a session restarts loading after a network error
    pub restart_delay_ms: u64,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            restart_delay_ms: 1000,
        }
    }
}

/// Peer session and signalling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
    /// Timeout of the offer/answer HTTP round trip
    pub negotiation_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            negotiation_timeout_ms: 10_000,
        }
    }
}

/// A feed to open at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Playback locator
    pub key: String,
    /// Detected from the locator when unset
    #[serde(default)]
    pub protocol: Option<Protocol>,
}

impl FeedConfig {
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol.unwrap_or_else(|| Protocol::detect(&self.key))
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority order:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // Load config file if provided
        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (CAMLINK__ADAPTIVE__RECONNECT_DELAY_MS, etc.)
        builder = builder.add_source(
            Environment::with_prefix("CAMLINK")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Reconnect policies of both protocols
    #[must_use]
    pub const fn policies(&self) -> StreamPolicies {
        StreamPolicies {
            adaptive: self.adaptive,
            negotiated: self.negotiated,
        }
    }

    /// Validate configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        if let Err(e) = self.logging.format.parse::<LogFormat>() {
            errors.push(format!("logging.format: {e}"));
        }

        for (name, policy) in [("adaptive", &self.adaptive), ("negotiated", &self.negotiated)] {
            if policy.auto_reconnect && policy.reconnect_delay_ms == 0 {
                errors.push(format!("{name}.reconnect_delay_ms must be greater than 0"));
            }
        }

        if self.hls.request_timeout_ms == 0 {
            errors.push("hls.request_timeout_ms must be greater than 0".to_string());
        }
        if self.webrtc.negotiation_timeout_ms == 0 {
            errors.push("webrtc.negotiation_timeout_ms must be greater than 0".to_string());
        }

        for feed in &self.feeds {
            if let Err(e) = url::Url::parse(&feed.key) {
                errors.push(format!("feeds: invalid locator '{}': {e}", feed.key));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Reconnect policies of both protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamPolicies {
    pub adaptive: ReconnectPolicy,
    pub negotiated: ReconnectPolicy,
}

/// Process-wide reconnect policies, changeable while streams run
///
/// Engines read the policy when they make a reconnect decision, so an update
/// applies to the next decision and never to a retry already scheduled.
#[derive(Debug, Default)]
pub struct PolicyStore {
    adaptive: RwLock<ReconnectPolicy>,
    negotiated: RwLock<ReconnectPolicy>,
}

impl PolicyStore {
    #[must_use]
    pub fn new(policies: StreamPolicies) -> Self {
        Self {
            adaptive: RwLock::new(policies.adaptive),
            negotiated: RwLock::new(policies.negotiated),
        }
    }

    #[must_use]
    pub fn get(&self, protocol: Protocol) -> ReconnectPolicy {
        *self.slot(protocol).read()
    }

    pub fn set(&self, protocol: Protocol, policy: ReconnectPolicy) {
        *self.slot(protocol).write() = policy;
    }

    /// Modify one protocol's policy in place
    pub fn update(&self, protocol: Protocol, f: impl FnOnce(&mut ReconnectPolicy)) {
        f(&mut self.slot(protocol).write());
    }

    const fn slot(&self, protocol: Protocol) -> &RwLock<ReconnectPolicy> {
        match protocol {
            Protocol::Adaptive => &self.adaptive,
            Protocol::Negotiated => &self.negotiated,
        }
    }
}
