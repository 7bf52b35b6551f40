//! Common types used throughout the connection manager

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for one feed: its playback locator
///
/// For adaptive feeds this is the manifest URL, for negotiated feeds the
/// negotiation endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the key as a URL
    pub fn locator(&self) -> Result<url::Url, crate::StreamError> {
        url::Url::parse(&self.0).map_err(|e| crate::StreamError::InvalidLocator {
            locator: self.0.clone(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StreamKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport protocol backing a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Segmented adaptive streaming (HLS)
    Adaptive,
    /// Negotiated low-latency peer session (WebRTC over WHEP)
    Negotiated,
}

impl Protocol {
    /// Guess the protocol from a locator
    ///
    /// Playlist locators (`.m3u8`, ignoring query and fragment) are adaptive,
    /// everything else is treated as a negotiation endpoint.
    #[must_use]
    pub fn detect(locator: &str) -> Self {
        let path = locator
            .split(['?', '#'])
            .next()
            .unwrap_or(locator)
            .to_ascii_lowercase();
        if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            Self::Adaptive
        } else {
            Self::Negotiated
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Adaptive => "adaptive",
            Self::Negotiated => "negotiated",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
