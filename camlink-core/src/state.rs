//! Per-stream state and the reducer that advances it
//!
//! State never changes in place: every transition is a [`StatePatch`]
//! applied by [`StreamState::apply`], producing the next state. The registry
//! swaps the result in while it holds the entry.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::media::MediaHandle;
use crate::types::Protocol;

/// Status of an adaptive (HLS) stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdaptiveStatus {
    Idle,
    Loading,
    Playing,
    Buffering,
    Error,
}

/// Status of a negotiated (WebRTC) stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiatedStatus {
    Idle,
    Connecting,
    Connected,
    Failed,
}

/// Protocol-tagged status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "status", rename_all = "lowercase")]
pub enum StreamStatus {
    Adaptive(AdaptiveStatus),
    Negotiated(NegotiatedStatus),
}

impl StreamStatus {
    #[must_use]
    pub const fn idle(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Adaptive => Self::Adaptive(AdaptiveStatus::Idle),
            Protocol::Negotiated => Self::Negotiated(NegotiatedStatus::Idle),
        }
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::Adaptive(_) => Protocol::Adaptive,
            Self::Negotiated(_) => Protocol::Negotiated,
        }
    }

    /// A stream in one of these states is already on its way; connecting
    /// again would only restart it.
    #[must_use]
    pub const fn is_progressing(&self) -> bool {
        matches!(
            self,
            Self::Adaptive(AdaptiveStatus::Loading | AdaptiveStatus::Playing | AdaptiveStatus::Buffering)
                | Self::Negotiated(NegotiatedStatus::Connecting | NegotiatedStatus::Connected)
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Adaptive(AdaptiveStatus::Idle) | Self::Negotiated(NegotiatedStatus::Idle) => "idle",
            Self::Adaptive(AdaptiveStatus::Loading) => "loading",
            Self::Adaptive(AdaptiveStatus::Playing) => "playing",
            Self::Adaptive(AdaptiveStatus::Buffering) => "buffering",
            Self::Adaptive(AdaptiveStatus::Error) => "error",
            Self::Negotiated(NegotiatedStatus::Connecting) => "connecting",
            Self::Negotiated(NegotiatedStatus::Connected) => "connected",
            Self::Negotiated(NegotiatedStatus::Failed) => "failed",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Passive playback statistics of an adaptive stream
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamStats {
    /// Cumulative bytes loaded by the session
    pub bytes_loaded: u64,
    /// Throughput over the last sample window, kbps
    pub bitrate: u64,
    /// Seconds buffered ahead of the playhead
    pub buffer_length: f64,
    pub dropped_frames: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveState {
    pub status: AdaptiveStatus,
    pub error: Option<String>,
    pub stats: StreamStats,
    pub retry_count: u32,
}

impl Default for AdaptiveState {
    fn default() -> Self {
        Self {
            status: AdaptiveStatus::Idle,
            error: None,
            stats: StreamStats::default(),
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedState {
    pub status: NegotiatedStatus,
    pub error: Option<String>,
    pub remote_media: Option<MediaHandle>,
    pub retry_count: u32,
}

impl Default for NegotiatedState {
    fn default() -> Self {
        Self {
            status: NegotiatedStatus::Idle,
            error: None,
            remote_media: None,
            retry_count: 0,
        }
    }
}

/// Protocol-tagged stream state
#[derive(Debug, Clone, PartialEq)]
pub enum StreamState {
    Adaptive(AdaptiveState),
    Negotiated(NegotiatedState),
}

impl StreamState {
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Adaptive => Self::Adaptive(AdaptiveState::default()),
            Protocol::Negotiated => Self::Negotiated(NegotiatedState::default()),
        }
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::Adaptive(_) => Protocol::Adaptive,
            Self::Negotiated(_) => Protocol::Negotiated,
        }
    }

    #[must_use]
    pub const fn status(&self) -> StreamStatus {
        match self {
            Self::Adaptive(s) => StreamStatus::Adaptive(s.status),
            Self::Negotiated(s) => StreamStatus::Negotiated(s.status),
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Adaptive(s) => s.error.as_deref(),
            Self::Negotiated(s) => s.error.as_deref(),
        }
    }

    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        match self {
            Self::Adaptive(s) => s.retry_count,
            Self::Negotiated(s) => s.retry_count,
        }
    }

    #[must_use]
    pub const fn stats(&self) -> Option<&StreamStats> {
        match self {
            Self::Adaptive(s) => Some(&s.stats),
            Self::Negotiated(_) => None,
        }
    }

    #[must_use]
    pub const fn remote_media(&self) -> Option<&MediaHandle> {
        match self {
            Self::Adaptive(_) => None,
            Self::Negotiated(s) => s.remote_media.as_ref(),
        }
    }

    /// Produce the next state by merging `patch` into this one
    ///
    /// Fields that do not exist for this protocol (a negotiated status on an
    /// adaptive stream, stats on a negotiated one) are dropped.
    #[must_use]
    pub fn apply(&self, patch: &StatePatch) -> Self {
        let mut next = self.clone();
        match &mut next {
            Self::Adaptive(s) => {
                match patch.status {
                    Some(StreamStatus::Adaptive(status)) => s.status = status,
                    Some(other) => warn!(status = %other, "Ignoring negotiated status for adaptive stream"),
                    None => {}
                }
                if let Some(error) = &patch.error {
                    s.error.clone_from(error);
                }
                if let Some(stats) = patch.stats {
                    s.stats = stats;
                }
                if let Some(retry_count) = patch.retry_count {
                    s.retry_count = retry_count;
                }
            }
            Self::Negotiated(s) => {
                match patch.status {
                    Some(StreamStatus::Negotiated(status)) => s.status = status,
                    Some(other) => warn!(status = %other, "Ignoring adaptive status for negotiated stream"),
                    None => {}
                }
                if let Some(error) = &patch.error {
                    s.error.clone_from(error);
                }
                if let Some(remote_media) = &patch.remote_media {
                    s.remote_media.clone_from(remote_media);
                }
                if let Some(retry_count) = patch.retry_count {
                    s.retry_count = retry_count;
                }
            }
        }
        next
    }
}

/// Partial state update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub status: Option<StreamStatus>,
    pub error: Option<Option<String>>,
    pub stats: Option<StreamStats>,
    pub remote_media: Option<Option<MediaHandle>>,
    pub retry_count: Option<u32>,
}

impl StatePatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status: impl Into<StreamStatus>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    #[must_use]
    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    #[must_use]
    pub const fn stats(mut self, stats: StreamStats) -> Self {
        self.stats = Some(stats);
        self
    }

    #[must_use]
    pub fn remote_media(mut self, media: Option<MediaHandle>) -> Self {
        self.remote_media = Some(media);
        self
    }

    #[must_use]
    pub const fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

impl From<AdaptiveStatus> for StreamStatus {
    fn from(status: AdaptiveStatus) -> Self {
        Self::Adaptive(status)
    }
}

impl From<NegotiatedStatus> for StreamStatus {
    fn from(status: NegotiatedStatus) -> Self {
        Self::Negotiated(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_merges_only_set_fields() {
        let state = StreamState::new(Protocol::Adaptive);
        let next = state.apply(&StatePatch::new().status(AdaptiveStatus::Loading).retry_count(2));

        assert_eq!(next.status(), StreamStatus::Adaptive(AdaptiveStatus::Loading));
        assert_eq!(next.retry_count(), 2);
        assert_eq!(next.error(), None);

        let failed = next.apply(&StatePatch::new().status(AdaptiveStatus::Error).error("boom"));
        assert_eq!(failed.error(), Some("boom"));
        assert_eq!(failed.retry_count(), 2);

        let cleared = failed.apply(&StatePatch::new().clear_error());
        assert_eq!(cleared.error(), None);
        assert_eq!(cleared.status(), StreamStatus::Adaptive(AdaptiveStatus::Error));
    }

    #[test]
    fn test_apply_leaves_input_untouched() {
        let state = StreamState::new(Protocol::Negotiated);
        let _ = state.apply(&StatePatch::new().status(NegotiatedStatus::Connected));
        assert_eq!(state.status(), StreamStatus::Negotiated(NegotiatedStatus::Idle));
    }

    #[test]
    fn test_apply_drops_foreign_fields() {
        let state = StreamState::new(Protocol::Negotiated);
        let next = state.apply(
            &StatePatch::new()
                .status(AdaptiveStatus::Playing)
                .stats(StreamStats {
                    bytes_loaded: 10,
                    ..StreamStats::default()
                }),
        );
        assert_eq!(next, state);
        assert!(next.stats().is_none());
    }

    #[test]
    fn test_progressing_statuses() {
        assert!(StreamStatus::Adaptive(AdaptiveStatus::Loading).is_progressing());
        assert!(StreamStatus::Adaptive(AdaptiveStatus::Buffering).is_progressing());
        assert!(StreamStatus::Negotiated(NegotiatedStatus::Connecting).is_progressing());
        assert!(!StreamStatus::Adaptive(AdaptiveStatus::Error).is_progressing());
        assert!(!StreamStatus::Negotiated(NegotiatedStatus::Failed).is_progressing());
        assert!(!StreamStatus::idle(Protocol::Negotiated).is_progressing());
    }
}
