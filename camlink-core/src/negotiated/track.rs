//! Remote media tracks received over a peer session
//!
//! A track is acquired when the peer session reports it and released on
//! teardown. WebRTC tracks get an RTP reader task that keeps the receive
//! buffers drained and counts traffic until the track is released.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::MarshalSize;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<webrtc::rtp_transceiver::rtp_codec::RTPCodecType> for TrackKind {
    fn from(codec_type: webrtc::rtp_transceiver::rtp_codec::RTPCodecType) -> Self {
        match codec_type {
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Internal track statistics with atomic counters
#[derive(Default)]
struct TrackStatsInner {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    last_packet_time: RwLock<Option<Instant>>,
}

/// A remote audio or video track
#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
    stats: Arc<TrackStatsInner>,
    stop: CancellationToken,
}

impl RemoteTrack {
    #[must_use]
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            stats: Arc::new(TrackStatsInner::default()),
            stop: CancellationToken::new(),
        }
    }

    /// Wrap a WebRTC remote track and start reading its RTP packets
    pub fn from_webrtc(remote: Arc<TrackRemote>) -> Self {
        let track = Self::new(remote.id(), remote.stream_id(), TrackKind::from(remote.kind()));

        info!(
            track_id = %track.id,
            stream_id = %track.stream_id,
            kind = ?track.kind,
            codec = %remote.codec().capability.mime_type,
            "Remote track acquired"
        );

        let stats = Arc::clone(&track.stats);
        let stop = track.stop.clone();
        let track_id = track.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    result = remote.read_rtp() => match result {
                        Ok((packet, _attributes)) => {
                            let packet_size = packet.header.marshal_size() + packet.payload.len();
                            stats.packets_received.fetch_add(1, Ordering::Relaxed);
                            stats.bytes_received.fetch_add(packet_size as u64, Ordering::Relaxed);
                            *stats.last_packet_time.write() = Some(Instant::now());
                        }
                        Err(e) => {
                            debug!(track_id = %track_id, error = %e, "RTP read ended");
                            break;
                        }
                    }
                }
            }

            debug!(track_id = %track_id, "RTP reader stopped");
        });

        track
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Stop reading and release the track
    pub fn release(&self) {
        if !self.stop.is_cancelled() {
            debug!(track_id = %self.id, "Releasing remote track");
            self.stop.cancel();
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.stop.is_cancelled()
    }

    #[must_use]
    pub fn stats(&self) -> TrackStats {
        TrackStats {
            track_id: self.id.clone(),
            kind: self.kind,
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            idle_ms: self
                .stats
                .last_packet_time
                .read()
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Track statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackStats {
    pub track_id: String,
    pub kind: TrackKind,
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Milliseconds since the last packet, if any arrived
    pub idle_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_is_idempotent() {
        let track = RemoteTrack::new("video0", "cam", TrackKind::Video);
        assert!(!track.is_released());

        track.release();
        track.release();
        assert!(track.is_released());

        // Clones share the release state
        let clone = track.clone();
        assert!(clone.is_released());
    }

    #[test]
    fn test_fresh_stats() {
        let track = RemoteTrack::new("audio0", "cam", TrackKind::Audio);
        let stats = track.stats();
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.bytes_received, 0);
        assert_eq!(stats.idle_ms, None);
        assert_eq!(stats.kind, TrackKind::Audio);
    }
}
