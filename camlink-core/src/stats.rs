//! Passive playback statistics for adaptive streams

use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::adaptive::AdaptiveSession;
use crate::media::MediaSink;
use crate::registry::StreamRegistry;
use crate::resources::Timer;
use crate::state::{StatePatch, StreamStats};
use crate::types::StreamKey;

/// Sampling period
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Compute one sample from cumulative counters
///
/// `bitrate` is in kbps over one sample window: `(bytes delta * 8) / 1000`.
#[must_use]
pub fn compute(previous_bytes: u64, bytes_loaded: u64, buffer_length: f64, dropped_frames: u64) -> StreamStats {
    let delta = bytes_loaded.saturating_sub(previous_bytes);
    StreamStats {
        bytes_loaded,
        bitrate: delta.saturating_mul(8) / 1000,
        buffer_length,
        dropped_frames,
    }
}

/// Managed sessions count their own fetches; a native sink may report its own
fn bytes_loaded(session: Option<&dyn AdaptiveSession>, sink: &dyn MediaSink) -> u64 {
    match session {
        Some(session) => session.bytes_loaded(),
        None => sink.bytes_loaded().unwrap_or(0),
    }
}

/// Start the 1 s sampler for one instance
///
/// Samples are published only while `generation` owns the entry.
pub fn start_sampler(
    registry: StreamRegistry,
    key: StreamKey,
    generation: u64,
    session: Option<Arc<dyn AdaptiveSession>>,
    sink: Arc<dyn MediaSink>,
) -> Timer {
    let mut previous_bytes = bytes_loaded(session.as_deref(), sink.as_ref());

    Timer::repeating(SAMPLE_INTERVAL, move || {
        let bytes_loaded = bytes_loaded(session.as_deref(), sink.as_ref());
        let stats = compute(
            previous_bytes,
            bytes_loaded,
            sink.buffered_ahead(),
            sink.dropped_frames().unwrap_or(0),
        );
        previous_bytes = bytes_loaded;

        trace!(stream_key = %key, bitrate = stats.bitrate, buffer = stats.buffer_length, "Stats sample");
        registry.replace_if_current(&key, generation, &StatePatch::new().stats(stats));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_from_window_delta() {
        let stats = compute(0, 12_500, 4.5, 2);
        assert_eq!(stats.bitrate, 100);
        assert_eq!(stats.bytes_loaded, 12_500);
        assert!((stats.buffer_length - 4.5).abs() < f64::EPSILON);
        assert_eq!(stats.dropped_frames, 2);

        let next = compute(12_500, 12_500, 0.0, 0);
        assert_eq!(next.bitrate, 0);
    }

    #[test]
    fn test_counter_reset_does_not_underflow() {
        let stats = compute(50_000, 1_000, 0.0, 0);
        assert_eq!(stats.bitrate, 0);
    }
}
