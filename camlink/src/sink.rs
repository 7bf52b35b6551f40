//! Sink that consumes media without rendering it
//!
//! Segments are counted and then dropped. The playhead advances with wall
//! time from the first appended segment, so the buffered figure reported to
//! the stats sampler behaves like a real player's.

use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::broadcast;

use camlink_core::{MediaSegment, MediaSink, MediaSource, PlaybackOptions, SinkEvent};

#[derive(Default)]
struct Playback {
    source: Option<MediaSource>,
    started: Option<Instant>,
    appended_secs: f64,
    segments: u64,
}

pub struct HeadlessSink {
    playback: Mutex<Playback>,
    events: broadcast::Sender<SinkEvent>,
}

impl HeadlessSink {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            playback: Mutex::new(Playback::default()),
            events,
        }
    }

    pub fn segments(&self) -> u64 {
        self.playback.lock().segments
    }
}

impl MediaSink for HeadlessSink {
    fn configure(&self, _options: PlaybackOptions) {}

    fn can_play_type(&self, _mime_type: &str) -> bool {
        false
    }

    fn set_source(&self, source: Option<MediaSource>) {
        let mut playback = self.playback.lock();
        if playback.source != source {
            *playback = Playback {
                source,
                ..Playback::default()
            };
        }
    }

    fn source(&self) -> Option<MediaSource> {
        self.playback.lock().source.clone()
    }

    fn append_segment(&self, segment: MediaSegment) -> Result<(), String> {
        let first = {
            let mut playback = self.playback.lock();
            playback.segments += 1;
            playback.appended_secs += segment.duration.max(0.0);
            playback.started.get_or_insert_with(Instant::now);
            playback.segments == 1
        };
        if first {
            let _ = self.events.send(SinkEvent::Playing);
        }
        Ok(())
    }

    fn buffered_ahead(&self) -> f64 {
        let playback = self.playback.lock();
        let played = playback.started.map_or(0.0, |t| t.elapsed().as_secs_f64());
        (playback.appended_secs - played).max(0.0)
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.events.subscribe()
    }
}
