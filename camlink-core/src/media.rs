//! Media sink contract and the media objects handed to it
//!
//! The sink is the consumer's render target. The connection manager never
//! renders anything itself; it configures the sink, assigns a source to it,
//! feeds it segments (managed adaptive sessions) and listens to its playback
//! events.

use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

use crate::negotiated::track::RemoteTrack;

/// MIME type a sink must report as natively playable to skip the managed session
pub const HLS_MIME_TYPE: &str = "application/vnd.apple.mpegurl";

/// Playback flags applied to a sink before loading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackOptions {
    pub autoplay: bool,
    pub inline: bool,
    pub muted: bool,
}

impl PlaybackOptions {
    /// Autoplay, inline, muted: the combination autoplay policies accept
    #[must_use]
    pub const fn autoplay() -> Self {
        Self {
            autoplay: true,
            inline: true,
            muted: true,
        }
    }
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self::autoplay()
    }
}

/// Playback events raised by a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// Metadata of a natively played source is known
    LoadedMetadata,
    /// Playback started or resumed
    Playing,
    /// Playback stalled waiting for data
    Waiting,
    /// Enough data is buffered to resume
    CanPlay,
    /// The sink could not play its source
    Error(String),
}

/// One media segment appended to a sink by a managed session
#[derive(Debug, Clone)]
pub struct MediaSegment {
    pub sequence: u64,
    /// Segment duration in seconds
    pub duration: f64,
    pub data: Bytes,
}

/// Source currently assigned to a sink
#[derive(Debug, Clone, PartialEq)]
pub enum MediaSource {
    /// Manifest locator handed to a sink that plays HLS natively
    Locator(Url),
    /// Managed decode session feeding the sink, by session id
    Managed(u64),
    /// Remote media received over a peer session
    Remote(MediaHandle),
}

/// Render target owned by the consumer
pub trait MediaSink: Send + Sync {
    /// Apply playback flags before a source is assigned
    fn configure(&self, options: PlaybackOptions);

    /// Whether the sink can play the given MIME type without help
    fn can_play_type(&self, mime_type: &str) -> bool;

    /// Assign or clear the current source
    fn set_source(&self, source: Option<MediaSource>);

    fn source(&self) -> Option<MediaSource>;

    /// Append a segment produced by a managed session
    fn append_segment(&self, segment: MediaSegment) -> Result<(), String>;

    /// Seconds of media buffered ahead of the playhead
    fn buffered_ahead(&self) -> f64;

    /// Dropped frame counter, when the platform exposes one
    fn dropped_frames(&self) -> Option<u64> {
        None
    }

    /// Bytes the sink fetched itself, for sinks that play HLS natively
    fn bytes_loaded(&self) -> Option<u64> {
        None
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent>;
}

/// Remote media stream received over a negotiated session
///
/// Cheap to clone; equality is identity, so a handle only equals clones of
/// itself even if another handle carries the same stream id.
#[derive(Clone)]
pub struct MediaHandle {
    inner: Arc<MediaHandleInner>,
}

struct MediaHandleInner {
    stream_id: String,
    tracks: RwLock<Vec<RemoteTrack>>,
}

impl MediaHandle {
    #[must_use]
    pub fn new(stream_id: impl Into<String>, first_track: RemoteTrack) -> Self {
        Self {
            inner: Arc::new(MediaHandleInner {
                stream_id: stream_id.into(),
                tracks: RwLock::new(vec![first_track]),
            }),
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// Add a track of the same stream; tracks already present are ignored
    pub fn add_track(&self, track: RemoteTrack) {
        let mut tracks = self.inner.tracks.write();
        if tracks.iter().all(|t| t.id() != track.id()) {
            tracks.push(track);
        }
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.inner.tracks.read().clone()
    }

    /// Stop every track of this stream
    pub fn release(&self) {
        for track in self.inner.tracks.read().iter() {
            track.release();
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.tracks.read().iter().all(RemoteTrack::is_released)
    }
}

impl PartialEq for MediaHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("stream_id", &self.inner.stream_id)
            .field("tracks", &self.inner.tracks.read().len())
            .finish()
    }
}
