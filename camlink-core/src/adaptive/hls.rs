//! Managed HLS decode session over reqwest
//!
//! The session resolves the manifest (picking the highest-bandwidth variant
//! of a master playlist), fetches segments in order and appends them to the
//! attached sink. Live playlists are re-fetched every target duration.
//! Failures are reported as fatal [`SessionEvent::Error`]s and loading stops
//! until the owner calls `start_load` or `recover_media_error`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use super::playlist::{self, MediaPlaylist, Playlist};
use super::session::{AdaptiveBackend, AdaptiveSession, ErrorKind, SessionEvent};
use crate::config::HlsConfig;
use crate::error::{check_response, StreamError, StreamResult};
use crate::media::{MediaSegment, MediaSink, MediaSource};
use crate::resources::Operation;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Segments behind the live edge where playback of a live playlist starts
const LIVE_EDGE_SEGMENTS: usize = 3;

/// Lower bound of the live refresh interval
const MIN_REFRESH: Duration = Duration::from_millis(500);

/// Creates [`HlsSession`]s sharing one HTTP client
pub struct HlsBackend {
    client: reqwest::Client,
    restart_delay: Duration,
    next_id: AtomicU64,
}

impl HlsBackend {
    pub fn new(config: &HlsConfig) -> StreamResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            restart_delay: Duration::from_millis(config.restart_delay_ms),
            next_id: AtomicU64::new(1),
        })
    }
}

impl AdaptiveBackend for HlsBackend {
    fn is_supported(&self) -> bool {
        true
    }

    fn create_session(&self) -> StreamResult<Arc<dyn AdaptiveSession>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(HlsSession::new(id, self.client.clone(), self.restart_delay)))
    }
}

struct SessionInner {
    sink: Option<Arc<dyn MediaSink>>,
    source: Option<Url>,
    loader: Operation,
}

/// One managed HLS session
pub struct HlsSession {
    id: u64,
    client: reqwest::Client,
    restart_delay: Duration,
    events: broadcast::Sender<SessionEvent>,
    bytes_loaded: Arc<AtomicU64>,
    next_sequence: Arc<Mutex<Option<u64>>>,
    manifest_announced: Arc<AtomicBool>,
    destroyed: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl HlsSession {
    #[must_use]
    pub fn new(id: u64, client: reqwest::Client, restart_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id,
            client,
            restart_delay,
            events,
            bytes_loaded: Arc::new(AtomicU64::new(0)),
            next_sequence: Arc::new(Mutex::new(None)),
            manifest_announced: Arc::new(AtomicBool::new(false)),
            destroyed: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                sink: None,
                source: None,
                loader: Operation::new(),
            }),
        }
    }

    fn spawn_loader(&self, delay: Duration) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }

        let mut inner = self.inner.lock();
        let (Some(sink), Some(source)) = (inner.sink.clone(), inner.source.clone()) else {
            debug!(session_id = self.id, "Loader not started: no sink or source yet");
            return false;
        };

        let loader = Loader {
            session_id: self.id,
            client: self.client.clone(),
            events: self.events.clone(),
            bytes_loaded: Arc::clone(&self.bytes_loaded),
            next_sequence: Arc::clone(&self.next_sequence),
            manifest_announced: Arc::clone(&self.manifest_announced),
            sink,
            source,
        };
        inner.loader.spawn(loader.run(delay));
        true
    }
}

impl AdaptiveSession for HlsSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn attach_media(&self, sink: Arc<dyn MediaSink>) {
        sink.set_source(Some(MediaSource::Managed(self.id)));
        self.inner.lock().sink = Some(sink);
    }

    fn load_source(&self, url: Url) {
        info!(session_id = self.id, url = %url, "Loading HLS source");
        self.inner.lock().source = Some(url);
        *self.next_sequence.lock() = None;
        self.spawn_loader(Duration::ZERO);
    }

    fn start_load(&self) {
        debug!(session_id = self.id, delay_ms = self.restart_delay.as_millis() as u64, "Restarting HLS loading");
        self.spawn_loader(self.restart_delay);
    }

    fn recover_media_error(&self) -> bool {
        debug!(session_id = self.id, "Recovering from media error");
        self.spawn_loader(Duration::ZERO)
    }

    fn bytes_loaded(&self) -> u64 {
        self.bytes_loaded.load(Ordering::Relaxed)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut inner = self.inner.lock();
        inner.loader.cancel();
        if let Some(sink) = inner.sink.take() {
            if sink.source() == Some(MediaSource::Managed(self.id)) {
                sink.set_source(None);
            }
        }
        debug!(session_id = self.id, "HLS session destroyed");
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

impl Drop for HlsSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Why a loader run stopped
enum LoadError {
    Stream(StreamError),
    Media(String),
}

impl LoadError {
    const fn kind(&self) -> ErrorKind {
        match self {
            Self::Stream(StreamError::Network(_) | StreamError::Http { .. }) => ErrorKind::Network,
            Self::Stream(_) => ErrorKind::Other,
            Self::Media(_) => ErrorKind::Media,
        }
    }

    fn details(&self) -> String {
        match self {
            Self::Stream(e) => e.to_string(),
            Self::Media(msg) => format!("Media error: {msg}"),
        }
    }
}

impl From<StreamError> for LoadError {
    fn from(err: StreamError) -> Self {
        Self::Stream(err)
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(err: reqwest::Error) -> Self {
        Self::Stream(err.into())
    }
}

/// State of one loader task
struct Loader {
    session_id: u64,
    client: reqwest::Client,
    events: broadcast::Sender<SessionEvent>,
    bytes_loaded: Arc<AtomicU64>,
    next_sequence: Arc<Mutex<Option<u64>>>,
    manifest_announced: Arc<AtomicBool>,
    sink: Arc<dyn MediaSink>,
    source: Url,
}

impl Loader {
    async fn run(self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.load().await {
            Ok(()) => debug!(session_id = self.session_id, "Playlist ended"),
            Err(e) => {
                let details = e.details();
                warn!(session_id = self.session_id, kind = ?e.kind(), error = %details, "HLS loading failed");
                self.emit(SessionEvent::Error {
                    kind: e.kind(),
                    fatal: true,
                    details,
                });
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn fetch_text(&self, url: &Url) -> Result<String, LoadError> {
        let response = check_response(self.client.get(url.clone()).send().await?)?;
        Ok(response.text().await?)
    }

    async fn fetch_media_playlist(&self, url: &Url) -> Result<MediaPlaylist, LoadError> {
        match playlist::parse(&self.fetch_text(url).await?, url)? {
            Playlist::Media(media) => Ok(media),
            Playlist::Master(_) => Err(StreamError::Playlist(format!("{url}: expected a media playlist")).into()),
        }
    }

    async fn load(&self) -> Result<(), LoadError> {
        let (mut media, media_url, levels) = match playlist::parse(&self.fetch_text(&self.source).await?, &self.source)? {
            Playlist::Master(master) => {
                let variant = master
                    .best_variant()
                    .ok_or_else(|| StreamError::Playlist(format!("{}: no variants", self.source)))?;
                debug!(
                    session_id = self.session_id,
                    bandwidth = variant.bandwidth,
                    uri = %variant.uri,
                    "Selected variant"
                );
                let media_url = variant.uri.clone();
                (self.fetch_media_playlist(&media_url).await?, media_url, master.variants.len())
            }
            Playlist::Media(media) => (media, self.source.clone(), 1),
        };

        if !self.manifest_announced.swap(true, Ordering::AcqRel) {
            self.emit(SessionEvent::ManifestParsed {
                levels,
                live: media.is_live(),
            });
        }

        loop {
            self.load_segments(&media).await?;
            if !media.is_live() {
                return Ok(());
            }
            let refresh = Duration::try_from_secs_f64(media.target_duration)
                .unwrap_or(MIN_REFRESH)
                .max(MIN_REFRESH);
            tokio::time::sleep(refresh).await;
            media = self.fetch_media_playlist(&media_url).await?;
        }
    }

    /// Sequence number to resume from, initialised near the live edge
    fn resume_point(&self, media: &MediaPlaylist) -> u64 {
        *self.next_sequence.lock().get_or_insert_with(|| {
            let skip = if media.is_live() {
                media.segments.len().saturating_sub(LIVE_EDGE_SEGMENTS)
            } else {
                0
            };
            media
                .segments
                .get(skip)
                .map_or(media.media_sequence, |segment| segment.sequence)
        })
    }

    async fn load_segments(&self, media: &MediaPlaylist) -> Result<(), LoadError> {
        let start = self.resume_point(media);

        for segment in media.segments.iter().filter(|s| s.sequence >= start) {
            let response = check_response(self.client.get(segment.uri.clone()).send().await?)?;
            let data = response.bytes().await?;
            let bytes = data.len() as u64;

            self.bytes_loaded.fetch_add(bytes, Ordering::Relaxed);
            self.emit(SessionEvent::FragmentLoaded {
                sequence: segment.sequence,
                bytes,
            });

            self.sink
                .append_segment(MediaSegment {
                    sequence: segment.sequence,
                    duration: segment.duration,
                    data,
                })
                .map_err(LoadError::Media)?;

            *self.next_sequence.lock() = Some(segment.sequence.saturating_add(1));
        }

        Ok(())
    }
}
