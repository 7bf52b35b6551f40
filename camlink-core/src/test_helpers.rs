//! In-memory sinks, sessions and peers for engine tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

use crate::adaptive::{AdaptiveBackend, AdaptiveSession, SessionEvent};
use crate::context::Backends;
use crate::error::{StreamError, StreamResult};
use crate::media::{MediaSegment, MediaSink, MediaSource, PlaybackOptions, SinkEvent, HLS_MIME_TYPE};
use crate::negotiated::{Negotiator, PeerFactory, PeerSession, PeerState, RemoteTrack};

const EVENT_CAPACITY: usize = 64;

/// Let spawned handler tasks drain their queues
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub struct FakeSink {
    native: bool,
    options: Mutex<Option<PlaybackOptions>>,
    source: Mutex<Option<MediaSource>>,
    source_assignments: AtomicUsize,
    segments: Mutex<Vec<MediaSegment>>,
    buffered: Mutex<f64>,
    bytes: Mutex<Option<u64>>,
    events: broadcast::Sender<SinkEvent>,
}

impl FakeSink {
    pub fn new(native: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            native,
            options: Mutex::new(None),
            source: Mutex::new(None),
            source_assignments: AtomicUsize::new(0),
            segments: Mutex::new(Vec::new()),
            buffered: Mutex::new(0.0),
            bytes: Mutex::new(None),
            events,
        })
    }

    pub fn options(&self) -> Option<PlaybackOptions> {
        *self.options.lock()
    }

    pub fn set_buffered(&self, seconds: f64) {
        *self.buffered.lock() = seconds;
    }

    /// Report a fetched byte counter, as a native player would
    pub fn set_bytes_loaded(&self, bytes: u64) {
        *self.bytes.lock() = Some(bytes);
    }

    pub fn emit(&self, event: SinkEvent) {
        let _ = self.events.send(event);
    }

    /// Number of `set_source` calls so far
    pub fn source_assignments(&self) -> usize {
        self.source_assignments.load(Ordering::SeqCst)
    }

    pub fn segments(&self) -> Vec<MediaSegment> {
        self.segments.lock().clone()
    }
}

impl MediaSink for FakeSink {
    fn configure(&self, options: PlaybackOptions) {
        *self.options.lock() = Some(options);
    }

    fn can_play_type(&self, mime_type: &str) -> bool {
        self.native && mime_type == HLS_MIME_TYPE
    }

    fn set_source(&self, source: Option<MediaSource>) {
        self.source_assignments.fetch_add(1, Ordering::SeqCst);
        *self.source.lock() = source;
    }

    fn source(&self) -> Option<MediaSource> {
        self.source.lock().clone()
    }

    fn append_segment(&self, segment: MediaSegment) -> Result<(), String> {
        self.segments.lock().push(segment);
        Ok(())
    }

    fn buffered_ahead(&self) -> f64 {
        *self.buffered.lock()
    }

    fn bytes_loaded(&self) -> Option<u64> {
        *self.bytes.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.events.subscribe()
    }
}

pub struct FakeSession {
    id: u64,
    events: broadcast::Sender<SessionEvent>,
    sink: Mutex<Option<Arc<dyn MediaSink>>>,
    source: Mutex<Option<String>>,
    bytes: AtomicU64,
    start_load_calls: AtomicUsize,
    recover_calls: AtomicUsize,
    destroyed: AtomicBool,
}

impl FakeSession {
    fn new(id: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id,
            events,
            sink: Mutex::new(None),
            source: Mutex::new(None),
            bytes: AtomicU64::new(0),
            start_load_calls: AtomicUsize::new(0),
            recover_calls: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn loaded_source(&self) -> Option<String> {
        self.source.lock().clone()
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn start_load_calls(&self) -> usize {
        self.start_load_calls.load(Ordering::SeqCst)
    }

    pub fn recover_calls(&self) -> usize {
        self.recover_calls.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl AdaptiveSession for FakeSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn attach_media(&self, sink: Arc<dyn MediaSink>) {
        sink.set_source(Some(MediaSource::Managed(self.id)));
        *self.sink.lock() = Some(sink);
    }

    fn load_source(&self, url: Url) {
        *self.source.lock() = Some(url.to_string());
    }

    fn start_load(&self) {
        self.start_load_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn recover_media_error(&self) -> bool {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn bytes_loaded(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sink) = self.sink.lock().take() {
            if sink.source() == Some(MediaSource::Managed(self.id)) {
                sink.set_source(None);
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

pub struct FakeAdaptiveBackend {
    supported: bool,
    next_id: AtomicU64,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeAdaptiveBackend {
    pub fn new(supported: bool) -> Self {
        Self {
            supported,
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl AdaptiveBackend for FakeAdaptiveBackend {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn create_session(&self) -> StreamResult<Arc<dyn AdaptiveSession>> {
        let session = Arc::new(FakeSession::new(self.next_id.fetch_add(1, Ordering::SeqCst)));
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

pub struct FakePeer {
    states: broadcast::Sender<PeerState>,
    tracks: broadcast::Sender<RemoteTrack>,
    answer: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl FakePeer {
    fn new() -> Self {
        let (states, _) = broadcast::channel(EVENT_CAPACITY);
        let (tracks, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            states,
            tracks,
            answer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn emit_state(&self, state: PeerState) {
        let _ = self.states.send(state);
    }

    pub fn emit_track(&self, track: RemoteTrack) {
        let _ = self.tracks.send(track);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remote answer applied to this peer
    pub fn answer(&self) -> Option<String> {
        self.answer.lock().clone()
    }
}

#[async_trait]
impl PeerSession for FakePeer {
    async fn create_offer(&self) -> StreamResult<String> {
        Ok("v=0 offer".to_string())
    }

    async fn set_remote_answer(&self, sdp: &str) -> StreamResult<()> {
        *self.answer.lock() = Some(sdp.to_string());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn connection_states(&self) -> broadcast::Receiver<PeerState> {
        self.states.subscribe()
    }

    fn tracks(&self) -> broadcast::Receiver<RemoteTrack> {
        self.tracks.subscribe()
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self) -> StreamResult<Arc<dyn PeerSession>> {
        let peer = Arc::new(FakePeer::new());
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Negotiator replaying scripted answers, then falling back to a default
pub struct FakeNegotiator {
    script: Mutex<VecDeque<Result<String, String>>>,
    fallback: Result<String, String>,
    calls: AtomicUsize,
}

impl FakeNegotiator {
    fn with(script: VecDeque<Result<String, String>>, fallback: Result<String, String>) -> Self {
        Self {
            script: Mutex::new(script),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every exchange fails
    pub fn failing() -> Self {
        Self::with(VecDeque::new(), Err("endpoint unavailable".to_string()))
    }

    /// Every exchange succeeds
    pub fn answering() -> Self {
        Self::with(VecDeque::new(), Ok("v=0 answer".to_string()))
    }

    /// Play `script` in order, then keep answering
    pub fn scripted<'a>(script: impl IntoIterator<Item = Result<&'a str, &'a str>>) -> Self {
        let script = script
            .into_iter()
            .map(|step| step.map(str::to_string).map_err(str::to_string))
            .collect();
        Self::with(script, Ok("v=0 answer".to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Negotiator for FakeNegotiator {
    async fn exchange(&self, _endpoint: &Url, _offer: &str) -> StreamResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone());
        step.map_err(StreamError::Network)
    }
}

/// Fakes behind a [`Backends`] built by [`fake_backends`]
pub struct Fakes {
    pub adaptive: Arc<FakeAdaptiveBackend>,
    pub peers: Arc<FakePeerFactory>,
    pub negotiator: Arc<FakeNegotiator>,
}

/// Supported managed backend, answering negotiator
pub fn fake_backends() -> (Backends, Fakes) {
    let fakes = Fakes {
        adaptive: Arc::new(FakeAdaptiveBackend::new(true)),
        peers: Arc::new(FakePeerFactory::new()),
        negotiator: Arc::new(FakeNegotiator::answering()),
    };
    let backends = Backends {
        adaptive: Arc::clone(&fakes.adaptive) as Arc<dyn AdaptiveBackend>,
        peers: Arc::clone(&fakes.peers) as Arc<dyn PeerFactory>,
        negotiator: Arc::clone(&fakes.negotiator) as Arc<dyn Negotiator>,
    };
    (backends, fakes)
}
