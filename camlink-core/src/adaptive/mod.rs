//! Adaptive (HLS) stream engine
//!
//! One instance per stream key. `load` either drives a managed decode session
//! that feeds the sink, or hands the manifest locator to a sink that plays
//! HLS natively. Session and sink events advance the state machine:
//!
//! ```text
//! idle -> loading -> playing <-> buffering
//!            |          |
//!            +--> error <+  (fatal; retry re-enters loading)
//! ```

mod hls;
pub mod playlist;
mod session;

pub use hls::{HlsBackend, HlsSession};
pub use session::{AdaptiveBackend, AdaptiveSession, ErrorKind, SessionEvent};

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};
use crate::media::{MediaSink, MediaSource, PlaybackOptions, SinkEvent, HLS_MIME_TYPE};
use crate::registry::{EngineInstance, RegistryEntry, StreamRegistry};
use crate::resources::{InstanceCore, Resource, Timer};
use crate::retry::RetryScheduler;
use crate::state::{AdaptiveStatus, StatePatch, StreamState, StreamStatus};
use crate::stats;
use crate::types::{Protocol, StreamKey};

/// Consecutive network recoveries without a loaded fragment before escalating
const MAX_NETWORK_RECOVERIES: u32 = 3;

/// Resources of one adaptive stream
pub struct AdaptiveInstance {
    pub(crate) core: InstanceCore,
    sink: Arc<dyn MediaSink>,
    session: Option<Arc<dyn AdaptiveSession>>,
    source: Option<MediaSource>,
    sampler: Option<Timer>,
    network_recoveries: u32,
    media_recovery_used: bool,
}

impl AdaptiveInstance {
    pub(crate) fn new(generation: u64, sink: Arc<dyn MediaSink>) -> Self {
        Self {
            core: InstanceCore::new(generation),
            sink,
            session: None,
            source: None,
            sampler: None,
            network_recoveries: 0,
            media_recovery_used: false,
        }
    }

    /// Whether playback runs through a managed session
    #[must_use]
    pub const fn is_managed(&self) -> bool {
        self.session.is_some()
    }

    /// Source this instance assigned to its sink
    #[must_use]
    pub const fn source(&self) -> Option<&MediaSource> {
        self.source.as_ref()
    }

    #[must_use]
    pub fn sink(&self) -> Arc<dyn MediaSink> {
        Arc::clone(&self.sink)
    }

    /// Swap the sink a released instance reloads into on its next retry
    pub(crate) fn set_sink(&mut self, sink: Arc<dyn MediaSink>) {
        self.sink = sink;
    }

    pub(crate) fn sampler_running(&self) -> bool {
        self.sampler.as_ref().is_some_and(Timer::is_pending)
    }

    pub(crate) fn release(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.cancel();
        }
        if let Some(session) = self.session.take() {
            session.destroy();
        }
        if let Some(source) = self.source.take() {
            if self.sink.source().as_ref() == Some(&source) {
                self.sink.set_source(None);
            }
        }
        self.core.release();
    }
}

struct EngineInner {
    registry: StreamRegistry,
    backend: Arc<dyn AdaptiveBackend>,
    scheduler: RetryScheduler,
}

/// Adaptive protocol state machine
#[derive(Clone)]
pub struct AdaptiveEngine {
    inner: Arc<EngineInner>,
}

impl AdaptiveEngine {
    #[must_use]
    pub fn new(registry: StreamRegistry, backend: Arc<dyn AdaptiveBackend>, scheduler: RetryScheduler) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                backend,
                scheduler,
            }),
        }
    }

    /// Connect unless the stream is already loading or playing
    pub fn connect(&self, key: &StreamKey, sink: Arc<dyn MediaSink>) -> StreamResult<()> {
        if let Some(state) = self.inner.registry.get(key) {
            if state.protocol() == Protocol::Adaptive && state.status().is_progressing() {
                debug!(stream_key = %key, status = %state.status(), "Already progressing, connect ignored");
                return Ok(());
            }
        }
        self.load(key, sink)
    }

    /// Start a new instance for `key`, replacing any prior one
    pub fn load(&self, key: &StreamKey, sink: Arc<dyn MediaSink>) -> StreamResult<()> {
        let registry = &self.inner.registry;
        let locator = key.locator()?;
        let generation = registry.next_generation();

        // Retry bookkeeping survives a reload; everything else starts fresh
        let previous = registry.get(key).filter(|s| s.protocol() == Protocol::Adaptive);
        let mut patch = StatePatch::new()
            .status(AdaptiveStatus::Loading)
            .retry_count(previous.as_ref().map_or(0, StreamState::retry_count));
        if let Some(error) = previous.as_ref().and_then(StreamState::error) {
            patch = patch.error(error);
        }
        let state = StreamState::new(Protocol::Adaptive).apply(&patch);

        sink.configure(PlaybackOptions::autoplay());
        let native = sink.can_play_type(HLS_MIME_TYPE);
        let mut instance = AdaptiveInstance::new(generation, Arc::clone(&sink));

        if !native && self.inner.backend.is_supported() {
            let session = self.inner.backend.create_session()?;
            let session_events = session.subscribe();
            let sink_events = sink.subscribe();
            instance.session = Some(Arc::clone(&session));
            instance.source = Some(MediaSource::Managed(session.id()));
            registry.upsert(key.clone(), state, EngineInstance::Adaptive(instance))?;

            info!(stream_key = %key, session_id = session.id(), generation, "Loading through managed session");
            registry.modify_current(key, generation, |entry| {
                if let Some(instance) = entry.engine.adaptive_mut() {
                    let engine = self.clone();
                    let k = key.clone();
                    instance.core.subscriptions.listen(
                        Resource::Session,
                        "lifecycle",
                        session_events,
                        move |event| engine.on_session_event(&k, generation, event),
                    );
                    let engine = self.clone();
                    let k = key.clone();
                    instance.core.subscriptions.listen(
                        Resource::Sink,
                        "playback",
                        sink_events,
                        move |event| engine.on_sink_event(&k, generation, event),
                    );
                }
            });

            session.attach_media(sink);
            session.load_source(locator);
            Ok(())
        } else if native {
            let sink_events = sink.subscribe();
            let source = MediaSource::Locator(locator);
            instance.source = Some(source.clone());
            registry.upsert(key.clone(), state, EngineInstance::Adaptive(instance))?;

            info!(stream_key = %key, generation, "Loading through native playback");
            registry.modify_current(key, generation, |entry| {
                if let Some(instance) = entry.engine.adaptive_mut() {
                    let engine = self.clone();
                    let k = key.clone();
                    instance.core.subscriptions.listen(
                        Resource::Sink,
                        "playback",
                        sink_events,
                        move |event| engine.on_sink_event(&k, generation, event),
                    );
                }
            });

            sink.set_source(Some(source));
            Ok(())
        } else {
            warn!(stream_key = %key, "Sink cannot play HLS and no managed backend is available");
            let state = state.apply(
                &StatePatch::new()
                    .status(AdaptiveStatus::Error)
                    .error(StreamError::Unsupported.to_string()),
            );
            instance.core.release();
            registry.upsert(key.clone(), state, EngineInstance::Adaptive(instance))?;
            Err(StreamError::Unsupported)
        }
    }

    /// Retry entry point: reload with the sink the instance was bound to
    fn reconnect(&self, key: &StreamKey) {
        let sink = self
            .inner
            .registry
            .modify(key, |entry| entry.engine.adaptive_mut().map(|instance| instance.sink()))
            .flatten();

        match sink {
            Some(sink) => {
                debug!(stream_key = %key, "Reconnecting");
                if let Err(e) = self.load(key, sink) {
                    warn!(stream_key = %key, error = %e, "Reconnect failed to start");
                }
            }
            None => debug!(stream_key = %key, "Stream gone before reconnect"),
        }
    }

    /// Point `key` at a different sink, reloading only if the sink does not
    /// already carry this stream's source
    ///
    /// A released instance keeps the sink so a pending retry reloads into it.
    pub fn rebind(&self, key: &StreamKey, sink: Arc<dyn MediaSink>) -> StreamResult<()> {
        let current = self
            .inner
            .registry
            .modify(key, |entry| {
                let instance = entry.engine.adaptive_mut()?;
                if instance.core.is_active() {
                    Some((instance.source().cloned(), true))
                } else {
                    instance.set_sink(Arc::clone(&sink));
                    Some((None, false))
                }
            })
            .flatten();

        match current {
            Some((Some(source), true)) if sink.source().as_ref() == Some(&source) => {
                debug!(stream_key = %key, "Sink already carries the stream, rebind ignored");
                Ok(())
            }
            Some((_, true)) => self.load(key, sink),
            Some((_, false)) => {
                debug!(stream_key = %key, "Instance released, sink kept for the next reload");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn on_session_event(&self, key: &StreamKey, generation: u64, event: SessionEvent) {
        match event {
            SessionEvent::ManifestParsed { levels, live } => {
                debug!(stream_key = %key, levels, live, "Manifest parsed");
                self.on_ready(key, generation);
            }
            SessionEvent::FragmentLoaded { .. } => {
                self.inner.registry.modify_live(key, generation, |entry| {
                    if let Some(instance) = entry.engine.adaptive_mut() {
                        instance.network_recoveries = 0;
                    }
                });
            }
            SessionEvent::Error { fatal: false, kind, details } => {
                debug!(stream_key = %key, ?kind, details, "Non-fatal session error");
            }
            SessionEvent::Error { kind, details, .. } => self.on_fatal_session_error(key, generation, kind, &details),
        }
    }

    fn on_fatal_session_error(&self, key: &StreamKey, generation: u64, kind: ErrorKind, details: &str) {
        self.inner.registry.modify_live(key, generation, |entry| {
            let Some(instance) = entry.engine.adaptive_mut() else {
                return;
            };
            let Some(session) = instance.session.clone() else {
                return;
            };

            match kind {
                ErrorKind::Network if instance.network_recoveries < MAX_NETWORK_RECOVERIES => {
                    instance.network_recoveries += 1;
                    warn!(
                        stream_key = %key,
                        attempt = instance.network_recoveries,
                        details,
                        "Network error, restarting load"
                    );
                    session.start_load();
                }
                ErrorKind::Media if !instance.media_recovery_used => {
                    instance.media_recovery_used = true;
                    if session.recover_media_error() {
                        warn!(stream_key = %key, details, "Media error, attempting recovery");
                    } else {
                        self.fail(entry, key, details);
                    }
                }
                _ => self.fail(entry, key, details),
            }
        });
    }

    fn on_sink_event(&self, key: &StreamKey, generation: u64, event: SinkEvent) {
        if let SinkEvent::Error(message) = &event {
            let message = format!("Playback error: {message}");
            self.inner.registry.modify_live(key, generation, |entry| {
                let native = entry.engine.adaptive_mut().is_some_and(|i| !i.is_managed());
                if native {
                    self.fail(entry, key, &message);
                } else {
                    debug!(stream_key = %key, message, "Sink error left to the managed session");
                }
            });
            return;
        }

        if event == SinkEvent::LoadedMetadata {
            let native = self
                .inner
                .registry
                .modify_live(key, generation, |entry| {
                    entry.engine.adaptive_mut().is_some_and(|i| !i.is_managed())
                })
                .unwrap_or(false);
            if native {
                self.on_ready(key, generation);
            }
            return;
        }

        self.inner.registry.modify_live(key, generation, |entry| {
            let StreamStatus::Adaptive(status) = entry.state().status() else {
                return;
            };
            let next = match (&event, status) {
                (SinkEvent::Playing, AdaptiveStatus::Loading | AdaptiveStatus::Buffering) => AdaptiveStatus::Playing,
                (SinkEvent::Waiting, AdaptiveStatus::Playing) => AdaptiveStatus::Buffering,
                (SinkEvent::CanPlay, AdaptiveStatus::Buffering) => AdaptiveStatus::Playing,
                _ => return,
            };
            debug!(stream_key = %key, from = ?status, to = ?next, "Playback transition");
            entry.apply(&StatePatch::new().status(next));
        });
    }

    /// Manifest parsed or metadata loaded: the stream is playable
    fn on_ready(&self, key: &StreamKey, generation: u64) {
        let registry = self.inner.registry.clone();
        self.inner.registry.modify_live(key, generation, |entry| {
            let Some(instance) = entry.engine.adaptive_mut() else {
                return;
            };
            instance.network_recoveries = 0;
            if instance.sampler.is_none() {
                instance.sampler = Some(stats::start_sampler(
                    registry,
                    key.clone(),
                    generation,
                    instance.session.clone(),
                    instance.sink(),
                ));
            }

            info!(stream_key = %key, generation, "Stream playing");
            entry.apply(
                &StatePatch::new()
                    .status(AdaptiveStatus::Playing)
                    .clear_error()
                    .retry_count(0),
            );
        });
    }

    /// Publish the error, release resources and hand off to the scheduler
    fn fail(&self, entry: &mut RegistryEntry, key: &StreamKey, message: &str) {
        warn!(stream_key = %key, error = message, "Adaptive stream failed");
        entry.apply(&StatePatch::new().status(AdaptiveStatus::Error).error(message));
        entry.engine.release();

        let engine = self.clone();
        let key = key.clone();
        self.inner
            .scheduler
            .schedule(entry, message, move || engine.reconnect(&key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyStore, ReconnectPolicy, StreamPolicies};
    use crate::test_helpers::{settle, FakeAdaptiveBackend, FakeSink};
    use std::time::Duration;

    const KEY: &str = "https://cams.example.com/lobby/index.m3u8";

    struct Harness {
        registry: StreamRegistry,
        backend: Arc<FakeAdaptiveBackend>,
        engine: AdaptiveEngine,
        key: StreamKey,
    }

    fn harness(policy: ReconnectPolicy, backend_supported: bool) -> Harness {
        let registry = StreamRegistry::new();
        let policies = Arc::new(PolicyStore::new(StreamPolicies {
            adaptive: policy,
            ..StreamPolicies::default()
        }));
        let backend = Arc::new(FakeAdaptiveBackend::new(backend_supported));
        let engine = AdaptiveEngine::new(
            registry.clone(),
            Arc::clone(&backend) as Arc<dyn AdaptiveBackend>,
            RetryScheduler::new(policies),
        );
        Harness {
            registry,
            backend,
            engine,
            key: StreamKey::from(KEY),
        }
    }

    fn policy(max_reconnect_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            auto_reconnect: true,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts,
        }
    }

    fn status(h: &Harness) -> StreamStatus {
        h.registry.get(&h.key).map(|s| s.status()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_managed_load_reaches_playing() {
        let h = harness(policy(3), true);
        let sink = FakeSink::new(false);

        h.engine.load(&h.key, sink.clone()).unwrap();
        assert_eq!(status(&h), StreamStatus::Adaptive(AdaptiveStatus::Loading));
        assert_eq!(sink.options(), Some(PlaybackOptions::autoplay()));

        let session = h.backend.last_session().unwrap();
        assert_eq!(session.loaded_source().as_deref(), Some(KEY));
        assert_eq!(sink.source(), Some(MediaSource::Managed(session.id())));

        session.emit(SessionEvent::ManifestParsed { levels: 1, live: true });
        settle().await;
        assert_eq!(status(&h), StreamStatus::Adaptive(AdaptiveStatus::Playing));
        assert_eq!(h.registry.pending_timers(&h.key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_sampled_every_second() {
        let h = harness(policy(3), true);
        let sink = FakeSink::new(false);
        sink.set_buffered(3.0);
        h.engine.load(&h.key, sink.clone()).unwrap();
        let session = h.backend.last_session().unwrap();
        session.emit(SessionEvent::ManifestParsed { levels: 1, live: true });
        settle().await;

        session.add_bytes(12_500);
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        let state = h.registry.get(&h.key).unwrap();
        let stats = state.stats().unwrap();
        assert_eq!(stats.bitrate, 100);
        assert_eq!(stats.bytes_loaded, 12_500);
        assert!((stats.buffer_length - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_playback_uses_locator() {
        let h = harness(policy(3), true);
        let sink = FakeSink::new(true);

        h.engine.load(&h.key, sink.clone()).unwrap();
        assert!(h.backend.last_session().is_none());
        assert_eq!(
            sink.source(),
            Some(MediaSource::Locator(url::Url::parse(KEY).unwrap()))
        );

        sink.emit(SinkEvent::LoadedMetadata);
        settle().await;
        assert_eq!(status(&h), StreamStatus::Adaptive(AdaptiveStatus::Playing));

        sink.emit(SinkEvent::Waiting);
        settle().await;
        assert_eq!(status(&h), StreamStatus::Adaptive(AdaptiveStatus::Buffering));

        sink.emit(SinkEvent::CanPlay);
        settle().await;
        assert_eq!(status(&h), StreamStatus::Adaptive(AdaptiveStatus::Playing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_stats_use_sink_byte_counter() {
        let h = harness(policy(3), true);
        let sink = FakeSink::new(true);
        sink.set_bytes_loaded(1_000);
        h.engine.load(&h.key, sink.clone()).unwrap();
        sink.emit(SinkEvent::LoadedMetadata);
        settle().await;

        sink.set_bytes_loaded(26_000);
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        let state = h.registry.get(&h.key).unwrap();
        let stats = state.stats().unwrap();
        assert_eq!(stats.bytes_loaded, 26_000);
        assert_eq!(stats.bitrate, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_sink_error_is_fatal() {
        let h = harness(policy(3), true);
        let sink = FakeSink::new(true);
        h.engine.load(&h.key, sink.clone()).unwrap();
        sink.emit(SinkEvent::LoadedMetadata);
        settle().await;

        sink.emit(SinkEvent::Error("decode error".to_string()));
        settle().await;

        let state = h.registry.get(&h.key).unwrap();
        assert_eq!(state.status(), StreamStatus::Adaptive(AdaptiveStatus::Loading));
        assert_eq!(state.error(), Some("Playback error: decode error"));
        assert_eq!(state.retry_count(), 1);
        assert_eq!(sink.source(), None);
        assert_eq!(h.registry.pending_timers(&h.key), 1);

        tokio::time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(
            sink.source(),
            Some(MediaSource::Locator(url::Url::parse(KEY).unwrap()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_sink_errors_without_retry() {
        let h = harness(policy(3), false);
        let sink = FakeSink::new(false);

        let result = h.engine.load(&h.key, sink);
        assert!(matches!(result, Err(StreamError::Unsupported)));

        let state = h.registry.get(&h.key).unwrap();
        assert_eq!(state.status(), StreamStatus::Adaptive(AdaptiveStatus::Error));
        assert_eq!(state.error(), Some("Adaptive streaming is not supported by this sink"));
        assert_eq!(h.registry.pending_timers(&h.key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_recover_then_escalate() {
        let h = harness(policy(3), true);
        h.engine.load(&h.key, FakeSink::new(false)).unwrap();
        let session = h.backend.last_session().unwrap();
        session.emit(SessionEvent::ManifestParsed { levels: 1, live: true });
        settle().await;

        let network_error = || SessionEvent::Error {
            kind: ErrorKind::Network,
            fatal: true,
            details: "segment fetch failed".to_string(),
        };

        for _ in 0..MAX_NETWORK_RECOVERIES {
            session.emit(network_error());
            settle().await;
        }
        assert_eq!(session.start_load_calls(), 3);
        assert_eq!(status(&h), StreamStatus::Adaptive(AdaptiveStatus::Playing));

        // A loaded fragment resets the budget
        session.emit(SessionEvent::FragmentLoaded { sequence: 1, bytes: 10 });
        session.emit(network_error());
        settle().await;
        assert_eq!(session.start_load_calls(), 4);

        for _ in 0..MAX_NETWORK_RECOVERIES {
            session.emit(network_error());
            settle().await;
        }
        // Fourth consecutive recovery escalates: session torn down, retry scheduled
        assert_eq!(session.start_load_calls(), 6);
        assert!(session.is_destroyed());
        let state = h.registry.get(&h.key).unwrap();
        assert_eq!(state.status(), StreamStatus::Adaptive(AdaptiveStatus::Loading));
        assert_eq!(state.retry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_media_recovery() {
        let h = harness(policy(0), true);
        h.engine.load(&h.key, FakeSink::new(false)).unwrap();
        let session = h.backend.last_session().unwrap();

        let media_error = || SessionEvent::Error {
            kind: ErrorKind::Media,
            fatal: true,
            details: "decode failed".to_string(),
        };

        session.emit(media_error());
        settle().await;
        assert_eq!(session.recover_calls(), 1);
        assert!(!session.is_destroyed());

        session.emit(media_error());
        settle().await;
        assert_eq!(session.recover_calls(), 1);
        assert!(session.is_destroyed());

        // No attempts allowed: terminal error, instance kept until disconnect
        let state = h.registry.get(&h.key).unwrap();
        assert_eq!(state.status(), StreamStatus::Adaptive(AdaptiveStatus::Error));
        assert!(state.error().unwrap().contains("decode failed"));
        assert_eq!(h.registry.pending_timers(&h.key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_retries_after_delay() {
        let h = harness(policy(3), true);
        h.engine.load(&h.key, FakeSink::new(false)).unwrap();
        let first = h.backend.last_session().unwrap();

        first.emit(SessionEvent::Error {
            kind: ErrorKind::Other,
            fatal: true,
            details: "bad playlist".to_string(),
        });
        settle().await;
        assert!(first.is_destroyed());
        assert_eq!(h.backend.sessions_created(), 1);

        tokio::time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(h.backend.sessions_created(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(h.backend.sessions_created(), 2);

        // The retried instance reaches playing and resets the counter
        let second = h.backend.last_session().unwrap();
        second.emit(SessionEvent::ManifestParsed { levels: 1, live: false });
        settle().await;
        let state = h.registry.get(&h.key).unwrap();
        assert_eq!(state.status(), StreamStatus::Adaptive(AdaptiveStatus::Playing));
        assert_eq!(state.retry_count(), 0);
        assert_eq!(state.error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_events_are_fenced() {
        let h = harness(policy(3), true);
        h.engine.load(&h.key, FakeSink::new(false)).unwrap();
        let first = h.backend.last_session().unwrap();

        h.engine.load(&h.key, FakeSink::new(false)).unwrap();
        assert!(first.is_destroyed());

        first.emit(SessionEvent::ManifestParsed { levels: 1, live: true });
        settle().await;
        assert_eq!(status(&h), StreamStatus::Adaptive(AdaptiveStatus::Loading));
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_progressing_is_noop() {
        let h = harness(policy(3), true);
        let sink = FakeSink::new(false);

        h.engine.connect(&h.key, sink.clone()).unwrap();
        h.engine.connect(&h.key, sink).unwrap();

        assert_eq!(h.backend.sessions_created(), 1);
        assert_eq!(h.registry.len(), 1);
    }
}
