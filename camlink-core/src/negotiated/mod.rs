//! Negotiated (WebRTC) stream engine
//!
//! `connect` allocates an instance in `connecting`, then an async operation
//! creates a receive-only peer session and runs the offer/answer exchange.
//! Connectivity callbacks move the stream to `connected` or hand the failure
//! to the retry scheduler; track callbacks publish the remote media handle.

mod peer;
pub mod track;
mod webrtc_peer;
mod whep;

pub use peer::{Negotiator, PeerFactory, PeerSession, PeerState};
pub use track::{RemoteTrack, TrackKind, TrackStats};
pub use webrtc_peer::{WebRtcPeerFactory, WebRtcPeerSession};
pub use whep::{WhepClient, SDP_CONTENT_TYPE};

use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::StreamResult;
use crate::media::{MediaHandle, MediaSink, MediaSource};
use crate::registry::{EngineInstance, StreamRegistry};
use crate::resources::{CancellationToken, InstanceCore, Operation, Resource};
use crate::retry::RetryScheduler;
use crate::state::{NegotiatedStatus, StatePatch, StreamState};
use crate::types::{Protocol, StreamKey};

/// Resources of one negotiated stream
pub struct NegotiatedInstance {
    pub(crate) core: InstanceCore,
    negotiation: Operation,
    peer: Option<Arc<dyn PeerSession>>,
    media: Option<MediaHandle>,
    sink: Option<Arc<dyn MediaSink>>,
}

impl NegotiatedInstance {
    pub(crate) fn new(generation: u64, sink: Option<Arc<dyn MediaSink>>) -> Self {
        Self {
            core: InstanceCore::new(generation),
            negotiation: Operation::new(),
            peer: None,
            media: None,
            sink,
        }
    }

    #[must_use]
    pub fn sink(&self) -> Option<Arc<dyn MediaSink>> {
        self.sink.clone()
    }

    #[must_use]
    pub const fn media(&self) -> Option<&MediaHandle> {
        self.media.as_ref()
    }

    /// Bind a sink and hand it the current remote media, unless it already
    /// carries it
    ///
    /// A replaced sink that still shows this media is cleared.
    fn bind_sink(&mut self, sink: Arc<dyn MediaSink>) {
        if let Some(media) = &self.media {
            let source = MediaSource::Remote(media.clone());
            if let Some(previous) = self.sink.as_ref().filter(|s| !Arc::ptr_eq(*s, &sink)) {
                if previous.source().as_ref() == Some(&source) {
                    previous.set_source(None);
                }
            }
            if sink.source().as_ref() != Some(&source) {
                sink.set_source(Some(source));
            }
        }
        self.sink = Some(sink);
    }

    pub(crate) fn release(&mut self) {
        self.negotiation.cancel();
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        if let Some(media) = self.media.take() {
            media.release();
            if let Some(sink) = &self.sink {
                if sink.source() == Some(MediaSource::Remote(media)) {
                    sink.set_source(None);
                }
            }
        }
        self.core.release();
    }
}

struct EngineInner {
    registry: StreamRegistry,
    peers: Arc<dyn PeerFactory>,
    negotiator: Arc<dyn Negotiator>,
    scheduler: RetryScheduler,
}

/// Negotiated protocol state machine
#[derive(Clone)]
pub struct NegotiatedEngine {
    inner: Arc<EngineInner>,
}

impl NegotiatedEngine {
    #[must_use]
    pub fn new(
        registry: StreamRegistry,
        peers: Arc<dyn PeerFactory>,
        negotiator: Arc<dyn Negotiator>,
        scheduler: RetryScheduler,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                peers,
                negotiator,
                scheduler,
            }),
        }
    }

    /// Connect unless the stream is already connecting or connected
    pub fn connect(&self, key: &StreamKey, sink: Option<Arc<dyn MediaSink>>) -> StreamResult<()> {
        if let Some(state) = self.inner.registry.get(key) {
            if state.protocol() == Protocol::Negotiated && state.status().is_progressing() {
                debug!(stream_key = %key, status = %state.status(), "Already progressing, connect ignored");
                return Ok(());
            }
        }
        self.start(key, sink)
    }

    /// Replace any prior instance for `key` and start negotiating
    fn start(&self, key: &StreamKey, sink: Option<Arc<dyn MediaSink>>) -> StreamResult<()> {
        let registry = &self.inner.registry;
        let endpoint = key.locator()?;
        let generation = registry.next_generation();

        let previous = registry.get(key).filter(|s| s.protocol() == Protocol::Negotiated);
        let mut patch = StatePatch::new()
            .status(NegotiatedStatus::Connecting)
            .retry_count(previous.as_ref().map_or(0, StreamState::retry_count));
        if let Some(error) = previous.as_ref().and_then(StreamState::error) {
            patch = patch.error(error);
        }
        let state = StreamState::new(Protocol::Negotiated).apply(&patch);

        registry.upsert(
            key.clone(),
            state,
            EngineInstance::Negotiated(NegotiatedInstance::new(generation, sink)),
        )?;
        info!(stream_key = %key, generation, "Negotiating peer session");

        registry.modify_current(key, generation, |entry| {
            if let Some(instance) = entry.engine.negotiated_mut() {
                let engine = self.clone();
                let key = key.clone();
                let token = instance.negotiation.token();
                instance.negotiation.spawn(async move {
                    engine.negotiate(&key, generation, &endpoint, token).await;
                });
            }
        });

        Ok(())
    }

    /// Retry entry point: restart with the sink the instance was bound to
    fn reconnect(&self, key: &StreamKey) {
        let Some(sink) = self
            .inner
            .registry
            .modify(key, |entry| entry.engine.negotiated_mut().map(|instance| instance.sink()))
            .flatten()
        else {
            debug!(stream_key = %key, "Stream gone before reconnect");
            return;
        };

        debug!(stream_key = %key, "Reconnecting");
        if let Err(e) = self.start(key, sink) {
            warn!(stream_key = %key, error = %e, "Reconnect failed to start");
        }
    }

    /// Bind `sink` to the stream without touching the connection
    pub fn rebind(&self, key: &StreamKey, sink: Arc<dyn MediaSink>) {
        self.inner.registry.modify(key, |entry| {
            if let Some(instance) = entry.engine.negotiated_mut() {
                instance.bind_sink(sink);
            }
        });
    }

    async fn negotiate(&self, key: &StreamKey, generation: u64, endpoint: &Url, token: CancellationToken) {
        let result = tokio::select! {
            () = token.cancelled() => return,
            result = self.exchange(key, generation, endpoint) => result,
        };

        if let Err(e) = result {
            if token.is_cancelled() {
                return;
            }
            self.fail(key, generation, &format!("Negotiation failed: {e}"));
        }
    }

    async fn exchange(&self, key: &StreamKey, generation: u64, endpoint: &Url) -> StreamResult<()> {
        let peer = self.inner.peers.create().await?;
        let states = peer.connection_states();
        let tracks = peer.tracks();

        let attached = self
            .inner
            .registry
            .modify_live(key, generation, |entry| {
                let Some(instance) = entry.engine.negotiated_mut() else {
                    return false;
                };
                instance.peer = Some(Arc::clone(&peer));

                let engine = self.clone();
                let k = key.clone();
                instance.core.subscriptions.listen(
                    Resource::Peer,
                    "connectionstatechange",
                    states,
                    move |state| engine.on_peer_state(&k, generation, state),
                );
                let engine = self.clone();
                let k = key.clone();
                instance.core.subscriptions.listen(
                    Resource::Peer,
                    "track",
                    tracks,
                    move |track| engine.on_track(&k, generation, track),
                );
                true
            })
            .unwrap_or(false);

        if !attached {
            debug!(stream_key = %key, generation, "Instance superseded while creating peer");
            peer.close();
            return Ok(());
        }

        let offer = peer.create_offer().await?;
        let answer = self.inner.negotiator.exchange(endpoint, &offer).await?;
        peer.set_remote_answer(&answer).await?;

        debug!(stream_key = %key, generation, "Offer/answer exchange complete");
        Ok(())
    }

    fn on_peer_state(&self, key: &StreamKey, generation: u64, state: PeerState) {
        match state {
            PeerState::Connected => {
                self.inner.registry.modify_live(key, generation, |entry| {
                    info!(stream_key = %key, generation, "Peer connected");
                    entry.apply(
                        &StatePatch::new()
                            .status(NegotiatedStatus::Connected)
                            .retry_count(0)
                            .clear_error(),
                    );
                });
            }
            PeerState::Failed | PeerState::Disconnected => {
                self.fail(key, generation, &format!("Peer connection {state}"));
            }
            PeerState::New | PeerState::Connecting | PeerState::Closed => {
                debug!(stream_key = %key, %state, "Peer state");
            }
        }
    }

    fn on_track(&self, key: &StreamKey, generation: u64, track: RemoteTrack) {
        let orphan = track.clone();
        let accepted = self
            .inner
            .registry
            .modify_live(key, generation, |entry| {
                let Some(instance) = entry.engine.negotiated_mut() else {
                    return false;
                };

                if let Some(media) = instance.media.as_ref().filter(|m| m.stream_id() == track.stream_id()) {
                    debug!(stream_key = %key, track_id = track.id(), "Track joined remote media");
                    media.add_track(track);
                    return true;
                }

                if let Some(previous) = instance.media.take() {
                    debug!(stream_key = %key, stream_id = previous.stream_id(), "Replacing remote media");
                    previous.release();
                }
                let media = MediaHandle::new(track.stream_id().to_string(), track);
                instance.media = Some(media.clone());
                if let Some(sink) = &instance.sink {
                    sink.set_source(Some(MediaSource::Remote(media.clone())));
                }

                info!(stream_key = %key, stream_id = media.stream_id(), "Remote media published");
                entry.apply(&StatePatch::new().remote_media(Some(media)));
                true
            })
            .unwrap_or(false);

        if !accepted {
            orphan.release();
        }
    }

    /// Release the instance and hand the failure to the scheduler
    fn fail(&self, key: &StreamKey, generation: u64, reason: &str) {
        self.inner.registry.modify_live(key, generation, |entry| {
            warn!(stream_key = %key, generation, reason, "Negotiated stream failed");
            entry.apply(&StatePatch::new().remote_media(None));
            entry.engine.release();

            let engine = self.clone();
            let key = key.clone();
            self.inner
                .scheduler
                .schedule(entry, reason, move || engine.reconnect(&key));
        });
    }
}
