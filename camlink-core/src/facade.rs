//! Protocol-agnostic view of one stream
//!
//! A [`StreamHandle`] is bound to one key and one protocol when it is
//! created. Getters read straight from the registry, so every handle for the
//! same key observes the same state.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::adaptive::AdaptiveEngine;
use crate::error::{StreamError, StreamResult};
use crate::media::{MediaHandle, MediaSink};
use crate::negotiated::NegotiatedEngine;
use crate::registry::{StateChange, StreamRegistry};
use crate::state::{StreamState, StreamStats, StreamStatus};
use crate::types::{Protocol, StreamKey};

/// Engine a handle was bound to at construction
#[derive(Clone)]
pub(crate) enum BoundEngine {
    Adaptive(AdaptiveEngine),
    Negotiated(NegotiatedEngine),
}

impl BoundEngine {
    const fn protocol(&self) -> Protocol {
        match self {
            Self::Adaptive(_) => Protocol::Adaptive,
            Self::Negotiated(_) => Protocol::Negotiated,
        }
    }
}

pub struct StreamHandle {
    key: StreamKey,
    engine: BoundEngine,
    registry: StreamRegistry,
    sink: Mutex<Option<Arc<dyn MediaSink>>>,
}

impl StreamHandle {
    pub(crate) fn new(key: StreamKey, engine: BoundEngine, registry: StreamRegistry) -> Self {
        Self {
            key,
            engine,
            registry,
            sink: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.engine.protocol()
    }

    /// Connect the stream, rendering into `sink` (or the last sink given)
    ///
    /// Adaptive streams need a sink; negotiated streams accept one so the
    /// remote media can be assigned to it when it arrives. A stream that is
    /// already connecting or playing is left alone.
    pub fn connect(&self, sink: Option<Arc<dyn MediaSink>>) -> StreamResult<()> {
        let sink = {
            let mut current = self.sink.lock();
            if let Some(sink) = sink {
                *current = Some(sink);
            }
            current.clone()
        };

        match &self.engine {
            BoundEngine::Adaptive(engine) => {
                let sink = sink.ok_or_else(|| StreamError::SinkRequired(self.key.to_string()))?;
                engine.connect(&self.key, sink)
            }
            BoundEngine::Negotiated(engine) => engine.connect(&self.key, sink),
        }
    }

    /// Tear the stream down; a later `connect` starts from scratch
    pub fn disconnect(&self) {
        self.registry.remove(&self.key);
    }

    /// Attach a render target
    ///
    /// A sink that already carries the stream's current source is left as is:
    /// no new session, no status change.
    pub fn bind_sink(&self, sink: Arc<dyn MediaSink>) -> StreamResult<()> {
        *self.sink.lock() = Some(Arc::clone(&sink));
        match &self.engine {
            BoundEngine::Adaptive(engine) => engine.rebind(&self.key, sink),
            BoundEngine::Negotiated(engine) => {
                engine.rebind(&self.key, sink);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> Option<StreamState> {
        self.registry.get(&self.key)
    }

    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.state()
            .map_or_else(|| StreamStatus::idle(self.protocol()), |state| state.status())
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state().and_then(|state| state.error().map(str::to_string))
    }

    /// Remote media of a negotiated stream
    #[must_use]
    pub fn media_handle(&self) -> Option<MediaHandle> {
        self.state().and_then(|state| state.remote_media().cloned())
    }

    /// Playback statistics; zeroed for an idle adaptive stream, `None` for
    /// negotiated streams
    #[must_use]
    pub fn stats(&self) -> Option<StreamStats> {
        match self.protocol() {
            Protocol::Adaptive => Some(
                self.state()
                    .and_then(|state| state.stats().copied())
                    .unwrap_or_default(),
            ),
            Protocol::Negotiated => None,
        }
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.state().map_or(0, |state| state.retry_count())
    }

    /// State changes of this stream from now on
    #[must_use]
    pub fn subscribe(&self) -> StateChanges {
        StateChanges {
            key: self.key.clone(),
            changes: self.registry.subscribe(),
        }
    }
}

/// State change feed filtered to one key
pub struct StateChanges {
    key: StreamKey,
    changes: broadcast::Receiver<StateChange>,
}

impl StateChanges {
    /// Next state of the stream; `None` once the registry is gone
    ///
    /// Changes missed by a slow receiver are skipped.
    pub async fn recv(&mut self) -> Option<StreamState> {
        loop {
            match self.changes.recv().await {
                Ok(change) if change.key == self.key => return Some(change.state),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
