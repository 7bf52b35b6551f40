use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::adaptive::{AdaptiveBackend, AdaptiveEngine, HlsBackend};
use crate::config::{Config, PolicyStore, StreamPolicies};
use crate::error::StreamResult;
use crate::facade::{BoundEngine, StreamHandle};
use crate::negotiated::{NegotiatedEngine, Negotiator, PeerFactory, WebRtcPeerFactory, WhepClient};
use crate::registry::StreamRegistry;
use crate::retry::RetryScheduler;
use crate::types::{Protocol, StreamKey};

/// Protocol backends used by the engines
#[derive(Clone)]
pub struct Backends {
    pub adaptive: Arc<dyn AdaptiveBackend>,
    pub peers: Arc<dyn PeerFactory>,
    pub negotiator: Arc<dyn Negotiator>,
}

impl Backends {
    /// HLS over reqwest, webrtc-rs peers, WHEP signalling
    pub fn from_config(config: &Config) -> StreamResult<Self> {
        Ok(Self {
            adaptive: Arc::new(HlsBackend::new(&config.hls)?),
            peers: Arc::new(WebRtcPeerFactory::new(&config.webrtc)?),
            negotiator: Arc::new(WhepClient::new(Duration::from_millis(
                config.webrtc.negotiation_timeout_ms,
            ))?),
        })
    }
}

/// Owns the registry and both engines
///
/// There is no global state: every stream lives in exactly one context, and
/// [`dispose_all`](Self::dispose_all) releases all of them.
pub struct StreamContext {
    registry: StreamRegistry,
    policies: Arc<PolicyStore>,
    adaptive: AdaptiveEngine,
    negotiated: NegotiatedEngine,
}

impl StreamContext {
    #[must_use]
    pub fn create(policies: StreamPolicies, backends: Backends) -> Self {
        let registry = StreamRegistry::new();
        let policies = Arc::new(PolicyStore::new(policies));
        let scheduler = RetryScheduler::new(Arc::clone(&policies));

        info!(
            adaptive_max_attempts = policies.get(Protocol::Adaptive).max_reconnect_attempts,
            negotiated_max_attempts = policies.get(Protocol::Negotiated).max_reconnect_attempts,
            "Stream context created"
        );

        Self {
            adaptive: AdaptiveEngine::new(registry.clone(), backends.adaptive, scheduler.clone()),
            negotiated: NegotiatedEngine::new(registry.clone(), backends.peers, backends.negotiator, scheduler),
            registry,
            policies,
        }
    }

    /// Handle for `key`, bound to `protocol`
    #[must_use]
    pub fn handle(&self, key: StreamKey, protocol: Protocol) -> StreamHandle {
        let engine = match protocol {
            Protocol::Adaptive => BoundEngine::Adaptive(self.adaptive.clone()),
            Protocol::Negotiated => BoundEngine::Negotiated(self.negotiated.clone()),
        };
        StreamHandle::new(key, engine, self.registry.clone())
    }

    /// Handle for `key` with the protocol guessed from the locator
    #[must_use]
    pub fn handle_detected(&self, key: StreamKey) -> StreamHandle {
        let protocol = Protocol::detect(key.as_str());
        self.handle(key, protocol)
    }

    #[must_use]
    pub const fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Reconnect policies; updates apply to the next reconnect decision
    #[must_use]
    pub const fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    #[must_use]
    pub fn active_keys(&self) -> Vec<StreamKey> {
        self.registry.keys()
    }

    /// Tear down every stream
    pub fn dispose_all(&self) {
        self.registry.dispose_all();
    }
}
