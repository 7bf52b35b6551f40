//! camlink connection manager
//!
//! Keeps live camera feeds playable over two protocols and hides the
//! difference from consumers:
//!
//! - **Adaptive** (HLS): manifest-based pull. A managed decode session fetches
//!   the playlist and its segments and feeds them into a media sink, or the
//!   sink plays the manifest natively.
//! - **Negotiated** (WebRTC): push. A receive-only peer session exchanges an
//!   SDP offer/answer with a WHEP-style endpoint over HTTP.
//!
//! ## Architecture
//!
//! - **`StreamRegistry`**: keyed store of per-stream state and the engine
//!   resources owned by each entry
//! - **`AdaptiveEngine`** / **`NegotiatedEngine`**: protocol state machines
//!   driven by session, sink and timer callbacks
//! - **`RetryScheduler`**: bounded reconnection with per-protocol policy
//! - **`StatsSampler`**: 1 s throughput/buffer sampling for adaptive streams
//! - **`StreamHandle`**: protocol-agnostic façade bound to one stream key
//! - **`StreamContext`**: owns the registry and both engines
//!
//! ## Usage
//!
//! ```rust,ignore
//! use camlink_core::{Backends, Config, Protocol, StreamContext, StreamKey};
//!
//! let config = Config::load(Some("camlink.toml"))?;
//! let ctx = StreamContext::create(config.policies(), Backends::from_config(&config)?);
//!
//! let handle = ctx.handle(StreamKey::from("https://cams.example.com/lobby/index.m3u8"), Protocol::Adaptive);
//! handle.connect(Some(sink))?;
//! println!("{}", handle.status());
//! ```

pub mod adaptive;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod logging;
pub mod media;
pub mod negotiated;
pub mod registry;
pub mod resources;
pub mod retry;
pub mod state;
pub mod stats;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use adaptive::{AdaptiveBackend, AdaptiveEngine, AdaptiveSession, HlsBackend};
pub use config::{Config, PolicyStore, ReconnectPolicy, StreamPolicies};
pub use context::{Backends, StreamContext};
pub use error::{StreamError, StreamResult};
pub use facade::StreamHandle;
pub use media::{MediaHandle, MediaSegment, MediaSink, MediaSource, PlaybackOptions, SinkEvent};
pub use negotiated::{NegotiatedEngine, Negotiator, PeerFactory, PeerSession, WebRtcPeerFactory, WhepClient};
pub use registry::{StateChange, StreamRegistry};
pub use retry::RetryScheduler;
pub use state::{
    AdaptiveState, AdaptiveStatus, NegotiatedState, NegotiatedStatus, StatePatch, StreamState,
    StreamStats, StreamStatus,
};
pub use types::{Protocol, StreamKey};
