use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use super::track::RemoteTrack;
use crate::error::StreamResult;

/// Connectivity of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

/// A receive-only peer session
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Create the local offer; resolves once candidate gathering completes
    async fn create_offer(&self) -> StreamResult<String>;

    async fn set_remote_answer(&self, sdp: &str) -> StreamResult<()>;

    /// Close the session. Idempotent; never blocks.
    fn close(&self);

    fn connection_states(&self) -> broadcast::Receiver<PeerState>;

    /// Remote tracks as they arrive
    fn tracks(&self) -> broadcast::Receiver<RemoteTrack>;
}

/// Creates peer sessions with receive-only audio and video transceivers
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self) -> StreamResult<Arc<dyn PeerSession>>;
}

/// Offer/answer exchange with a negotiation endpoint
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Send `offer` to `endpoint` and return the answer SDP
    async fn exchange(&self, endpoint: &Url, offer: &str) -> StreamResult<String>;
}
