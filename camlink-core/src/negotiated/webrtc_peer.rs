//! webrtc-rs backed peer sessions

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use super::peer::{PeerFactory, PeerSession, PeerState};
use super::track::RemoteTrack;
use crate::config::WebRtcConfig;
use crate::error::{StreamError, StreamResult};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Builds receive-only peer connections with default codecs and interceptors
pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(config: &WebRtcConfig) -> StreamResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self) -> StreamResult<Arc<dyn PeerSession>> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await?;
        }

        let (states, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (tracks, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let state_tx = states.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(?state, "Peer connection state changed");
            let _ = state_tx.send(PeerState::from(state));
            Box::pin(async {})
        }));

        let track_tx = tracks.clone();
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let _ = track_tx.send(RemoteTrack::from_webrtc(remote));
            Box::pin(async {})
        }));

        debug!("Peer session created");
        Ok(Arc::new(WebRtcPeerSession {
            pc,
            states,
            tracks,
            closed: AtomicBool::new(false),
        }))
    }
}

/// One receive-only peer connection
pub struct WebRtcPeerSession {
    pc: Arc<RTCPeerConnection>,
    states: broadcast::Sender<PeerState>,
    tracks: broadcast::Sender<RemoteTrack>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerSession for WebRtcPeerSession {
    async fn create_offer(&self) -> StreamResult<String> {
        let offer = self.pc.create_offer(None).await?;

        // Non-trickle: the offer carries every gathered candidate
        let mut gathering_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;
        let _ = gathering_complete.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| StreamError::Peer("no local description after gathering".to_string()))?;
        Ok(local.sdp)
    }

    async fn set_remote_answer(&self, sdp: &str) -> StreamResult<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer).await?;
        info!("Remote answer applied");
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pc = Arc::clone(&self.pc);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = pc.close().await {
                        warn!(error = %e, "Failed to close peer connection");
                    }
                });
            }
            Err(_) => warn!("No runtime available, peer connection dropped without close"),
        }
    }

    fn connection_states(&self) -> broadcast::Receiver<PeerState> {
        self.states.subscribe()
    }

    fn tracks(&self) -> broadcast::Receiver<RemoteTrack> {
        self.tracks.subscribe()
    }
}

impl Drop for WebRtcPeerSession {
    fn drop(&mut self) {
        self.close();
    }
}
