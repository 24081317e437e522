//! WebRTC peer connection backing a call session.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parley_common::{CallConfigResponse, IceCandidate, SdpType, SessionDescription};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::session::{PeerConnection, PeerState, SessionEvent};

const STREAM_ID: &str = "parley";

pub fn ice_servers(config: &CallConfigResponse) -> Vec<RTCIceServer> {
    config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => return Err(anyhow!("rollback descriptions are not supported")),
    };
    Ok(rtc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => return Err(anyhow!("unspecified session description type")),
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

fn sample_track(mime_type: &str, id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            ..Default::default()
        },
        id.to_string(),
        STREAM_ID.to_string(),
    ))
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    gathered: watch::Receiver<bool>,
    media_senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    screen_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl WebRtcPeer {
    /// Builds a peer connection with microphone and camera tracks and wires
    /// its callbacks into the session's event queue.
    pub async fn new(config: &CallConfigResponse, events: mpsc::Sender<SessionEvent>) -> Result<Self> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: ice_servers(config),
                ..Default::default()
            })
            .await?,
        );

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(SessionEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }))
                            .await;
                    }
                    Err(err) => warn!("failed to serialize local ICE candidate: {}", err),
                }
            })
        }));

        let (gathered_tx, gathered_rx) = watch::channel(false);
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            debug!(?state, "ICE gathering state");
            if state == RTCIceGathererState::Complete {
                gathered_tx.send_replace(true);
            }
            Box::pin(async {})
        }));

        let state_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let _ = tx.send(SessionEvent::PeerState(peer_state(state))).await;
            })
        }));

        let mut media_senders = Vec::new();
        for track in [sample_track(MIME_TYPE_OPUS, "audio"), sample_track(MIME_TYPE_VP8, "camera")] {
            let sender = pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>).await?;
            media_senders.push(sender);
        }

        Ok(Self {
            pc,
            gathered: gathered_rx,
            media_senders: Mutex::new(media_senders),
            screen_sender: Mutex::new(None),
        })
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc_description(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn gathering_complete(&self) {
        let mut gathered = self.gathered.clone();
        let _ = gathered.wait_for(|done| *done).await;
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc_description(desc).ok()
    }

    async fn start_screen_share(&self) -> Result<()> {
        let mut screen = self.screen_sender.lock().await;
        if screen.is_some() {
            return Ok(());
        }
        let track = sample_track(MIME_TYPE_VP8, "screen");
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        *screen = Some(sender);
        Ok(())
    }

    async fn stop_screen_share(&self) -> Result<()> {
        let Some(sender) = self.screen_sender.lock().await.take() else {
            return Ok(());
        };
        self.pc.remove_track(&sender).await?;
        Ok(())
    }

    async fn release_media(&self) {
        let mut senders: Vec<_> = self.media_senders.lock().await.drain(..).collect();
        senders.extend(self.screen_sender.lock().await.take());
        for sender in senders {
            if let Err(err) = sender.stop().await {
                debug!("failed to stop local track: {}", err);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
