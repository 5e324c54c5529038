use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::TransportState;
use crate::error::{Error, Result};
use crate::media::LocalTrack;
use crate::room::link::{LinkEventSink, TransportEvent};
use crate::room::registry::RemoteTrack;
use crate::signaling::{IceCandidate, ParticipantId, SdpKind, SessionDescription};

/// One negotiated media connection to a remote participant.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and sets it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Applies a remote offer, then creates and sets the local answer.
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds transports with the local tracks already attached. Transport
/// callbacks are reported through `events`.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        participant: &ParticipantId,
        tracks: Vec<LocalTrack>,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerTransport>>;
}

pub struct WebRtcPeerFactory {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        participant: &ParticipantId,
        tracks: Vec<LocalTrack>,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        for local in &tracks {
            let sender = peer_connection
                .add_track(local.track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // RTCP must be drained for the interceptors to work
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(TransportEvent::LocalCandidate(init.into())),
                    Err(e) => warn!("Could not serialize local candidate: {}", e),
                }
            })
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    events.emit(TransportEvent::TrackReceived(RemoteTrack::from_remote(track)));
                })
            },
        ));

        let state_events = events.clone();
        let peer = participant.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let events = state_events.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    debug!("Peer connection to {} is {}", peer, s);
                    events.emit(TransportEvent::StateChanged(TransportState::from(s)));
                })
            },
        ));

        info!(
            "Created peer connection to {} with {} local track(s)",
            participant,
            tracks.len()
        );
        Ok(Arc::new(WebRtcPeer { peer_connection }))
    }
}

pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    fn expect_kind(desc: &SessionDescription, kind: SdpKind) -> Result<()> {
        if desc.kind != kind {
            return Err(Error::Signaling(format!(
                "expected {:?} description, got {:?}",
                kind, desc.kind
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        Self::expect_kind(&offer, SdpKind::Offer)?;
        let offer = RTCSessionDescription::offer(offer.sdp)?;
        self.peer_connection.set_remote_description(offer).await?;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        Self::expect_kind(&answer, SdpKind::Answer)?;
        let answer = RTCSessionDescription::answer(answer.sdp)?;
        self.peer_connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
