use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::config::RoomId;
use crate::error::{Error, Result};

const INBOUND_CHANNEL_BOUND: usize = 100;

/// Relay-assigned identifier of one connected endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in the shape browsers exchange (`{type, sdp}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Whether the author of this description intends to send media.
    pub fn advertises_outbound_media(&self) -> bool {
        self.sdp
            .lines()
            .map(str::trim)
            .any(|line| line == "a=sendrecv" || line == "a=sendonly")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Messages this endpoint sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(rename = "displayName")]
        display_name: String,
    },
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    Offer {
        to: ParticipantId,
        #[serde(rename = "sdpOffer")]
        sdp_offer: SessionDescription,
    },
    Answer {
        to: ParticipantId,
        #[serde(rename = "sdpAnswer")]
        sdp_answer: SessionDescription,
    },
    IceCandidate {
        to: ParticipantId,
        candidate: IceCandidate,
    },
    Chat {
        #[serde(rename = "displayName")]
        display_name: String,
        message: String,
    },
    Draw {
        command: serde_json::Value,
    },
    Clear,
}

/// Messages the relay delivers to this endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    PeerJoined {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
        #[serde(rename = "displayName", default)]
        display_name: String,
    },
    PeerLeft {
        #[serde(rename = "participantId")]
        participant_id: ParticipantId,
    },
    UsersList {
        participants: BTreeMap<ParticipantId, String>,
    },
    Offer {
        from: ParticipantId,
        #[serde(rename = "sdpOffer")]
        sdp_offer: SessionDescription,
    },
    Answer {
        from: ParticipantId,
        #[serde(rename = "sdpAnswer")]
        sdp_answer: SessionDescription,
    },
    IceCandidate {
        from: ParticipantId,
        candidate: IceCandidate,
    },
    /// Relays that stamp the sender themselves may omit the name.
    Chat {
        #[serde(rename = "displayName", default)]
        display_name: String,
        message: String,
    },
    Draw {
        command: serde_json::Value,
    },
    Clear,
    Error {
        message: String,
    },
}

/// What the relay connection delivers to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(RelayMessage),
    Closed,
}

/// Outbound half of the signaling channel. Sending never blocks.
pub trait SignalingSink: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<()>;
}

/// WebSocket connection to the relay.
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<ChannelEvent>)> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("Connected to relay at {}", url);
        let (mut write, mut read) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_BOUND);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Dropping unserializable signaling message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(msg) => {
                            if inbound_tx.send(ChannelEvent::Message(msg)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!("Ignoring unrecognised relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay read failed: {}", e);
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(ChannelEvent::Closed).await;
        });

        Ok((Self { tx: outgoing_tx }, inbound_rx))
    }
}

impl SignalingSink for SignalingClient {
    fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::ChannelClosed)
    }
}
