use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::error::{Error, Result};

/// Negotiation state of one PeerLink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::New => write!(f, "new"),
            NegotiationState::HaveLocalOffer => write!(f, "have-local-offer"),
            NegotiationState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            NegotiationState::Negotiating => write!(f, "negotiating"),
            NegotiationState::Connected => write!(f, "connected"),
            NegotiationState::Closed => write!(f, "closed"),
            NegotiationState::Failed => write!(f, "failed"),
        }
    }
}

/// Everything that may move a PeerLink between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationInput {
    /// Local offer created, set and sent.
    OfferSent,
    /// Remote offer applied and the local answer sent.
    AnswerSent,
    /// Remote answer applied on the offering side.
    AnswerApplied,
    /// Transport started connectivity checks.
    ConnectivityChecking,
    /// Inbound media confirmed flowing.
    MediaFlowing,
    TransportFailed,
    Close,
}

impl NegotiationState {
    /// Returns the state reached by applying `input`, or the rejected transition.
    pub fn apply(self, input: NegotiationInput) -> Result<NegotiationState> {
        use NegotiationInput as I;
        use NegotiationState as S;

        let next = match (self, input) {
            (S::Closed | S::Failed, _) => None,
            (_, I::Close) => Some(S::Closed),
            (_, I::TransportFailed) => Some(S::Failed),
            (S::New, I::OfferSent) => Some(S::HaveLocalOffer),
            (S::New, I::AnswerSent) => Some(S::HaveRemoteOffer),
            (S::HaveLocalOffer, I::AnswerApplied) => Some(S::Negotiating),
            (S::HaveRemoteOffer, I::ConnectivityChecking) => Some(S::Negotiating),
            (S::Negotiating, I::ConnectivityChecking) => Some(S::Negotiating),
            (S::Negotiating, I::MediaFlowing) => Some(S::Connected),
            _ => None,
        };

        next.ok_or(Error::InvalidTransition { from: self, input })
    }
}

/// Connectivity of the underlying transport, as reported by its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::New => write!(f, "New"),
            TransportState::Connecting => write!(f, "Connecting"),
            TransportState::Connected => write!(f, "Connected"),
            TransportState::Disconnected => write!(f, "Disconnected"),
            TransportState::Failed => write!(f, "Failed"),
            TransportState::Closed => write!(f, "Closed"),
        }
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}
