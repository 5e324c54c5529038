use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::connection::{NegotiationInput, NegotiationState};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Camera or microphone could not be opened. Never fatal for a session.
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("Rejected transition {input:?} in state {from:?}")]
    InvalidTransition {
        from: NegotiationState,
        input: NegotiationInput,
    },

    #[error("Invalid join request: {0}")]
    InvalidJoin(String),

    #[error("Room session already closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
