use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const ROOM_ID_LEN: usize = 9;
const ROOM_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh room code for a newly created meeting.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..ROOM_ID_LEN)
            .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated `join(roomId, displayName)` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_id: RoomId,
    pub display_name: String,
}

impl JoinRequest {
    pub fn new(room_id: &str, display_name: &str) -> Result<Self> {
        let room_id = room_id.trim();
        let display_name = display_name.trim();
        if room_id.is_empty() {
            return Err(Error::InvalidJoin("room id is empty".to_string()));
        }
        if display_name.is_empty() {
            return Err(Error::InvalidJoin("display name is empty".to_string()));
        }
        Ok(Self {
            room_id: RoomId::new(room_id),
            display_name: display_name.to_string(),
        })
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "mesh-meeting-client", about = "Headless full-mesh meeting client")]
pub struct ClientConfig {
    /// WebSocket URL of the signaling relay
    #[arg(long, env = "MESH_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay_url: String,

    /// Room to join; a new room code is generated when omitted
    #[arg(long, env = "MESH_ROOM")]
    pub room: Option<String>,

    #[arg(long, env = "MESH_DISPLAY_NAME", default_value = "Guest")]
    pub name: String,

    #[arg(long = "ice-server", env = "MESH_ICE_SERVERS", value_delimiter = ',', default_value = DEFAULT_STUN_SERVER)]
    pub ice_servers: Vec<String>,

    /// Join without camera or microphone
    #[arg(long, env = "MESH_RECEIVE_ONLY", default_value = "false")]
    pub receive_only: bool,

    #[arg(long, env = "MESH_MAX_RECONNECT_ATTEMPTS", default_value = "5")]
    pub max_reconnect_attempts: u32,

    #[arg(long, env = "MESH_RECONNECT_DELAY_MS", default_value = "1000")]
    pub reconnect_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            room: None,
            name: "Guest".to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            receive_only: false,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

impl ClientConfig {
    pub fn join_request(&self) -> Result<JoinRequest> {
        let room = match &self.room {
            Some(room) => RoomId::new(room.clone()),
            None => RoomId::generate(),
        };
        JoinRequest::new(room.as_str(), &self.name)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
