pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod room;
pub mod signaling;
pub mod transport;

pub use config::{ClientConfig, JoinRequest, RoomId};
pub use error::{Error, Result};
pub use room::{RoomNotice, RoomSession, SessionHandle};
