//! Room membership and the full mesh of peer links.

pub mod handle;
pub mod link;
pub mod registry;
pub mod session;
pub mod state;

pub use handle::{Reconnect, SessionHandle};
pub use registry::{RemoteStreamEntry, RemoteStreamRegistry, RemoteStreams, PLACEHOLDER_NAME};
pub use session::{Command, RoomNotice, RoomSession};
pub use state::{LinkRole, PeerLink, PeerMap};
