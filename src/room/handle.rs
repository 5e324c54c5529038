use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::room::registry::RemoteStreams;
use crate::room::session::{Command, RoomNotice, RoomSession};
use crate::signaling::{ChannelEvent, SignalingSink};

/// How a relay reconnection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    Restored,
    Interrupted,
}

/// Cloneable front end to a session running on its own task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    streams: watch::Receiver<RemoteStreams>,
    notices: broadcast::Sender<RoomNotice>,
}

impl SessionHandle {
    /// Moves `session` onto a task fed by `inbound` relay events.
    pub fn spawn(
        session: RoomSession,
        inbound: mpsc::Receiver<ChannelEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let handle = Self {
            commands,
            streams: session.remote_streams(),
            notices: session.notice_sender(),
        };
        let task = tokio::spawn(session.run(inbound, command_rx));
        (handle, task)
    }

    /// Live view of the Remote Stream Registry.
    pub fn remote_streams(&self) -> watch::Receiver<RemoteStreams> {
        self.streams.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<RoomNotice> {
        self.notices.subscribe()
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<bool> {
        self.request(|reply| Command::SetMicrophone { enabled, reply })
            .await
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<bool> {
        self.request(|reply| Command::SetCamera { enabled, reply })
            .await
    }

    pub async fn toggle_microphone(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleMicrophone { reply }).await
    }

    pub async fn toggle_camera(&self) -> Result<bool> {
        self.request(|reply| Command::ToggleCamera { reply }).await
    }

    pub async fn send_chat(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.request(|reply| Command::SendChat { message, reply })
            .await?
    }

    pub async fn draw(&self, command: serde_json::Value) -> Result<()> {
        self.request(|reply| Command::Draw { command, reply }).await?
    }

    pub async fn clear_board(&self) -> Result<()> {
        self.request(|reply| Command::ClearBoard { reply }).await?
    }

    /// Hands a reconnected relay channel to the session.
    pub async fn restore_channel(
        &self,
        sink: Box<dyn SignalingSink>,
        inbound: mpsc::Receiver<ChannelEvent>,
    ) -> Result<()> {
        self.request(|reply| Command::RestoreRelay {
            sink,
            inbound,
            reply,
        })
        .await?
    }

    /// Retries `connect` with a fixed delay until one attempt is restored
    /// into the session. Gives up early once `shutdown` resolves.
    pub async fn reconnect_relay<C, F, S>(
        &self,
        attempts: u32,
        delay: Duration,
        shutdown: S,
        mut connect: C,
    ) -> Result<Reconnect>
    where
        C: FnMut() -> F,
        F: Future<Output = Result<(Box<dyn SignalingSink>, mpsc::Receiver<ChannelEvent>)>>,
        S: Future,
    {
        tokio::pin!(shutdown);
        for attempt in 1..=attempts {
            let connected = tokio::select! {
                biased;
                _ = &mut shutdown => return Ok(Reconnect::Interrupted),
                connected = async {
                    sleep(delay).await;
                    info!("Reconnecting to relay (attempt {}/{})", attempt, attempts);
                    connect().await
                } => connected,
            };
            match connected {
                Ok((sink, inbound)) => {
                    self.restore_channel(sink, inbound).await?;
                    return Ok(Reconnect::Restored);
                }
                Err(e) => warn!("Reconnection failed: {}", e),
            }
        }
        Err(Error::Signaling(format!(
            "max reconnection attempts ({}) reached",
            attempts
        )))
    }

    /// Leaves the room. Succeeds if the session is already gone.
    pub async fn leave(&self) -> Result<()> {
        match self.request(|reply| Command::Leave { reply }).await {
            Ok(()) | Err(Error::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(command(reply)).is_err() {
            debug!("Session task already finished");
            return Err(Error::SessionClosed);
        }
        rx.await.map_err(|_| Error::SessionClosed)
    }
}
