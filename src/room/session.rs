//! Room Session Controller.
//!
//! Owns the local media, the PeerLink arena and the Remote Stream Registry
//! and is the only writer of any of them. All handlers run on the
//! controller task one at a time; asynchronous negotiation steps run on the
//! per-link workers and report back through [`LinkEvent`]s.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{JoinRequest, RoomId};
use crate::connection::{NegotiationInput, NegotiationState, TransportState};
use crate::error::{Error, Result};
use crate::media::{LocalMediaSource, MediaDevices, MediaRequest};
use crate::room::link::{LinkEvent, LinkEventKind, LinkEventSink, LinkOp, LinkWorker, TransportEvent};
use crate::room::registry::{
    RemoteStreamRegistry, RemoteStreamUpdate, RemoteStreams, PLACEHOLDER_NAME,
};
use crate::room::state::{LinkRole, PeerLink, PeerMap};
use crate::signaling::{
    ChannelEvent, ClientMessage, IceCandidate, ParticipantId, RelayMessage, SessionDescription,
    SignalingSink,
};
use crate::transport::PeerTransportFactory;

const NOTICE_CHANNEL_BOUND: usize = 64;

/// Room activity published to the UI alongside the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomNotice {
    Chat {
        display_name: String,
        message: String,
    },
    Participants(BTreeMap<ParticipantId, String>),
    Draw(serde_json::Value),
    BoardCleared,
    PeerFailed {
        participant: ParticipantId,
        reason: String,
    },
    RelayError(String),
    RelayLost,
    RelayRestored,
}

/// UI requests serviced by the controller task.
pub enum Command {
    SetMicrophone {
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    SetCamera {
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    ToggleMicrophone {
        reply: oneshot::Sender<bool>,
    },
    ToggleCamera {
        reply: oneshot::Sender<bool>,
    },
    SendChat {
        message: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Draw {
        command: serde_json::Value,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearBoard {
        reply: oneshot::Sender<Result<()>>,
    },
    RestoreRelay {
        sink: Box<dyn SignalingSink>,
        inbound: mpsc::Receiver<ChannelEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct RoomSession {
    request: JoinRequest,
    factory: Arc<dyn PeerTransportFactory>,
    signaling: Option<Box<dyn SignalingSink>>,
    media: LocalMediaSource,
    links: PeerMap,
    registry: RemoteStreamRegistry,
    directory: BTreeMap<ParticipantId, String>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    notices: broadcast::Sender<RoomNotice>,
    left: bool,
}

impl RoomSession {
    /// Acquires local media (falling back to receive-only) and announces the join.
    pub async fn join(
        request: JoinRequest,
        devices: &dyn MediaDevices,
        factory: Arc<dyn PeerTransportFactory>,
        signaling: Box<dyn SignalingSink>,
    ) -> Result<Self> {
        let media = LocalMediaSource::acquire_or_empty(devices, MediaRequest::default()).await;
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_BOUND);

        let session = Self {
            request,
            factory,
            signaling: Some(signaling),
            media,
            links: PeerMap::new(),
            registry: RemoteStreamRegistry::new(),
            directory: BTreeMap::new(),
            link_tx,
            link_rx,
            notices,
            left: false,
        };
        session.send(session.join_announcement())?;
        info!(
            "Joined room {} as {}",
            session.request.room_id, session.request.display_name
        );
        Ok(session)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.request.room_id
    }

    pub fn display_name(&self) -> &str {
        &self.request.display_name
    }

    pub fn links(&self) -> &PeerMap {
        &self.links
    }

    pub fn link(&self, participant: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(participant)
    }

    pub fn registry(&self) -> &RemoteStreamRegistry {
        &self.registry
    }

    pub fn remote_streams(&self) -> watch::Receiver<RemoteStreams> {
        self.registry.subscribe()
    }

    pub fn media(&self) -> &LocalMediaSource {
        &self.media
    }

    pub fn directory(&self) -> &BTreeMap<ParticipantId, String> {
        &self.directory
    }

    pub fn notices(&self) -> broadcast::Receiver<RoomNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn notice_sender(&self) -> broadcast::Sender<RoomNotice> {
        self.notices.clone()
    }

    pub fn has_left(&self) -> bool {
        self.left
    }

    pub fn relay_connected(&self) -> bool {
        self.signaling.is_some()
    }

    /// Waits for the next result or callback from a link worker.
    pub async fn next_link_event(&mut self) -> Option<LinkEvent> {
        self.link_rx.recv().await
    }

    /// Serves relay events, link events and commands until `leave`.
    pub async fn run(
        mut self,
        inbound: mpsc::Receiver<ChannelEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut inbound = Some(inbound);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command, &mut inbound) == Flow::Stop {
                            break;
                        }
                    }
                    None => {
                        self.leave();
                        break;
                    }
                },
                event = next_channel_event(&mut inbound) => match event {
                    Some(ChannelEvent::Message(msg)) => self.handle_relay_message(msg),
                    Some(ChannelEvent::Closed) | None => {
                        inbound = None;
                        self.relay_lost();
                    }
                },
                Some(event) = self.link_rx.recv() => self.handle_link_event(event),
            }
        }
        debug!("Session loop for room {} finished", self.request.room_id);
    }

    /// Services one command. A restored relay replaces `inbound`.
    fn handle_command(
        &mut self,
        command: Command,
        inbound: &mut Option<mpsc::Receiver<ChannelEvent>>,
    ) -> Flow {
        match command {
            Command::SetMicrophone { enabled, reply } => {
                let _ = reply.send(self.media.set_audio_enabled(enabled));
            }
            Command::SetCamera { enabled, reply } => {
                let _ = reply.send(self.media.set_video_enabled(enabled));
            }
            Command::ToggleMicrophone { reply } => {
                let _ = reply.send(self.media.toggle_audio());
            }
            Command::ToggleCamera { reply } => {
                let _ = reply.send(self.media.toggle_video());
            }
            Command::SendChat { message, reply } => {
                let _ = reply.send(self.send_chat(&message));
            }
            Command::Draw { command, reply } => {
                let _ = reply.send(self.send(ClientMessage::Draw { command }));
            }
            Command::ClearBoard { reply } => {
                let _ = reply.send(self.send(ClientMessage::Clear));
            }
            Command::RestoreRelay {
                sink,
                inbound: restored,
                reply,
            } => {
                let result = self.restore_relay(sink);
                if result.is_ok() {
                    *inbound = Some(restored);
                }
                let _ = reply.send(result);
            }
            Command::Leave { reply } => {
                self.leave();
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    pub fn send_chat(&self, message: &str) -> Result<()> {
        let message = message.trim();
        if message.is_empty() {
            return Ok(());
        }
        self.send(ClientMessage::Chat {
            display_name: self.request.display_name.clone(),
            message: message.to_string(),
        })
    }

    pub fn handle_relay_message(&mut self, msg: RelayMessage) {
        if self.left {
            debug!("Session left; ignoring relay message");
            return;
        }
        match msg {
            RelayMessage::PeerJoined {
                participant_id,
                display_name,
            } => self.on_peer_joined(participant_id, display_name),
            RelayMessage::PeerLeft { participant_id } => self.on_peer_left(&participant_id),
            RelayMessage::UsersList { participants } => self.on_users_list(participants),
            RelayMessage::Offer { from, sdp_offer } => self.on_offer(from, sdp_offer),
            RelayMessage::Answer { from, sdp_answer } => self.on_answer(&from, sdp_answer),
            RelayMessage::IceCandidate { from, candidate } => {
                self.on_remote_candidate(&from, candidate)
            }
            RelayMessage::Chat {
                display_name,
                message,
            } => {
                let display_name = if display_name.trim().is_empty() {
                    PLACEHOLDER_NAME.to_string()
                } else {
                    display_name
                };
                self.publish(RoomNotice::Chat {
                    display_name,
                    message,
                })
            }
            RelayMessage::Draw { command } => self.publish(RoomNotice::Draw(command)),
            RelayMessage::Clear => self.publish(RoomNotice::BoardCleared),
            RelayMessage::Error { message } => {
                warn!("Relay reported an error: {}", message);
                self.publish(RoomNotice::RelayError(message));
            }
        }
    }

    fn on_peer_joined(&mut self, participant: ParticipantId, display_name: String) {
        self.remember_name(&participant, display_name);
        if self.links.contains(&participant) {
            debug!("Already linked to {}; ignoring peer-joined", participant);
            return;
        }
        info!("Participant {} joined; sending offer", participant);
        let link = self.new_link(participant, LinkRole::Offerer);
        link.enqueue(LinkOp::CreateOffer);
        self.links.insert(link);
    }

    fn on_offer(&mut self, from: ParticipantId, offer: SessionDescription) {
        if let Some(link) = self.links.get(&from) {
            warn!(
                "Discarding offer from {}: link already exists in state {}",
                from,
                link.state()
            );
            return;
        }
        info!("Offer from {}; answering", from);
        let remote_sends_media = offer.advertises_outbound_media();
        let mut link = self.new_link(from, LinkRole::Answerer);
        link.apply_remote_description(LinkOp::AcceptOffer(offer), remote_sends_media);
        self.links.insert(link);
    }

    fn on_answer(&mut self, from: &ParticipantId, answer: SessionDescription) {
        let Some(link) = self.links.get_mut(from) else {
            debug!("Stale answer from {}; no live link", from);
            return;
        };
        if let Err(e) = link.state().apply(NegotiationInput::AnswerApplied) {
            warn!("Discarding answer from {}: {}", from, e);
            return;
        }
        if link.has_remote_description_pending() {
            warn!("Discarding duplicate answer from {}", from);
            return;
        }
        let remote_sends_media = answer.advertises_outbound_media();
        link.apply_remote_description(LinkOp::AcceptAnswer(answer), remote_sends_media);
    }

    fn on_remote_candidate(&mut self, from: &ParticipantId, candidate: IceCandidate) {
        match self.links.get_mut(from) {
            Some(link) => link.offer_candidate(candidate),
            None => debug!("Stale candidate from {}; no live link", from),
        }
    }

    fn on_peer_left(&mut self, participant: &ParticipantId) {
        self.directory.remove(participant);
        if self.destroy_link(participant, NegotiationInput::Close) {
            info!("Participant {} left", participant);
        } else {
            debug!("peer-left for unknown participant {}", participant);
        }
    }

    fn on_users_list(&mut self, participants: BTreeMap<ParticipantId, String>) {
        for (participant, name) in &participants {
            self.remember_name(participant, name.clone());
        }
        self.directory.retain(|id, _| participants.contains_key(id));
        self.publish(RoomNotice::Participants(participants));
    }

    /// Records a non-empty name and reconciles it into an existing registry entry.
    fn remember_name(&mut self, participant: &ParticipantId, name: String) {
        if name.trim().is_empty() {
            return;
        }
        if self.registry.get(participant).is_some() && self.links.contains(participant) {
            self.registry
                .upsert(participant, RemoteStreamUpdate::name(name.clone()));
        }
        self.directory.insert(participant.clone(), name);
    }

    /// Spawns the worker for a new link. The caller queues its first step
    /// and inserts it into the arena.
    fn new_link(&mut self, participant: ParticipantId, role: LinkRole) -> PeerLink {
        let epoch = self.links.next_epoch();
        let sink = LinkEventSink::new(participant.clone(), epoch, self.link_tx.clone());
        let tracks = self.media.tracks();
        let worker = LinkWorker::spawn(Arc::clone(&self.factory), tracks.clone(), sink);
        debug!("Created {:?} link to {} (epoch {})", role, participant, epoch);
        PeerLink::new(participant, epoch, role, tracks, worker)
    }

    /// Removes the link and its registry entry. Dropping the link cancels
    /// its pending steps and closes the connection.
    fn destroy_link(&mut self, participant: &ParticipantId, input: NegotiationInput) -> bool {
        let Some(mut link) = self.links.remove(participant) else {
            return false;
        };
        if let Err(e) = link.advance(input) {
            debug!("Destroying link to {}: {}", participant, e);
        }
        self.registry.remove(participant);
        true
    }

    fn fail_link(&mut self, participant: &ParticipantId, reason: String) {
        warn!("Negotiation with {} failed: {}", participant, reason);
        if self.destroy_link(participant, NegotiationInput::TransportFailed) {
            self.publish(RoomNotice::PeerFailed {
                participant: participant.clone(),
                reason,
            });
        }
    }

    pub fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            participant,
            epoch,
            kind,
        } = event;
        if self.left {
            return;
        }
        let Some(link) = self.links.current_mut(&participant, epoch) else {
            debug!(
                "Discarding result for {} from retired link epoch {}",
                participant, epoch
            );
            return;
        };

        match kind {
            LinkEventKind::OfferCreated(offer) => {
                if let Err(e) = link.advance(NegotiationInput::OfferSent) {
                    warn!("Offer for {} not sent: {}", participant, e);
                    return;
                }
                let held = link.local_description_sent();
                self.signal(ClientMessage::Offer {
                    to: participant.clone(),
                    sdp_offer: offer,
                });
                self.signal_candidates(&participant, held);
            }
            LinkEventKind::AnswerCreated(answer) => {
                link.remote_description_applied();
                if let Err(e) = link.advance(NegotiationInput::AnswerSent) {
                    warn!("Answer for {} not sent: {}", participant, e);
                    return;
                }
                let held = link.local_description_sent();
                self.signal(ClientMessage::Answer {
                    to: participant.clone(),
                    sdp_answer: answer,
                });
                self.signal_candidates(&participant, held);
            }
            LinkEventKind::AnswerApplied => {
                link.remote_description_applied();
                if let Err(e) = link.advance(NegotiationInput::AnswerApplied) {
                    warn!("Answer from {} rejected: {}", participant, e);
                    return;
                }
                link.try_confirm_media();
            }
            LinkEventKind::CandidateRejected(reason) => {
                warn!("Candidate from {} rejected: {}", participant, reason);
            }
            LinkEventKind::StepFailed(reason) => self.fail_link(&participant, reason),
            LinkEventKind::Transport(TransportEvent::LocalCandidate(candidate)) => {
                if let Some(candidate) = link.local_candidate(candidate) {
                    self.signal_candidates(&participant, vec![candidate]);
                }
            }
            LinkEventKind::Transport(TransportEvent::TrackReceived(track)) => {
                debug!("{:?} track {} from {}", track.kind, track.id, participant);
                link.inbound_mut().push(track);
                let media = link.inbound().clone();
                if link.try_confirm_media() == Some(NegotiationState::Connected) {
                    info!("Media from {} is flowing", participant);
                }
                let name = self.directory.get(&participant).cloned();
                self.registry.upsert(
                    &participant,
                    RemoteStreamUpdate {
                        media: Some(media),
                        name,
                    },
                );
            }
            LinkEventKind::Transport(TransportEvent::StateChanged(state)) => {
                self.on_transport_state(&participant, epoch, state)
            }
        }
    }

    fn on_transport_state(&mut self, participant: &ParticipantId, epoch: u64, state: TransportState) {
        let Some(link) = self.links.current_mut(participant, epoch) else {
            return;
        };
        match state {
            TransportState::Connecting | TransportState::Connected => {
                if link.state() == NegotiationState::HaveRemoteOffer {
                    let _ = link.advance(NegotiationInput::ConnectivityChecking);
                }
                if state == TransportState::Connected {
                    link.set_transport_connected(true);
                    link.try_confirm_media();
                }
            }
            TransportState::Disconnected => {
                warn!("Connection to {} interrupted", participant);
                link.set_transport_connected(false);
            }
            TransportState::Failed => {
                self.fail_link(participant, "connectivity checks failed".to_string())
            }
            TransportState::Closed => {
                self.fail_link(participant, "connection closed unexpectedly".to_string())
            }
            TransportState::New => {}
        }
    }

    fn signal_candidates(&self, participant: &ParticipantId, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            self.signal(ClientMessage::IceCandidate {
                to: participant.clone(),
                candidate,
            });
        }
    }

    fn join_announcement(&self) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: self.request.room_id.clone(),
            display_name: self.request.display_name.clone(),
        }
    }

    fn send(&self, msg: ClientMessage) -> Result<()> {
        match &self.signaling {
            Some(sink) => sink.send(msg),
            None => Err(Error::ChannelClosed),
        }
    }

    /// Best-effort send; a missing relay is logged, not reported.
    fn signal(&self, msg: ClientMessage) {
        if let Err(e) = self.send(msg) {
            warn!("Signaling message dropped: {}", e);
        }
    }

    fn publish(&self, notice: RoomNotice) {
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    /// Relay connection lost. Existing media connections stay up.
    pub fn relay_lost(&mut self) {
        if self.signaling.take().is_some() {
            warn!(
                "Relay connection lost; {} peer link(s) kept, membership updates paused",
                self.links.len()
            );
            self.publish(RoomNotice::RelayLost);
        }
    }

    /// Attaches a reconnected relay and re-announces the join.
    pub fn restore_relay(&mut self, sink: Box<dyn SignalingSink>) -> Result<()> {
        if self.left {
            return Err(Error::SessionClosed);
        }
        sink.send(self.join_announcement())?;
        self.signaling = Some(sink);
        info!("Relay connection restored for room {}", self.request.room_id);
        self.publish(RoomNotice::RelayRestored);
        Ok(())
    }

    /// Tears down every link, releases local media and announces the leave.
    /// Calling it again is a no-op.
    pub fn leave(&mut self) {
        if self.left {
            debug!("leave() on a session that already left");
            return;
        }
        self.left = true;

        for mut link in self.links.drain() {
            let _ = link.advance(NegotiationInput::Close);
            self.registry.remove(link.participant());
        }
        self.registry.clear();
        self.media.release();

        self.signal(ClientMessage::LeaveRoom {
            room_id: self.request.room_id.clone(),
        });
        self.signaling = None;
        info!("Left room {}", self.request.room_id);
    }
}

async fn next_channel_event(
    inbound: &mut Option<mpsc::Receiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
