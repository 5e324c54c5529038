#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use mesh_meeting::config::JoinRequest;
use mesh_meeting::connection::{NegotiationState, TransportState};
use mesh_meeting::error::{Error, Result};
use mesh_meeting::media::{LocalTrack, MediaDevices, MediaKind, NoDevices, SampleTrackDevices};
use mesh_meeting::room::link::{LinkEventSink, TransportEvent};
use mesh_meeting::room::registry::RemoteTrack;
use mesh_meeting::room::RoomSession;
use mesh_meeting::signaling::{
    ClientMessage, IceCandidate, ParticipantId, RelayMessage, SessionDescription, SignalingSink,
};
use mesh_meeting::transport::{PeerTransport, PeerTransportFactory};

pub const ROOM: &str = "r00m";

/// A negotiation step the fake transport was asked to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    CreateOffer,
    AcceptOffer,
    AcceptAnswer,
    Candidate(String),
    Close,
}

pub struct FakePeer {
    pub participant: ParticipantId,
    pub tracks: Vec<LocalTrack>,
    events: LinkEventSink,
    steps: Mutex<Vec<Step>>,
    stalled: bool,
}

impl FakePeer {
    pub fn steps(&self) -> Vec<Step> {
        self.steps.lock().unwrap().clone()
    }

    pub fn closed(&self) -> bool {
        self.steps().contains(&Step::Close)
    }

    pub fn candidates(&self) -> Vec<String> {
        self.steps()
            .into_iter()
            .filter_map(|step| match step {
                Step::Candidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn fire_track(&self, kind: MediaKind) {
        let id = format!("{:?}-{}", kind, self.participant).to_lowercase();
        self.events.emit(TransportEvent::TrackReceived(RemoteTrack::new(
            id, "remote", kind,
        )));
    }

    pub fn fire_state(&self, state: TransportState) {
        self.events.emit(TransportEvent::StateChanged(state));
    }

    fn record(&self, step: Step) {
        self.steps.lock().unwrap().push(step);
    }

    /// A stalled peer never finishes producing a description.
    async fn finish_description(&self) {
        if self.stalled {
            std::future::pending::<()>().await;
        }
    }

    /// Gathering starts as soon as a local description is set.
    fn gather(&self) {
        self.events
            .emit(TransportEvent::LocalCandidate(candidate(&format!(
                "host-for-{}",
                self.participant
            ))));
    }

    fn description_sdp(&self) -> String {
        let direction = if self.tracks.is_empty() {
            "a=recvonly"
        } else {
            "a=sendrecv"
        };
        format!("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n{}\r\n", direction)
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(Step::CreateOffer);
        self.finish_description().await;
        self.gather();
        Ok(SessionDescription::offer(self.description_sdp()))
    }

    async fn accept_offer(&self, _offer: SessionDescription) -> Result<SessionDescription> {
        self.record(Step::AcceptOffer);
        self.finish_description().await;
        self.gather();
        Ok(SessionDescription::answer(self.description_sdp()))
    }

    async fn accept_answer(&self, _answer: SessionDescription) -> Result<()> {
        self.record(Step::AcceptAnswer);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(Step::Candidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Step::Close);
        Ok(())
    }
}

/// Hands out [`FakePeer`]s and remembers every one it built.
#[derive(Default)]
pub struct FakeFactory {
    peers: Mutex<HashMap<ParticipantId, Vec<Arc<FakePeer>>>>,
    refused: Mutex<HashSet<ParticipantId>>,
    stalled: AtomicBool,
}

impl FakeFactory {
    pub fn refuse(&self, participant: &str) {
        self.refused
            .lock()
            .unwrap()
            .insert(ParticipantId::from(participant));
    }

    /// Transports built from now on hang in offer/answer creation.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Most recent transport built for `participant`.
    pub fn peer(&self, participant: &str) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .get(&ParticipantId::from(participant))
            .and_then(|peers| peers.last().cloned())
            .unwrap_or_else(|| panic!("no transport built for {}", participant))
    }

    pub fn built(&self, participant: &str) -> usize {
        self.peers
            .lock()
            .unwrap()
            .get(&ParticipantId::from(participant))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl PeerTransportFactory for FakeFactory {
    async fn create(
        &self,
        participant: &ParticipantId,
        tracks: Vec<LocalTrack>,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerTransport>> {
        if self.refused.lock().unwrap().contains(participant) {
            return Err(Error::Signaling(format!("transport to {} refused", participant)));
        }
        let peer = Arc::new(FakePeer {
            participant: participant.clone(),
            tracks,
            events,
            steps: Mutex::new(Vec::new()),
            stalled: self.stalled.load(Ordering::SeqCst),
        });
        self.peers
            .lock()
            .unwrap()
            .entry(participant.clone())
            .or_default()
            .push(Arc::clone(&peer));
        Ok(peer as Arc<dyn PeerTransport>)
    }
}

/// Relay connection that records what the session sends.
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Puts back messages that were taken but not consumed.
    pub fn restore(&self, messages: Vec<ClientMessage>) {
        let mut sent = self.sent.lock().unwrap();
        let newer = std::mem::replace(&mut *sent, messages);
        sent.extend(newer);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn count(&self, pred: impl Fn(&ClientMessage) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|m| pred(m)).count()
    }
}

impl SignalingSink for RecordingSink {
    fn send(&self, message: ClientMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

pub fn candidate(tag: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 192.0.2.1 54400 typ host", tag),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

/// What the relay would deliver for a message addressed to one participant.
pub fn route(from: &ParticipantId, msg: ClientMessage) -> Option<(ParticipantId, RelayMessage)> {
    let from = from.clone();
    match msg {
        ClientMessage::Offer { to, sdp_offer } => Some((to, RelayMessage::Offer { from, sdp_offer })),
        ClientMessage::Answer { to, sdp_answer } => {
            Some((to, RelayMessage::Answer { from, sdp_answer }))
        }
        ClientMessage::IceCandidate { to, candidate } => {
            Some((to, RelayMessage::IceCandidate { from, candidate }))
        }
        _ => None,
    }
}

/// One joined endpoint with fake transports and a recording relay.
pub struct Endpoint {
    pub id: ParticipantId,
    pub session: RoomSession,
    pub factory: Arc<FakeFactory>,
    pub sink: RecordingSink,
}

impl Endpoint {
    pub async fn join(id: &str, name: &str) -> Self {
        Self::join_with(id, name, &SampleTrackDevices).await
    }

    pub async fn join_receive_only(id: &str, name: &str) -> Self {
        Self::join_with(id, name, &NoDevices).await
    }

    async fn join_with(id: &str, name: &str, devices: &dyn MediaDevices) -> Self {
        let factory = Arc::new(FakeFactory::default());
        let sink = RecordingSink::default();
        let request = JoinRequest::new(ROOM, name).unwrap();
        let session = RoomSession::join(
            request,
            devices,
            Arc::clone(&factory) as Arc<dyn PeerTransportFactory>,
            Box::new(sink.clone()),
        )
        .await
        .unwrap();
        Self {
            id: ParticipantId::from(id),
            session,
            factory,
            sink,
        }
    }

    pub fn deliver(&mut self, msg: RelayMessage) {
        self.session.handle_relay_message(msg);
    }

    pub fn peer_joined(&mut self, id: &str, name: &str) {
        self.deliver(RelayMessage::PeerJoined {
            participant_id: ParticipantId::from(id),
            display_name: name.to_string(),
        });
    }

    /// Applies link events until the workers go quiet.
    pub async fn settle(&mut self) {
        while let Ok(Some(event)) =
            timeout(Duration::from_millis(100), self.session.next_link_event()).await
        {
            self.session.handle_link_event(event);
        }
    }

    pub fn state_of(&self, id: &str) -> Option<NegotiationState> {
        self.session
            .link(&ParticipantId::from(id))
            .map(|link| link.state())
    }
}

/// Relays addressed messages between two endpoints until neither sends more.
pub async fn exchange(a: &mut Endpoint, b: &mut Endpoint) {
    loop {
        let moved_to_b = forward(a, b).await;
        let moved_to_a = forward(b, a).await;
        if moved_to_a + moved_to_b == 0 {
            break;
        }
    }
}

async fn forward(from: &mut Endpoint, to: &mut Endpoint) -> usize {
    from.settle().await;
    let mut moved = 0;
    let mut kept = Vec::new();
    for msg in from.sink.take() {
        match route(&from.id, msg.clone()) {
            Some((target, relayed)) if target == to.id => {
                to.deliver(relayed);
                moved += 1;
            }
            _ => kept.push(msg),
        }
    }
    from.sink.restore(kept);
    to.settle().await;
    moved
}

/// Polls `cond` for up to a second.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}
