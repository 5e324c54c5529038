use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::connection::{NegotiationInput, NegotiationState};
use crate::error::Result;
use crate::media::LocalTrack;
use crate::room::link::{LinkEpoch, LinkOp, LinkWorker};
use crate::room::registry::RemoteMedia;
use crate::signaling::{IceCandidate, ParticipantId};

/// Which side sent the first offer on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

/// The negotiated connection to one remote participant.
#[derive(Debug)]
pub struct PeerLink {
    participant: ParticipantId,
    epoch: LinkEpoch,
    role: LinkRole,
    state: NegotiationState,
    tracks: Vec<LocalTrack>,
    pending_candidates: VecDeque<IceCandidate>,
    local_candidates: Vec<IceCandidate>,
    local_description_sent: bool,
    remote_pending: bool,
    remote_description_set: bool,
    remote_sends_media: bool,
    transport_connected: bool,
    inbound: RemoteMedia,
    worker: LinkWorker,
}

impl PeerLink {
    pub fn new(
        participant: ParticipantId,
        epoch: LinkEpoch,
        role: LinkRole,
        tracks: Vec<LocalTrack>,
        worker: LinkWorker,
    ) -> Self {
        Self {
            participant,
            epoch,
            role,
            state: NegotiationState::New,
            tracks,
            pending_candidates: VecDeque::new(),
            local_candidates: Vec::new(),
            local_description_sent: false,
            remote_pending: false,
            remote_description_set: false,
            remote_sends_media: true,
            transport_connected: false,
            inbound: RemoteMedia::default(),
            worker,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn epoch(&self) -> LinkEpoch {
        self.epoch
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Local tracks attached when the link was created.
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn inbound(&self) -> &RemoteMedia {
        &self.inbound
    }

    pub fn inbound_mut(&mut self) -> &mut RemoteMedia {
        &mut self.inbound
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn remote_sends_media(&self) -> bool {
        self.remote_sends_media
    }

    pub fn transport_connected(&self) -> bool {
        self.transport_connected
    }

    pub fn set_transport_connected(&mut self, connected: bool) {
        self.transport_connected = connected;
    }

    pub fn advance(&mut self, input: NegotiationInput) -> Result<NegotiationState> {
        let next = self.state.apply(input)?;
        if next != self.state {
            info!(
                "Link to {} moved {} -> {}",
                self.participant, self.state, next
            );
        }
        self.state = next;
        Ok(next)
    }

    pub fn enqueue(&self, op: LinkOp) {
        self.worker.enqueue(op);
    }

    /// Whether a remote description is queued or already applied.
    pub fn has_remote_description_pending(&self) -> bool {
        self.remote_pending || self.remote_description_set
    }

    /// Queues the step that applies a remote description.
    pub fn apply_remote_description(&mut self, op: LinkOp, remote_sends_media: bool) {
        self.remote_pending = true;
        self.remote_sends_media = remote_sends_media;
        self.worker.enqueue(op);
    }

    /// Applies `candidate` now if the remote description is set, otherwise buffers it.
    pub fn offer_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_description_set {
            self.worker.enqueue(LinkOp::AddCandidate(candidate));
        } else {
            debug!(
                "Buffering candidate from {} until remote description is set",
                self.participant
            );
            self.pending_candidates.push_back(candidate);
        }
    }

    /// Marks the remote description applied and flushes buffered candidates in arrival order.
    pub fn remote_description_applied(&mut self) {
        self.remote_pending = false;
        self.remote_description_set = true;
        let flushed = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.worker.enqueue(LinkOp::AddCandidate(candidate));
        }
        if flushed > 0 {
            debug!("Flushed {} buffered candidate(s) to {}", flushed, self.participant);
        }
    }

    /// Local candidates may only be signaled after our description went out.
    /// Returns the candidate when it can be sent right away.
    pub fn local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.local_description_sent {
            Some(candidate)
        } else {
            self.local_candidates.push(candidate);
            None
        }
    }

    /// Records that the offer or answer was sent; returns the held-back candidates.
    pub fn local_description_sent(&mut self) -> Vec<IceCandidate> {
        self.local_description_sent = true;
        std::mem::take(&mut self.local_candidates)
    }

    /// Moves to `Connected` once inbound media is confirmed, passing through
    /// `Negotiating` on the answering side. Returns the new state when it changed.
    pub fn try_confirm_media(&mut self) -> Option<NegotiationState> {
        let confirmed = !self.inbound.tracks.is_empty()
            || (self.transport_connected && !self.remote_sends_media);
        if !confirmed || !self.remote_description_set {
            return None;
        }
        if self.state == NegotiationState::HaveRemoteOffer {
            self.advance(NegotiationInput::ConnectivityChecking).ok()?;
        }
        if self.state != NegotiationState::Negotiating {
            return None;
        }
        self.advance(NegotiationInput::MediaFlowing).ok()
    }
}

/// Arena of live PeerLinks keyed by participant. At most one link per id.
#[derive(Debug, Default)]
pub struct PeerMap {
    links: HashMap<ParticipantId, PeerLink>,
    next_epoch: LinkEpoch,
}

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the epoch for the next link to be inserted.
    pub fn next_epoch(&mut self) -> LinkEpoch {
        self.next_epoch += 1;
        self.next_epoch
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.links.contains_key(participant)
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(participant)
    }

    pub fn get_mut(&mut self, participant: &ParticipantId) -> Option<&mut PeerLink> {
        self.links.get_mut(participant)
    }

    /// The link for `participant` only if it is the instance stamped `epoch`.
    pub fn current_mut(
        &mut self,
        participant: &ParticipantId,
        epoch: LinkEpoch,
    ) -> Option<&mut PeerLink> {
        self.links
            .get_mut(participant)
            .filter(|link| link.epoch == epoch)
    }

    /// Inserts unless a link already exists; returns whether it was inserted.
    pub fn insert(&mut self, link: PeerLink) -> bool {
        if self.links.contains_key(&link.participant) {
            return false;
        }
        self.links.insert(link.participant.clone(), link);
        true
    }

    pub fn remove(&mut self, participant: &ParticipantId) -> Option<PeerLink> {
        self.links.remove(participant)
    }

    pub fn drain(&mut self) -> Vec<PeerLink> {
        self.links.drain().map(|(_, link)| link).collect()
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantId> {
        self.links.keys()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
