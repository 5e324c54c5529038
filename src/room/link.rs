//! Per-PeerLink negotiation worker.
//!
//! Every asynchronous step for one remote participant runs on its own
//! task, strictly in the order the controller queued it. Results flow back
//! to the controller as [`LinkEvent`]s stamped with the link's epoch, so a
//! result for a link that has since been destroyed can be recognised and
//! dropped. Dropping the [`LinkWorker`] cancels the in-flight step and
//! closes the transport.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::TransportState;
use crate::media::LocalTrack;
use crate::room::registry::RemoteTrack;
use crate::signaling::{IceCandidate, ParticipantId, SessionDescription};
use crate::transport::{PeerTransport, PeerTransportFactory};

/// Identifies one PeerLink instance; never reused within a session.
pub type LinkEpoch = u64;

/// Callbacks raised by the underlying transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    TrackReceived(RemoteTrack),
    StateChanged(TransportState),
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    OfferCreated(SessionDescription),
    /// Remote offer applied; carries the local answer.
    AnswerCreated(SessionDescription),
    AnswerApplied,
    CandidateRejected(String),
    StepFailed(String),
    Transport(TransportEvent),
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub participant: ParticipantId,
    pub epoch: LinkEpoch,
    pub kind: LinkEventKind,
}

/// Reports events for one PeerLink instance back to the controller.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    participant: ParticipantId,
    epoch: LinkEpoch,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSink {
    pub fn new(
        participant: ParticipantId,
        epoch: LinkEpoch,
        tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            participant,
            epoch,
            tx,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn epoch(&self) -> LinkEpoch {
        self.epoch
    }

    pub fn emit(&self, event: TransportEvent) {
        self.send(LinkEventKind::Transport(event));
    }

    fn send(&self, kind: LinkEventKind) {
        let event = LinkEvent {
            participant: self.participant.clone(),
            epoch: self.epoch,
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!("Session gone; dropping event for {}", self.participant);
        }
    }
}

/// A queued negotiation step.
#[derive(Debug, Clone)]
pub enum LinkOp {
    CreateOffer,
    AcceptOffer(SessionDescription),
    AcceptAnswer(SessionDescription),
    AddCandidate(IceCandidate),
}

/// Owning handle to a running worker.
#[derive(Debug)]
pub struct LinkWorker {
    ops: mpsc::UnboundedSender<LinkOp>,
    _cancel: oneshot::Sender<()>,
}

impl LinkWorker {
    pub fn spawn(
        factory: Arc<dyn PeerTransportFactory>,
        tracks: Vec<LocalTrack>,
        events: LinkEventSink,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(run(factory, tracks, events, ops_rx, cancel_rx));
        Self {
            ops: ops_tx,
            _cancel: cancel_tx,
        }
    }

    pub fn enqueue(&self, op: LinkOp) {
        if self.ops.send(op).is_err() {
            debug!("Link worker already stopped; step dropped");
        }
    }
}

async fn run(
    factory: Arc<dyn PeerTransportFactory>,
    tracks: Vec<LocalTrack>,
    events: LinkEventSink,
    mut ops: mpsc::UnboundedReceiver<LinkOp>,
    mut cancel: oneshot::Receiver<()>,
) {
    let participant = events.participant().clone();

    let transport = tokio::select! {
        biased;
        _ = &mut cancel => return,
        created = factory.create(&participant, tracks, events.clone()) => match created {
            Ok(transport) => transport,
            Err(e) => {
                events.send(LinkEventKind::StepFailed(format!("transport setup failed: {}", e)));
                return;
            }
        },
    };

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break,
            op = ops.recv() => {
                let Some(op) = op else { break };
                tokio::select! {
                    biased;
                    _ = &mut cancel => break,
                    kind = execute(transport.as_ref(), op) => {
                        if let Some(kind) = kind {
                            events.send(kind);
                        }
                    }
                }
            }
        }
    }

    if let Err(e) = transport.close().await {
        warn!("Closing connection to {} failed: {}", participant, e);
    }
    debug!("Link worker for {} (epoch {}) stopped", participant, events.epoch());
}

async fn execute(transport: &dyn PeerTransport, op: LinkOp) -> Option<LinkEventKind> {
    let kind = match op {
        LinkOp::CreateOffer => match transport.create_offer().await {
            Ok(offer) => LinkEventKind::OfferCreated(offer),
            Err(e) => LinkEventKind::StepFailed(format!("create offer: {}", e)),
        },
        LinkOp::AcceptOffer(offer) => match transport.accept_offer(offer).await {
            Ok(answer) => LinkEventKind::AnswerCreated(answer),
            Err(e) => LinkEventKind::StepFailed(format!("accept offer: {}", e)),
        },
        LinkOp::AcceptAnswer(answer) => match transport.accept_answer(answer).await {
            Ok(()) => LinkEventKind::AnswerApplied,
            Err(e) => LinkEventKind::StepFailed(format!("accept answer: {}", e)),
        },
        LinkOp::AddCandidate(candidate) => match transport.add_ice_candidate(candidate).await {
            Ok(()) => return None,
            Err(e) => LinkEventKind::CandidateRejected(e.to_string()),
        },
    };
    Some(kind)
}
