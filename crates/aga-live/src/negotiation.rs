//! Per-link offer/answer state machine.
//!
//! The machine is synchronous and does no I/O. Every input returns the
//! [`Action`]s the caller has to carry out, either on the peer transport
//! (through the link worker) or on the signaling channel. Results of
//! transport work come back in through [`Negotiation::local_description_ready`]
//! and [`Negotiation::remote_applied`].

use std::fmt;

use aga_common::{ConnectionId, IceCandidate, SdpType, SessionDescription};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferCreated,
    AwaitingAnswer,
    AnswerReceived,
    AwaitingRemoteOffer,
    AnswerCreated,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::New => "new",
            NegotiationState::OfferCreated => "offer-created",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::AnswerReceived => "answer-received",
            NegotiationState::AwaitingRemoteOffer => "awaiting-remote-offer",
            NegotiationState::AnswerCreated => "answer-created",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Work requested by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    // Transport work, executed in order by the link worker.
    CreateOffer,
    CreateAnswer,
    ApplyRemote(SessionDescription),
    Rollback,
    AddRemoteCandidate(IceCandidate),
    // Signaling work.
    SendOffer(SessionDescription),
    SendAnswer(SessionDescription),
    SendCandidate(IceCandidate),
}

impl Action {
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            Action::SendOffer(_) | Action::SendAnswer(_) | Action::SendCandidate(_)
        )
    }
}

#[derive(Debug)]
pub struct Negotiation {
    role: NegotiationRole,
    local_id: ConnectionId,
    remote_id: ConnectionId,
    state: NegotiationState,
    offer_accepted: bool,
    local_sent: bool,
    remote_applied: bool,
    pending_remote: Vec<IceCandidate>,
    pending_local: Vec<IceCandidate>,
    transitions: Vec<(NegotiationState, NegotiationState)>,
}

impl Negotiation {
    pub fn new(role: NegotiationRole, local_id: ConnectionId, remote_id: ConnectionId) -> Self {
        Self {
            role,
            local_id,
            remote_id,
            state: NegotiationState::New,
            offer_accepted: false,
            local_sent: false,
            remote_applied: false,
            pending_remote: Vec::new(),
            pending_local: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn is_remote_applied(&self) -> bool {
        self.remote_applied
    }

    /// State changes since the last call, oldest first.
    pub fn take_transitions(&mut self) -> Vec<(NegotiationState, NegotiationState)> {
        std::mem::take(&mut self.transitions)
    }

    pub fn start(&mut self) -> Vec<Action> {
        if self.state != NegotiationState::New {
            return Vec::new();
        }
        match self.role {
            NegotiationRole::Offerer => vec![Action::CreateOffer],
            NegotiationRole::Answerer => {
                self.set_state(NegotiationState::AwaitingRemoteOffer);
                Vec::new()
            }
        }
    }

    /// The transport produced (and installed) a local description.
    pub fn local_description_ready(&mut self, desc: SessionDescription) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match desc.sdp_type {
            SdpType::Offer if self.role == NegotiationRole::Offerer => {
                self.set_state(NegotiationState::OfferCreated);
                vec![Action::SendOffer(desc)]
            }
            SdpType::Answer if self.role == NegotiationRole::Answerer => {
                self.set_state(NegotiationState::AnswerCreated);
                vec![Action::SendAnswer(desc)]
            }
            other => {
                warn!(
                    "Ignoring local {:?} description for {} in state {}",
                    other, self.remote_id, self.state
                );
                Vec::new()
            }
        }
    }

    /// The local description was handed to the signaling channel.
    pub fn description_sent(&mut self) -> Vec<Action> {
        match self.state {
            NegotiationState::OfferCreated => self.set_state(NegotiationState::AwaitingAnswer),
            NegotiationState::AnswerCreated => self.set_state(NegotiationState::Negotiating),
            _ => return Vec::new(),
        }
        self.local_sent = true;
        self.flush_local()
    }

    pub fn remote_description(&mut self, desc: SessionDescription) -> Vec<Action> {
        if self.state.is_terminal() {
            debug!("Dropping {:?} for closed link {}", desc.sdp_type, self.remote_id);
            return Vec::new();
        }
        match desc.sdp_type {
            SdpType::Answer => self.on_answer(desc),
            SdpType::Offer => self.on_offer(desc),
            other => {
                warn!("Unexpected remote {:?} from {}", other, self.remote_id);
                Vec::new()
            }
        }
    }

    fn on_answer(&mut self, desc: SessionDescription) -> Vec<Action> {
        match self.state {
            NegotiationState::AwaitingAnswer => {
                self.set_state(NegotiationState::AnswerReceived);
                vec![Action::ApplyRemote(desc)]
            }
            NegotiationState::AnswerReceived
            | NegotiationState::Negotiating
            | NegotiationState::Connected => {
                debug!("Duplicate answer from {} ignored", self.remote_id);
                Vec::new()
            }
            state => {
                warn!("Answer from {} not expected in state {}", self.remote_id, state);
                Vec::new()
            }
        }
    }

    fn on_offer(&mut self, desc: SessionDescription) -> Vec<Action> {
        match (self.role, self.state) {
            (NegotiationRole::Answerer, NegotiationState::AwaitingRemoteOffer)
                if !self.offer_accepted =>
            {
                self.offer_accepted = true;
                vec![Action::ApplyRemote(desc), Action::CreateAnswer]
            }
            (NegotiationRole::Offerer, NegotiationState::OfferCreated)
            | (NegotiationRole::Offerer, NegotiationState::AwaitingAnswer) => {
                self.resolve_glare(desc)
            }
            (_, state) => {
                debug!("Offer from {} ignored in state {}", self.remote_id, state);
                Vec::new()
            }
        }
    }

    fn resolve_glare(&mut self, desc: SessionDescription) -> Vec<Action> {
        if self.local_id < self.remote_id {
            debug!(
                "Glare with {}: keeping local offer ({} < {})",
                self.remote_id, self.local_id, self.remote_id
            );
            return Vec::new();
        }
        debug!("Glare with {}: rolling back and answering", self.remote_id);
        self.role = NegotiationRole::Answerer;
        self.local_sent = false;
        self.offer_accepted = true;
        self.set_state(NegotiationState::AwaitingRemoteOffer);
        vec![
            Action::Rollback,
            Action::ApplyRemote(desc),
            Action::CreateAnswer,
        ]
    }

    /// The remote description was installed on the transport.
    pub fn remote_applied(&mut self) -> Vec<Action> {
        if self.state.is_terminal() || self.remote_applied {
            return Vec::new();
        }
        self.remote_applied = true;
        if self.state == NegotiationState::AnswerReceived {
            self.set_state(NegotiationState::Negotiating);
        }
        let mut actions: Vec<Action> = self
            .pending_remote
            .drain(..)
            .map(Action::AddRemoteCandidate)
            .collect();
        actions.extend(self.flush_local());
        actions
    }

    pub fn local_candidate(&mut self, candidate: IceCandidate) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        if self.remote_applied && self.local_sent {
            vec![Action::SendCandidate(candidate)]
        } else {
            self.pending_local.push(candidate);
            Vec::new()
        }
    }

    pub fn remote_candidate(&mut self, candidate: IceCandidate) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        if self.remote_applied {
            vec![Action::AddRemoteCandidate(candidate)]
        } else {
            self.pending_remote.push(candidate);
            Vec::new()
        }
    }

    /// Feeds a transport connection-state change.
    pub fn transport_state(&mut self, state: crate::transport::TransportState) {
        use crate::transport::TransportState;

        if self.state.is_terminal() {
            return;
        }
        match state {
            TransportState::Connected if self.remote_applied => {
                self.set_state(NegotiationState::Connected)
            }
            TransportState::Connected => {
                warn!("{} reported connected before remote description", self.remote_id)
            }
            TransportState::Failed => self.set_state(NegotiationState::Failed),
            TransportState::Closed => self.set_state(NegotiationState::Closed),
            TransportState::New | TransportState::Connecting | TransportState::Disconnected => {}
        }
    }

    /// Negotiation deadline passed. Returns true if the link failed because of it.
    pub fn timeout(&mut self) -> bool {
        if self.state.is_terminal() || self.state == NegotiationState::Connected {
            return false;
        }
        self.set_state(NegotiationState::Failed);
        true
    }

    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.set_state(NegotiationState::Failed);
        }
    }

    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.set_state(NegotiationState::Closed);
        }
    }

    fn flush_local(&mut self) -> Vec<Action> {
        if !(self.remote_applied && self.local_sent) {
            return Vec::new();
        }
        self.pending_local
            .drain(..)
            .map(Action::SendCandidate)
            .collect()
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state == next || self.state.is_terminal() {
            return;
        }
        debug!("Link {}: {} -> {}", self.remote_id, self.state, next);
        self.transitions.push((self.state, next));
        self.state = next;
    }
}
