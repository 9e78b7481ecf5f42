//! Per-peer negotiation state machine
//!
//! One [`PeerSession`] exists per remote identifier per process, owned by the
//! session manager. Transitions are a pure function over `(state, event)` so
//! the whole table can be unit tested; the session struct adds the stateful
//! parts (candidate buffer, deadline, transport handle).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use super::transport::Transport;

/// Negotiation states. The outbound path runs
/// `Idle -> Offering -> AwaitingAnswer -> AwaitingConnection -> Connected`,
/// the inbound path `Idle -> Answering -> AwaitingConnection -> Connected`.
/// Every state may fall to `Closed`; no state is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    AwaitingConnection,
    Connected,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Offering => write!(f, "offering"),
            SessionState::AwaitingAnswer => write!(f, "awaiting-answer"),
            SessionState::Answering => write!(f, "answering"),
            SessionState::AwaitingConnection => write!(f, "awaiting-connection"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Local connect requested; the transport is producing an offer.
    OfferRequested,
    /// The local offer was produced and pushed to the rendezvous channel.
    OfferSent,
    /// A remote offer was accepted; the transport is producing an answer.
    AnswerRequested,
    /// The local answer was produced and pushed to the rendezvous channel.
    AnswerSent,
    /// The remote answer arrived and was applied to the transport.
    AnswerReceived,
    /// The transport opened a data channel.
    ChannelOpened,
    /// Transport failure, close, or negotiation timeout.
    Terminated,
}

/// The transition table. Returns `None` for transitions the protocol does
/// not allow; callers treat those as anomalies, not state changes.
pub fn advance(state: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent::*;
    use SessionState::*;

    match (state, event) {
        (_, Terminated) if state != Closed => Some(Closed),
        (Idle, OfferRequested) => Some(Offering),
        (Offering, OfferSent) => Some(AwaitingAnswer),
        (Idle, AnswerRequested) => Some(Answering),
        (Answering, AnswerSent) => Some(AwaitingConnection),
        (AwaitingAnswer, AnswerReceived) => Some(AwaitingConnection),
        (AwaitingConnection, ChannelOpened) => Some(Connected),
        _ => None,
    }
}

/// A buffered remote candidate, kept in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCandidate {
    pub candidate: String,
    pub mid: Option<String>,
}

/// One negotiation with one remote peer.
pub struct PeerSession {
    pub remote_id: String,
    pub state: SessionState,
    pub generation: u64,
    pub(crate) transport: Arc<dyn Transport>,
    /// Candidates that arrived before the remote description was set,
    /// replayed FIFO once it is.
    pending_remote_candidates: VecDeque<PendingCandidate>,
    remote_description_set: bool,
    deadline: Option<Instant>,
}

impl PeerSession {
    pub fn new(remote_id: &str, generation: u64, transport: Arc<dyn Transport>) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            state: SessionState::Idle,
            generation,
            transport,
            pending_remote_candidates: VecDeque::new(),
            remote_description_set: false,
            deadline: None,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Apply an event. Returns the new state, or `None` if the transition is
    /// not allowed (the session is left untouched).
    pub fn apply(&mut self, event: SessionEvent, timeout: std::time::Duration) -> Option<SessionState> {
        let next = advance(self.state, event)?;
        self.state = next;
        // Waiting states carry a negotiation deadline; everything else clears it.
        self.deadline = match next {
            SessionState::AwaitingAnswer
            | SessionState::Answering
            | SessionState::AwaitingConnection => Some(Instant::now() + timeout),
            _ => None,
        };
        Some(next)
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
    }

    pub fn buffer_candidate(&mut self, candidate: String, mid: Option<String>) {
        self.pending_remote_candidates
            .push_back(PendingCandidate { candidate, mid });
    }

    /// Take the buffered candidates in arrival order.
    pub fn drain_candidates(&mut self) -> Vec<PendingCandidate> {
        self.pending_remote_candidates.drain(..).collect()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn deadline_elapsed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote_id", &self.remote_id)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("pending_candidates", &self.pending_remote_candidates.len())
            .field("remote_description_set", &self.remote_description_set)
            .finish()
    }
}
