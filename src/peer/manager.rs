//! Peer session manager
//!
//! One instance per process. Owns the identifier -> session map, mediates
//! between the rendezvous channel and individual peer sessions, and drains
//! every event source from a single `select!` loop so no two events for the
//! same session ever interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::envelope::Envelope;
use super::identity;
use super::registry::ChannelRegistry;
use super::rendezvous;
use super::session::{PeerSession, SessionEvent, SessionState};
use super::transport::{TransportEvent, TransportFactory, TransportState, TransportUpdate};
use crate::config::PeerConfig;
use crate::error::SignalError;

/// How often overdue negotiation deadlines are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Queue depths for the manager's event channels.
const CHANNEL_CAPACITY: usize = 100;

/// Discrete user-visible events. Failures surface here as notices rather
/// than silent stalls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotice {
    Connected { peer: String },
    Disconnected { peer: String },
    Unreachable { peer: String },
    NegotiationTimedOut { peer: String },
    Message { peer: String, text: String },
}

/// Application-side commands, executed on the manager loop.
pub enum Command {
    ConnectTo {
        remote_id: String,
        reply: oneshot::Sender<Result<(), SignalError>>,
    },
    SendTo {
        remote_id: String,
        text: String,
        reply: oneshot::Sender<Result<(), SignalError>>,
    },
    Broadcast {
        text: String,
        reply: oneshot::Sender<usize>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<(String, SessionState)>>,
    },
}

/// Cloneable handle for driving a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
}

impl ManagerHandle {
    pub async fn connect_to(&self, remote_id: &str) -> Result<(), SignalError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectTo {
                remote_id: remote_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| SignalError::ManagerStopped)?;
        rx.await.map_err(|_| SignalError::ManagerStopped)?
    }

    pub async fn send_to(&self, remote_id: &str, text: &str) -> Result<(), SignalError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendTo {
                remote_id: remote_id.to_string(),
                text: text.to_string(),
                reply,
            })
            .await
            .map_err(|_| SignalError::ManagerStopped)?;
        rx.await.map_err(|_| SignalError::ManagerStopped)?
    }

    /// Best-effort broadcast; returns the number of peers reached.
    pub async fn broadcast(&self, text: &str) -> Result<usize, SignalError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Broadcast {
                text: text.to_string(),
                reply,
            })
            .await
            .map_err(|_| SignalError::ManagerStopped)?;
        rx.await.map_err(|_| SignalError::ManagerStopped)
    }

    pub async fn sessions(&self) -> Result<Vec<(String, SessionState)>, SignalError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Sessions { reply })
            .await
            .map_err(|_| SignalError::ManagerStopped)?;
        rx.await.map_err(|_| SignalError::ManagerStopped)
    }
}

/// Shared state, readable from outside the loop.
pub struct ManagerState {
    pub sessions: RwLock<HashMap<String, PeerSession>>,
    pub registry: ChannelRegistry,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry: ChannelRegistry::new(),
        }
    }
}

pub struct SessionManager {
    config: PeerConfig,
    local_id: String,
    factory: Arc<dyn TransportFactory>,
    state: Arc<ManagerState>,
    next_generation: AtomicU64,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: Option<mpsc::Receiver<Command>>,
    transport_tx: mpsc::Sender<TransportUpdate>,
    transport_rx: Option<mpsc::Receiver<TransportUpdate>>,
    incoming_tx: mpsc::Sender<Envelope>,
    incoming_rx: Option<mpsc::Receiver<Envelope>>,
    outgoing_tx: mpsc::Sender<Envelope>,
    outgoing_rx: Option<mpsc::Receiver<Envelope>>,
    notices_tx: mpsc::Sender<PeerNotice>,
    notices_rx: Option<mpsc::Receiver<PeerNotice>>,
}

impl SessionManager {
    pub fn new(
        local_id: &str,
        config: PeerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, SignalError> {
        if !identity::validate(local_id) {
            return Err(SignalError::InvalidPeer(local_id.to_string()));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (notices_tx, notices_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Ok(Self {
            config,
            local_id: local_id.to_string(),
            factory,
            state: Arc::new(ManagerState::new()),
            next_generation: AtomicU64::new(1),
            shutdown: Arc::new(shutdown),
            shutdown_rx,
            commands_tx,
            commands_rx: Some(commands_rx),
            transport_tx,
            transport_rx: Some(transport_rx),
            incoming_tx,
            incoming_rx: Some(incoming_rx),
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
            notices_tx,
            notices_rx: Some(notices_rx),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// Shared state for external inspection.
    pub fn state(&self) -> Arc<ManagerState> {
        self.state.clone()
    }

    /// Take the notice stream. Can only be taken once.
    pub fn take_notices(&mut self) -> Option<mpsc::Receiver<PeerNotice>> {
        self.notices_rx.take()
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Connect the rendezvous channel and run the event loop until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting session manager with peer ID: {}", self.local_id);

        let mut commands_rx = self.commands_rx.take().expect("commands_rx already taken");
        let mut transport_rx = self.transport_rx.take().expect("transport_rx already taken");
        let mut incoming_rx = self.incoming_rx.take().expect("incoming_rx already taken");
        let outgoing_rx = self.outgoing_rx.take().expect("outgoing_rx already taken");

        // Rendezvous channel task
        {
            let relay_url = self.config.relay_url.clone();
            let local_id = self.local_id.clone();
            let incoming_tx = self.incoming_tx.clone();
            let shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    rendezvous::run_channel(relay_url, local_id, incoming_tx, outgoing_rx, shutdown_rx)
                        .await
                {
                    error!("Rendezvous channel error: {}", e);
                }
            });
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Session manager shutting down");
                        break;
                    }
                }
                Some(command) = commands_rx.recv() => {
                    self.handle_command(command).await;
                }
                Some(envelope) = incoming_rx.recv() => {
                    self.handle_envelope(envelope).await;
                }
                Some(update) = transport_rx.recv() => {
                    self.handle_transport_update(update).await;
                }
                _ = sweep.tick() => {
                    self.sweep_deadlines().await;
                }
            }
        }

        self.close_all_sessions().await;

        Ok(())
    }

    fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.config.negotiation_timeout_ms)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn send_envelope(&self, envelope: Envelope) {
        // Fire-and-forget: delivery feedback, if any, arrives as a later event.
        if self.outgoing_tx.try_send(envelope).is_err() {
            warn!("Outgoing signaling queue full or closed; dropping envelope");
        }
    }

    fn notify(&self, notice: PeerNotice) {
        if self.notices_tx.try_send(notice).is_err() {
            debug!("Notice queue full or closed; dropping notice");
        }
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::ConnectTo { remote_id, reply } => {
                let _ = reply.send(self.connect_to(&remote_id).await);
            }
            Command::SendTo {
                remote_id,
                text,
                reply,
            } => {
                let _ = reply.send(self.state.registry.send_to(&remote_id, &text).await);
            }
            Command::Broadcast { text, reply } => {
                let _ = reply.send(self.state.registry.broadcast(&text).await);
            }
            Command::Sessions { reply } => {
                let sessions = self.state.sessions.read().await;
                let _ = reply.send(
                    sessions
                        .values()
                        .map(|s| (s.remote_id.clone(), s.state))
                        .collect(),
                );
            }
        }
    }

    /// Open an outbound session: create the transport, produce an offer and
    /// push it to the relay.
    pub(crate) async fn connect_to(&self, remote_id: &str) -> Result<(), SignalError> {
        if !identity::validate(remote_id) || remote_id == self.local_id {
            warn!("Refusing to connect to invalid peer ID: {}", remote_id);
            return Err(SignalError::InvalidPeer(remote_id.to_string()));
        }
        if self.state.sessions.read().await.contains_key(remote_id) {
            warn!("Session with {} already active", remote_id);
            return Err(SignalError::InvalidPeer(remote_id.to_string()));
        }

        info!("Offering connection to {}", remote_id);

        let generation = self.next_generation();
        let transport = self
            .factory
            .create(remote_id, generation, self.transport_tx.clone())
            .await?;

        let timeout = self.negotiation_timeout();
        {
            let mut sessions = self.state.sessions.write().await;
            let mut session = PeerSession::new(remote_id, generation, transport.clone());
            let _ = session.apply(SessionEvent::OfferRequested, timeout);
            sessions.insert(remote_id.to_string(), session);
        }

        let offer = match transport.create_local_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                error!("Offer creation for {} failed: {}", remote_id, e);
                self.close_session(remote_id, None).await;
                return Err(e);
            }
        };

        {
            let mut sessions = self.state.sessions.write().await;
            if let Some(session) = sessions.get_mut(remote_id) {
                let _ = session.apply(SessionEvent::OfferSent, timeout);
            }
        }

        self.send_envelope(Envelope::offer(remote_id, offer));
        Ok(())
    }

    pub(crate) async fn handle_envelope(&self, envelope: Envelope) {
        debug!(
            "Received {} from {}",
            envelope.kind(),
            envelope.from().unwrap_or("relay")
        );

        match envelope {
            Envelope::Offer {
                from: Some(from),
                description,
                ..
            } => self.handle_offer(&from, &description).await,
            Envelope::Answer {
                from: Some(from),
                description,
                ..
            } => self.handle_answer(&from, &description).await,
            Envelope::Candidate {
                from: Some(from),
                candidate,
                mid,
                ..
            } => self.handle_candidate(&from, candidate, mid).await,
            Envelope::PeerNotFound { peer } => self.handle_peer_not_found(&peer).await,
            other => {
                debug!("Dropping {} envelope without sender", other.kind());
            }
        }
    }

    /// True when our own pending offer survives a glare with `remote_id`.
    /// The lexicographically smaller identifier's offer wins.
    fn local_offer_wins(&self, remote_id: &str) -> bool {
        self.local_id.as_str() < remote_id
    }

    async fn handle_offer(&self, from: &str, description: &str) {
        if !identity::validate(from) {
            debug!("Dropping offer from invalid peer ID: {}", from);
            return;
        }

        // Glare: both sides offered at once. Resolve deterministically.
        {
            let sessions = self.state.sessions.read().await;
            if let Some(session) = sessions.get(from) {
                match session.state {
                    SessionState::Offering | SessionState::AwaitingAnswer => {
                        if self.local_offer_wins(from) {
                            debug!("Glare with {}: local offer wins, dropping theirs", from);
                            return;
                        }
                        info!("Glare with {}: remote offer wins, discarding ours", from);
                    }
                    state => {
                        debug!("Dropping out-of-state offer from {} ({})", from, state);
                        return;
                    }
                }
            }
        }
        // Losing side of a glare: tear down the pending offer before answering.
        if self.state.sessions.read().await.contains_key(from) {
            self.close_session(from, None).await;
        }

        info!("Received offer from {}", from);

        let generation = self.next_generation();
        let transport = match self
            .factory
            .create(from, generation, self.transport_tx.clone())
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                error!("Transport creation for {} failed: {}", from, e);
                return;
            }
        };

        let timeout = self.negotiation_timeout();
        {
            let mut sessions = self.state.sessions.write().await;
            let mut session = PeerSession::new(from, generation, transport.clone());
            let _ = session.apply(SessionEvent::AnswerRequested, timeout);
            sessions.insert(from.to_string(), session);
        }

        let answer = match transport.create_local_answer(description).await {
            Ok(answer) => answer,
            Err(e) => {
                error!("Answer creation for {} failed: {}", from, e);
                self.close_session(from, None).await;
                return;
            }
        };

        {
            let mut sessions = self.state.sessions.write().await;
            if let Some(session) = sessions.get_mut(from) {
                session.mark_remote_description_set();
                let _ = session.apply(SessionEvent::AnswerSent, timeout);
            }
        }

        self.send_envelope(Envelope::answer(from, answer));
        info!("Sent answer to {}", from);
    }

    async fn handle_answer(&self, from: &str, description: &str) {
        {
            let sessions = self.state.sessions.read().await;
            match sessions.get(from) {
                Some(session) if session.state == SessionState::AwaitingAnswer => {}
                Some(session) => {
                    debug!(
                        "Dropping out-of-state answer from {} ({})",
                        from, session.state
                    );
                    return;
                }
                None => {
                    debug!("Dropping answer from {} with no session", from);
                    return;
                }
            }
        }

        info!("Received answer from {}", from);

        let transport = {
            let sessions = self.state.sessions.read().await;
            match sessions.get(from) {
                Some(session) => session.transport(),
                None => return,
            }
        };

        if let Err(e) = transport.set_remote_description(description).await {
            error!("Applying answer from {} failed: {}", from, e);
            self.close_session(from, Some(PeerNotice::Disconnected { peer: from.into() }))
                .await;
            return;
        }

        // Replay candidates that arrived ahead of the answer, in arrival order.
        let pending = {
            let mut sessions = self.state.sessions.write().await;
            match sessions.get_mut(from) {
                Some(session) => {
                    session.mark_remote_description_set();
                    let _ = session.apply(SessionEvent::AnswerReceived, self.negotiation_timeout());
                    session.drain_candidates()
                }
                None => return,
            }
        };

        for pc in pending {
            if let Err(e) = transport
                .add_remote_candidate(&pc.candidate, pc.mid.as_deref())
                .await
            {
                debug!("Failed to apply buffered candidate from {}: {}", from, e);
            }
        }
    }

    async fn handle_candidate(&self, from: &str, candidate: String, mid: Option<String>) {
        let transport = {
            let mut sessions = self.state.sessions.write().await;
            match sessions.get_mut(from) {
                Some(session) if session.remote_description_set() => session.transport(),
                Some(session) => {
                    session.buffer_candidate(candidate, mid);
                    debug!(
                        "Buffered early candidate from {} ({} pending)",
                        from,
                        session.pending_candidate_count()
                    );
                    return;
                }
                None => {
                    debug!("Dropping candidate from {} with no session", from);
                    return;
                }
            }
        };

        if let Err(e) = transport.add_remote_candidate(&candidate, mid.as_deref()).await {
            debug!("Failed to apply candidate from {}: {}", from, e);
        }
    }

    async fn handle_peer_not_found(&self, peer: &str) {
        warn!("Relay could not route to {}", peer);
        self.notify(PeerNotice::Unreachable {
            peer: peer.to_string(),
        });
        if self.state.sessions.read().await.contains_key(peer) {
            // The relay has already said the target is gone; don't wait for
            // the negotiation timeout.
            self.close_session(peer, None).await;
        }
    }

    pub(crate) async fn handle_transport_update(&self, update: TransportUpdate) {
        let remote_id = update.remote_id;

        {
            let sessions = self.state.sessions.read().await;
            match sessions.get(&remote_id) {
                Some(session) if session.generation == update.generation => {}
                Some(_) => {
                    debug!("Dropping stale transport event for {}", remote_id);
                    return;
                }
                None => {
                    debug!("Dropping transport event for unknown session {}", remote_id);
                    return;
                }
            }
        }

        match update.event {
            TransportEvent::LocalCandidate { candidate, mid } => {
                self.send_envelope(Envelope::candidate(&remote_id, candidate, mid));
            }
            TransportEvent::StateChanged(TransportState::Connected) => {
                debug!("Transport to {} reports connected", remote_id);
            }
            TransportEvent::StateChanged(state) => {
                info!("Transport to {} reports {}", remote_id, state);
                self.close_session(
                    &remote_id,
                    Some(PeerNotice::Disconnected {
                        peer: remote_id.clone(),
                    }),
                )
                .await;
            }
            TransportEvent::ChannelOpen(channel) => {
                info!(
                    "Data channel '{}' to {} open",
                    channel.label(),
                    remote_id
                );
                self.state.registry.register(&remote_id, channel).await;
                let mut sessions = self.state.sessions.write().await;
                if let Some(session) = sessions.get_mut(&remote_id) {
                    if session
                        .apply(SessionEvent::ChannelOpened, self.negotiation_timeout())
                        .is_none()
                    {
                        debug!(
                            "Channel opened for {} in unexpected state {}",
                            remote_id, session.state
                        );
                    }
                }
                drop(sessions);
                self.notify(PeerNotice::Connected { peer: remote_id });
            }
            TransportEvent::ChannelClosed => {
                // The session may outlive its channel briefly to drain final
                // signaling; only the registry entry goes now.
                debug!("Data channel to {} closed", remote_id);
                self.state.registry.unregister(&remote_id).await;
            }
            TransportEvent::Message(text) => {
                self.notify(PeerNotice::Message {
                    peer: remote_id,
                    text,
                });
            }
        }
    }

    /// Close overdue negotiations. Sessions stuck waiting for an answer or
    /// for connectivity are discarded rather than leaked forever.
    pub(crate) async fn sweep_deadlines(&self) {
        let now = Instant::now();
        let overdue: Vec<String> = {
            let sessions = self.state.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.deadline_elapsed(now))
                .map(|s| s.remote_id.clone())
                .collect()
        };

        for remote_id in overdue {
            warn!("Negotiation with {} timed out", remote_id);
            self.close_session(
                &remote_id,
                Some(PeerNotice::NegotiationTimedOut {
                    peer: remote_id.clone(),
                }),
            )
            .await;
        }
    }

    /// Remove a session from the map and the registry and release its
    /// transport. Terminal: reconnection is a fresh `connect_to`.
    pub(crate) async fn close_session(&self, remote_id: &str, notice: Option<PeerNotice>) {
        let session = self.state.sessions.write().await.remove(remote_id);
        if let Some(mut session) = session {
            let _ = session.apply(SessionEvent::Terminated, self.negotiation_timeout());
            session.transport().close().await;
        }
        self.state.registry.unregister(remote_id).await;
        if let Some(notice) = notice {
            self.notify(notice);
        }
    }

    async fn close_all_sessions(&self) {
        let remote_ids: Vec<String> = {
            let sessions = self.state.sessions.read().await;
            sessions.keys().cloned().collect()
        };
        for remote_id in remote_ids {
            self.close_session(&remote_id, None).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn take_outgoing(&mut self) -> Option<mpsc::Receiver<Envelope>> {
        self.outgoing_rx.take()
    }
}
