//! Transport capability interface
//!
//! The negotiation core never touches connectivity mechanics directly; it
//! drives a [`Transport`] and drains the typed events the transport queues
//! back. The production implementation wraps the webrtc crate
//! (`peer::webrtc`); tests substitute mocks through [`TransportFactory`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SignalError;

/// One negotiating transport, owned by a single peer session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Produce the local offer description. The implementation is expected
    /// to open its outbound data channel before offering so the channel is
    /// part of the negotiated session.
    async fn create_local_offer(&self) -> Result<String, SignalError>;

    /// Apply a remote offer and produce the local answer description.
    async fn create_local_answer(&self, remote_description: &str) -> Result<String, SignalError>;

    /// Apply the remote answer to a previously created offer.
    async fn set_remote_description(&self, description: &str) -> Result<(), SignalError>;

    /// Apply one remote ICE candidate.
    async fn add_remote_candidate(
        &self,
        candidate: &str,
        mid: Option<&str>,
    ) -> Result<(), SignalError>;

    /// Release all transport resources. Idempotent.
    async fn close(&self);
}

/// An open data channel to one remote peer.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    async fn send_text(&self, text: &str) -> Result<(), SignalError>;

    async fn close(&self) -> Result<(), SignalError>;
}

/// Coarse connectivity states surfaced by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Connected => write!(f, "connected"),
            TransportState::Failed => write!(f, "failed"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

/// Events a transport queues back to the session manager.
pub enum TransportEvent {
    LocalCandidate {
        candidate: String,
        mid: Option<String>,
    },
    StateChanged(TransportState),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelClosed,
    Message(String),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalCandidate { candidate, mid } => f
                .debug_struct("LocalCandidate")
                .field("candidate", candidate)
                .field("mid", mid)
                .finish(),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::ChannelOpen(dc) => {
                f.debug_tuple("ChannelOpen").field(&dc.label()).finish()
            }
            TransportEvent::ChannelClosed => write!(f, "ChannelClosed"),
            TransportEvent::Message(text) => f.debug_tuple("Message").field(text).finish(),
        }
    }
}

/// A transport event tagged with the session it belongs to. The generation
/// counter identifies which transport instance emitted the event; events
/// from a transport that has since been replaced (e.g. a discarded glare
/// offer) are dropped by generation mismatch.
#[derive(Debug)]
pub struct TransportUpdate {
    pub remote_id: String,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Creates one [`Transport`] per session.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        remote_id: &str,
        generation: u64,
        events: mpsc::Sender<TransportUpdate>,
    ) -> Result<Arc<dyn Transport>, SignalError>;
}
