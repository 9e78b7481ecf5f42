//! Error taxonomy for signaling and session management
//!
//! Every per-session error is contained to that session; none of these
//! variants is process-fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    /// Malformed or unusable peer identifier supplied by the local application.
    #[error("invalid peer identifier: {0}")]
    InvalidPeer(String),

    /// The relay could not route to the named peer.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// No answer or connection within the configured bound.
    #[error("negotiation with {0} timed out")]
    NegotiationTimeout(String),

    /// The underlying transport failed; terminal for the session.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Out-of-state or otherwise unexpected signaling traffic. Logged and
    /// dropped by the manager, never propagated as fatal.
    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    /// No open data channel for the named peer.
    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    /// The session manager's event loop is no longer running.
    #[error("session manager stopped")]
    ManagerStopped,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
