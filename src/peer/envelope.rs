//! Signaling envelope wire format
//!
//! Envelopes are whole-message UTF-8 JSON text frames. Relay-bound envelopes
//! name their target in `to`; the relay strips `to` and stamps `from` with
//! the sender's bound identifier before forwarding, so a received envelope
//! always carries a trustworthy `from`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        description: String,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        description: String,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mid: Option<String>,
    },
    /// Relay-originated notice: the named peer is not currently bound.
    PeerNotFound { peer: String },
}

impl Envelope {
    pub fn offer(to: &str, description: String) -> Self {
        Envelope::Offer {
            to: Some(to.to_string()),
            from: None,
            description,
        }
    }

    pub fn answer(to: &str, description: String) -> Self {
        Envelope::Answer {
            to: Some(to.to_string()),
            from: None,
            description,
        }
    }

    pub fn candidate(to: &str, candidate: String, mid: Option<String>) -> Self {
        Envelope::Candidate {
            to: Some(to.to_string()),
            from: None,
            candidate,
            mid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::Candidate { .. } => "candidate",
            Envelope::PeerNotFound { .. } => "peer-not-found",
        }
    }

    pub fn to(&self) -> Option<&str> {
        match self {
            Envelope::Offer { to, .. }
            | Envelope::Answer { to, .. }
            | Envelope::Candidate { to, .. } => to.as_deref(),
            Envelope::PeerNotFound { .. } => None,
        }
    }

    pub fn from(&self) -> Option<&str> {
        match self {
            Envelope::Offer { from, .. }
            | Envelope::Answer { from, .. }
            | Envelope::Candidate { from, .. } => from.as_deref(),
            Envelope::PeerNotFound { .. } => None,
        }
    }
}
