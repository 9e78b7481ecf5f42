//! Peer-side negotiation core: identifiers, envelopes, sessions, the session
//! manager and the data-channel registry.

pub mod envelope;
pub mod identity;
pub mod manager;
pub mod registry;
pub mod rendezvous;
pub mod session;
pub mod transport;
pub mod webrtc;


pub use envelope::Envelope;
pub use manager::{ManagerHandle, ManagerState, PeerNotice, SessionManager};
pub use registry::ChannelRegistry;
pub use rendezvous::query_peers;
pub use session::{advance, PeerSession, SessionEvent, SessionState};
pub use transport::{
    DataChannel, Transport, TransportEvent, TransportFactory, TransportState, TransportUpdate,
};
pub use webrtc::{RtcFactory, CHANNEL_LABEL};
