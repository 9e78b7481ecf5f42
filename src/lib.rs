pub mod config;
pub mod error;
pub mod peer;
pub mod relay;

pub use config::{Config, PeerConfig, RelayConfig};
pub use error::SignalError;
pub use peer::{Envelope, ManagerHandle, PeerNotice, RtcFactory, SessionManager, SessionState};
pub use relay::{start_relay, RelayHandle};
