//! Peer invitation and multi-session connection management over a pluggable
//! nearby-peer transport.
//! Host-driven: the host supplies a [`Transport`]; the manager reconciles its callbacks
//! into one peer directory and one event stream.

pub mod identity;
pub mod peer;
pub mod protocol;
pub mod wire;

pub mod transport;
pub mod observable;
pub mod producer;

pub mod error;
pub mod event;
pub mod session;
pub mod invitation;
pub mod browser;
pub mod advertiser;
pub mod retry;
pub mod registry;
pub mod config;
pub mod responder;
pub mod manager;

// In-process transport for demos and end-to-end tests.
pub mod loopback;

#[cfg(test)]
mod testing;

pub use identity::{IdentityError, PeerId, SessionId};
pub use peer::{DiscoveryInfo, Peer, PeerStatus, SUB_SERVICE_KEY};
pub use protocol::{EventInfo, EventValue};
pub use wire::{decode_event, encode_event, FrameDecodeError, FrameEncodeError};
pub use transport::{
    EncryptionPreference, Progress, SecurityConfig, SessionState, Transport,
    TransportAdvertiser, TransportBrowser, TransportError, TransportSession,
};
pub use error::ManagerError;
pub use event::{PeerConnectionError, PeerConnectionEvent};
pub use session::PeerSession;
pub use invitation::{Invitation, InvitationError, InvitationStatus};
pub use browser::{PeerBrowser, DEFAULT_INVITE_TIMEOUT};
pub use retry::ReconnectToken;
pub use registry::ManagerRegistry;
pub use config::{ConnectionType, ManagerConfig, ManagerMode};
pub use responder::{Delivery, PeerConnectionResponder};
pub use manager::{PeerConnectionManager, DEFAULT_RECONNECT_DELAY};
pub use loopback::{LoopbackHub, LoopbackTransport};
