//! The manager's unified public event stream.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::peer::{DiscoveryInfo, Peer};
use crate::protocol::EventInfo;
use crate::session::PeerSession;
use crate::transport::{CertificateHandler, IncomingStream, Progress, TransportError};

/// Reply to a received invitation. The manager binds it to its local session.
pub type InvitationReply = Arc<dyn Fn(bool) + Send + Sync>;

/// Failures with no synchronous caller, surfaced through [`PeerConnectionEvent::Error`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerConnectionError {
    #[error("advertising did not start: {0}")]
    DidNotStartAdvertising(TransportError),
    #[error("browsing did not start: {0}")]
    DidNotStartBrowsing(TransportError),
    #[error(transparent)]
    Transport(TransportError),
}

#[derive(Clone)]
pub enum PeerConnectionEvent {
    /// The manager is stopped and can be started.
    Ready,
    Started,
    /// The manager stopped; always followed by `Ready`.
    Ended,
    Error(PeerConnectionError),
    /// `peer` changed status on `session`. `connected_peers` is taken after the change.
    DevicesChanged {
        session: PeerSession,
        peer: Peer,
        connected_peers: Vec<Peer>,
    },
    ReceivedData {
        session: PeerSession,
        peer: Peer,
        data: Vec<u8>,
    },
    ReceivedEvent {
        session: PeerSession,
        peer: Peer,
        event_info: EventInfo,
    },
    ReceivedStream {
        session: PeerSession,
        peer: Peer,
        name: String,
        stream: IncomingStream,
    },
    StartedReceivingResource {
        session: PeerSession,
        peer: Peer,
        name: String,
        progress: Progress,
    },
    FinishedReceivingResource {
        session: PeerSession,
        peer: Peer,
        name: String,
        url: Option<PathBuf>,
        error: Option<TransportError>,
    },
    ReceivedCertificate {
        session: PeerSession,
        peer: Peer,
        certificate: Option<Vec<Vec<u8>>>,
        handler: CertificateHandler,
    },
    FoundPeer {
        peer: Peer,
        info: Option<DiscoveryInfo>,
    },
    LostPeer {
        peer: Peer,
    },
    NearbyPeersChanged {
        found_peers: Vec<Peer>,
    },
    ReceivedInvitation {
        peer: Peer,
        context: Option<Vec<u8>>,
        handler: InvitationReply,
    },
}

impl PeerConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PeerConnectionEvent::Ready => "ready",
            PeerConnectionEvent::Started => "started",
            PeerConnectionEvent::Ended => "ended",
            PeerConnectionEvent::Error(_) => "error",
            PeerConnectionEvent::DevicesChanged { .. } => "devicesChanged",
            PeerConnectionEvent::ReceivedData { .. } => "receivedData",
            PeerConnectionEvent::ReceivedEvent { .. } => "receivedEvent",
            PeerConnectionEvent::ReceivedStream { .. } => "receivedStream",
            PeerConnectionEvent::StartedReceivingResource { .. } => "startedReceivingResource",
            PeerConnectionEvent::FinishedReceivingResource { .. } => "finishedReceivingResource",
            PeerConnectionEvent::ReceivedCertificate { .. } => "receivedCertificate",
            PeerConnectionEvent::FoundPeer { .. } => "foundPeer",
            PeerConnectionEvent::LostPeer { .. } => "lostPeer",
            PeerConnectionEvent::NearbyPeersChanged { .. } => "nearbyPeersChanged",
            PeerConnectionEvent::ReceivedInvitation { .. } => "receivedInvitation",
        }
    }
}

impl fmt::Debug for PeerConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerConnectionEvent::Error(e) => write!(f, "error({e})"),
            PeerConnectionEvent::DevicesChanged {
                session,
                peer,
                connected_peers,
            } => write!(
                f,
                "devicesChanged(session: {}, peer: {}, connected: {})",
                session.id(),
                peer,
                connected_peers.len()
            ),
            PeerConnectionEvent::ReceivedData { peer, data, .. } => {
                write!(f, "receivedData({}, {} bytes)", peer.id(), data.len())
            }
            PeerConnectionEvent::ReceivedEvent {
                peer, event_info, ..
            } => write!(f, "receivedEvent({}, {} keys)", peer.id(), event_info.len()),
            PeerConnectionEvent::ReceivedStream { peer, name, .. }
            | PeerConnectionEvent::StartedReceivingResource { peer, name, .. }
            | PeerConnectionEvent::FinishedReceivingResource { peer, name, .. } => {
                write!(f, "{}({}, {name})", self.name(), peer.id())
            }
            PeerConnectionEvent::ReceivedCertificate { peer, .. }
            | PeerConnectionEvent::FoundPeer { peer, .. }
            | PeerConnectionEvent::LostPeer { peer }
            | PeerConnectionEvent::ReceivedInvitation { peer, .. } => {
                write!(f, "{}({})", self.name(), peer.id())
            }
            PeerConnectionEvent::NearbyPeersChanged { found_peers } => {
                write!(f, "nearbyPeersChanged({} peers)", found_peers.len())
            }
            _ => f.write_str(self.name()),
        }
    }
}
