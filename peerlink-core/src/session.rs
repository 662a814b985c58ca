//! A transport session bound to the local peer, optionally dedicated to one remote
//! "service peer" in node mode.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::identity::{PeerId, SessionId};
use crate::peer::{Peer, PeerStatus};
use crate::producer::SessionEventProducer;
use crate::transport::{
    OutgoingStream, Progress, ResourceCompletion, SecurityConfig, Transport, TransportError,
    TransportSession,
};

/// Equality is by transport session id.
#[derive(Clone)]
pub struct PeerSession {
    peer: Peer,
    service_peer: Peer,
    session: Arc<dyn TransportSession>,
}

impl PeerSession {
    /// Open a transport session for `peer`. Pass the local peer again as `service_peer`
    /// for the primary session.
    pub fn open(
        transport: &dyn Transport,
        peer: Peer,
        service_peer: Peer,
        security: &SecurityConfig,
        events: SessionEventProducer,
    ) -> Self {
        let session = transport.create_session(peer.id(), security, events);
        Self::from_transport(peer, service_peer, session)
    }

    pub fn from_transport(
        peer: Peer,
        service_peer: Peer,
        session: Arc<dyn TransportSession>,
    ) -> Self {
        Self {
            peer,
            service_peer,
            session,
        }
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn service_peer(&self) -> &Peer {
        &self.service_peer
    }

    pub fn transport(&self) -> &Arc<dyn TransportSession> {
        &self.session
    }

    pub fn is_local_service_session(&self) -> bool {
        self.peer == self.service_peer
    }

    pub fn is_distant_service_session(&self) -> bool {
        !self.is_local_service_session()
    }

    /// Peers currently connected on this session, live from the transport.
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.session
            .connected_peers()
            .into_iter()
            .map(|id| Peer::new(id, PeerStatus::Connected))
            .collect()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.session.connected_peers().iter().any(|p| p == peer)
    }

    /// Same session with refreshed peer records.
    pub(crate) fn with_peers(&self, peer: Peer, service_peer: Peer) -> Self {
        Self {
            peer,
            service_peer,
            session: self.session.clone(),
        }
    }

    pub fn start(&self) {
        self.session.start();
    }

    pub fn stop(&self) {
        self.session.disconnect();
    }

    /// Reliable send. An empty `peers` list means every peer connected on this session.
    /// Failures are logged, not returned.
    pub fn send_data(&self, data: &[u8], peers: &[Peer]) {
        let targets: Vec<PeerId> = if peers.is_empty() {
            self.session.connected_peers()
        } else {
            peers.iter().map(|p| p.id().clone()).collect()
        };
        if targets.is_empty() {
            trace!(session = %self.id(), "send_data: no connected peers");
            return;
        }
        if let Err(e) = self.session.send(data, &targets) {
            warn!(session = %self.id(), error = %e, "error sending data");
        }
    }

    pub fn send_data_stream(
        &self,
        name: &str,
        peer: &Peer,
    ) -> Result<OutgoingStream, TransportError> {
        self.session.start_stream(name, peer.id()).map_err(|e| {
            warn!(peer = %peer.id(), error = %e, "error starting stream");
            e
        })
    }

    pub fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &Peer,
        completion: Option<ResourceCompletion>,
    ) -> Option<Progress> {
        self.session.send_resource(path, name, peer.id(), completion)
    }
}

impl PartialEq for PeerSession {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for PeerSession {}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id().to_string())
            .field("service_peer", &self.service_peer.id())
            .field("local", &self.is_local_service_session())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    #[test]
    fn local_and_distant_sessions() {
        let transport = RecordingTransport::new();
        let me = Peer::current_user("me", None).unwrap();
        let local = transport.session_for(&me, &me);
        assert!(local.is_local_service_session());

        let remote = Peer::new(PeerId::new("remote").unwrap(), PeerStatus::Available);
        let service = transport.session_for(&me, &remote);
        assert!(service.is_distant_service_session());
        assert_ne!(local, service);
        assert_eq!(local, local.with_peers(me.clone(), me.clone()));
    }

    #[test]
    fn connected_peers_come_from_transport() {
        let transport = RecordingTransport::new();
        let me = Peer::current_user("me", None).unwrap();
        let session = transport.session_for(&me, &me);
        let remote = PeerId::new("remote").unwrap();
        transport.connect(session.id(), remote.clone());

        let peers = session.connected_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].status(), PeerStatus::Connected);
        assert!(session.contains(&remote));
    }

    #[test]
    fn send_data_without_targets_is_skipped() {
        let transport = RecordingTransport::new();
        let me = Peer::current_user("me", None).unwrap();
        let session = transport.session_for(&me, &me);
        session.send_data(b"x", &[]);
        assert!(transport.sends().is_empty());

        let remote = PeerId::new("remote").unwrap();
        transport.connect(session.id(), remote.clone());
        session.send_data(b"x", &[]);
        let sends = transport.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].peers, vec![remote]);
    }
}
