//! Transport-facing sinks. Each producer turns raw transport callbacks into one closed
//! event enum and pushes it through its own [`Observable`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::identity::{PeerId, SessionId};
use crate::observable::Observable;
use crate::peer::{DiscoveryInfo, Peer, PeerStatus};
use crate::transport::{
    CertificateHandler, IncomingStream, InvitationHandler, Progress, SessionState, TransportError,
};

#[derive(Clone)]
pub enum SessionEvent {
    None,
    DevicesChanged {
        peer: Peer,
    },
    ReceivedData {
        peer: Peer,
        data: Vec<u8>,
    },
    ReceivedStream {
        peer: Peer,
        name: String,
        stream: IncomingStream,
    },
    StartedReceivingResource {
        peer: Peer,
        name: String,
        progress: Progress,
    },
    FinishedReceivingResource {
        peer: Peer,
        name: String,
        url: Option<PathBuf>,
        error: Option<TransportError>,
    },
    ReceivedCertificate {
        peer: Peer,
        certificate: Option<Vec<Vec<u8>>>,
        handler: CertificateHandler,
    },
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::None => f.write_str("None"),
            SessionEvent::DevicesChanged { peer } => {
                write!(f, "DevicesChanged({}, {:?})", peer.id(), peer.status())
            }
            SessionEvent::ReceivedData { peer, data } => {
                write!(f, "ReceivedData({}, {} bytes)", peer.id(), data.len())
            }
            SessionEvent::ReceivedStream { peer, name, .. } => {
                write!(f, "ReceivedStream({}, {name})", peer.id())
            }
            SessionEvent::StartedReceivingResource { peer, name, .. } => {
                write!(f, "StartedReceivingResource({}, {name})", peer.id())
            }
            SessionEvent::FinishedReceivingResource { peer, name, error, .. } => write!(
                f,
                "FinishedReceivingResource({}, {name}, failed: {})",
                peer.id(),
                error.is_some()
            ),
            SessionEvent::ReceivedCertificate { peer, certificate, .. } => write!(
                f,
                "ReceivedCertificate({}, {} certs)",
                peer.id(),
                certificate.as_ref().map_or(0, Vec::len)
            ),
        }
    }
}

/// A session event tagged with the session that reported it.
#[derive(Debug, Clone)]
pub struct SessionEnvelope {
    pub session: Option<SessionId>,
    pub event: SessionEvent,
}

impl SessionEnvelope {
    pub fn none() -> Self {
        Self {
            session: None,
            event: SessionEvent::None,
        }
    }
}

#[derive(Clone)]
pub struct SessionEventProducer {
    observable: Arc<Observable<SessionEnvelope>>,
}

impl SessionEventProducer {
    pub fn new(observable: Arc<Observable<SessionEnvelope>>) -> Self {
        Self { observable }
    }

    fn push(&self, session: SessionId, event: SessionEvent) {
        debug!(session = %session, event = ?event, "session event");
        self.observable.set(SessionEnvelope {
            session: Some(session),
            event,
        });
    }

    pub fn peer_changed_state(&self, session: SessionId, peer: PeerId, state: SessionState) {
        let peer = Peer::new(peer, PeerStatus::from(state));
        self.push(session, SessionEvent::DevicesChanged { peer });
    }

    pub fn received_data(&self, session: SessionId, peer: PeerId, data: Vec<u8>) {
        let peer = Peer::new(peer, PeerStatus::Connected);
        self.push(session, SessionEvent::ReceivedData { peer, data });
    }

    pub fn received_stream(
        &self,
        session: SessionId,
        peer: PeerId,
        name: &str,
        stream: Box<dyn io::Read + Send>,
    ) {
        let peer = Peer::new(peer, PeerStatus::Connected);
        self.push(
            session,
            SessionEvent::ReceivedStream {
                peer,
                name: name.to_string(),
                stream: Arc::new(parking_lot::Mutex::new(stream)),
            },
        );
    }

    pub fn started_receiving_resource(
        &self,
        session: SessionId,
        peer: PeerId,
        name: &str,
        progress: Progress,
    ) {
        let peer = Peer::new(peer, PeerStatus::Connected);
        self.push(
            session,
            SessionEvent::StartedReceivingResource {
                peer,
                name: name.to_string(),
                progress,
            },
        );
    }

    pub fn finished_receiving_resource(
        &self,
        session: SessionId,
        peer: PeerId,
        name: &str,
        url: Option<PathBuf>,
        error: Option<TransportError>,
    ) {
        let peer = Peer::new(peer, PeerStatus::Connected);
        self.push(
            session,
            SessionEvent::FinishedReceivingResource {
                peer,
                name: name.to_string(),
                url,
                error,
            },
        );
    }

    pub fn received_certificate(
        &self,
        session: SessionId,
        peer: PeerId,
        certificate: Option<Vec<Vec<u8>>>,
        handler: CertificateHandler,
    ) {
        let peer = Peer::new(peer, PeerStatus::Connected);
        self.push(
            session,
            SessionEvent::ReceivedCertificate {
                peer,
                certificate,
                handler,
            },
        );
    }
}

#[derive(Debug, Clone)]
pub enum BrowserEvent {
    None,
    FoundPeer {
        peer: Peer,
        info: Option<DiscoveryInfo>,
    },
    LostPeer {
        peer: Peer,
    },
    DidNotStartBrowsing(TransportError),
}

#[derive(Clone)]
pub struct BrowserEventProducer {
    observable: Arc<Observable<BrowserEvent>>,
}

impl BrowserEventProducer {
    pub fn new(observable: Arc<Observable<BrowserEvent>>) -> Self {
        Self { observable }
    }

    pub fn found_peer(&self, peer: PeerId, info: Option<DiscoveryInfo>) {
        debug!(peer = %peer, "found peer");
        let peer = Peer::new(peer, PeerStatus::Available).with_discovery_info(info.clone());
        self.observable.set(BrowserEvent::FoundPeer { peer, info });
    }

    pub fn lost_peer(&self, peer: PeerId) {
        debug!(peer = %peer, "lost peer");
        let peer = Peer::new(peer, PeerStatus::Unavailable);
        self.observable.set(BrowserEvent::LostPeer { peer });
    }

    pub fn did_not_start_browsing(&self, error: TransportError) {
        debug!(%error, "browsing did not start");
        self.observable.set(BrowserEvent::DidNotStartBrowsing(error));
    }
}

#[derive(Clone)]
pub enum AdvertiserEvent {
    None,
    DidReceiveInvitation {
        peer: Peer,
        context: Option<Vec<u8>>,
        handler: InvitationHandler,
    },
    DidNotStartAdvertising(TransportError),
}

impl fmt::Debug for AdvertiserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertiserEvent::None => f.write_str("None"),
            AdvertiserEvent::DidReceiveInvitation { peer, context, .. } => write!(
                f,
                "DidReceiveInvitation({}, context: {} bytes)",
                peer.id(),
                context.as_ref().map_or(0, Vec::len)
            ),
            AdvertiserEvent::DidNotStartAdvertising(e) => write!(f, "DidNotStartAdvertising({e})"),
        }
    }
}

#[derive(Clone)]
pub struct AdvertiserEventProducer {
    observable: Arc<Observable<AdvertiserEvent>>,
}

impl AdvertiserEventProducer {
    pub fn new(observable: Arc<Observable<AdvertiserEvent>>) -> Self {
        Self { observable }
    }

    pub fn received_invitation(
        &self,
        peer: PeerId,
        context: Option<Vec<u8>>,
        handler: InvitationHandler,
    ) {
        debug!(peer = %peer, "received invitation");
        let peer = Peer::new(peer, PeerStatus::Available);
        self.observable.set(AdvertiserEvent::DidReceiveInvitation {
            peer,
            context,
            handler,
        });
    }

    pub fn did_not_start_advertising(&self, error: TransportError) {
        debug!(%error, "advertising did not start");
        self.observable
            .set(AdvertiserEvent::DidNotStartAdvertising(error));
    }
}

/// Notifications from an assisted advertiser presenting invitations to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantEvent {
    None,
    WillPresentInvitation,
    DidDismissInvitation,
}

#[derive(Clone)]
pub struct AssistantEventProducer {
    observable: Arc<Observable<AssistantEvent>>,
}

impl AssistantEventProducer {
    pub fn new(observable: Arc<Observable<AssistantEvent>>) -> Self {
        Self { observable }
    }

    pub fn will_present_invitation(&self) {
        trace!("assistant will present invitation");
        self.observable.set(AssistantEvent::WillPresentInvitation);
    }

    pub fn did_dismiss_invitation(&self) {
        trace!("assistant dismissed invitation");
        self.observable.set(AssistantEvent::DidDismissInvitation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn session_producer_tags_events() {
        let obs = Arc::new(Observable::new(SessionEnvelope::none()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        obs.subscribe("t", move |env: &SessionEnvelope| s.lock().push(env.clone()));

        let producer = SessionEventProducer::new(obs.clone());
        let session = SessionId::generate();
        let peer = PeerId::new("remote").unwrap();
        producer.peer_changed_state(session, peer.clone(), SessionState::Connecting);
        producer.received_data(session, peer.clone(), vec![1, 2, 3]);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].session, Some(session));
        match &seen[0].event {
            SessionEvent::DevicesChanged { peer: p } => {
                assert_eq!(p.id(), &peer);
                assert_eq!(p.status(), PeerStatus::Connecting);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&seen[1].event, SessionEvent::ReceivedData { data, .. } if data == &[1, 2, 3]));
    }

    #[test]
    fn browser_producer_attaches_discovery_info() {
        let obs = Arc::new(Observable::new(BrowserEvent::None));
        let producer = BrowserEventProducer::new(obs.clone());
        let mut info = DiscoveryInfo::new();
        info.insert("subService".into(), "chat".into());
        producer.found_peer(PeerId::new("x").unwrap(), Some(info));
        match obs.value() {
            BrowserEvent::FoundPeer { peer, info } => {
                assert_eq!(peer.status(), PeerStatus::Available);
                assert_eq!(peer.sub_service(), "chat");
                assert!(info.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        producer.lost_peer(PeerId::new("x").unwrap());
        assert!(matches!(obs.value(), BrowserEvent::LostPeer { peer } if peer.status() == PeerStatus::Unavailable));
    }
}
