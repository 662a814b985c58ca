//! Recording transport double for unit tests: captures the producers it is handed,
//! records invites, sends and disconnects, and lets tests fire callbacks by hand.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::identity::{PeerId, SessionId};
use crate::observable::Observable;
use crate::peer::{DiscoveryInfo, Peer};
use crate::producer::{
    AdvertiserEventProducer, AssistantEventProducer, BrowserEventProducer, SessionEnvelope,
    SessionEventProducer,
};
use crate::session::PeerSession;
use crate::transport::{
    InvitationHandler, OutgoingStream, Progress, ResourceCompletion, SecurityConfig,
    SessionState, Transport, TransportAdvertiser, TransportBrowser, TransportError,
    TransportSession,
};

#[derive(Debug, Clone)]
pub(crate) struct InviteRecord {
    pub peer: PeerId,
    pub session: SessionId,
    pub context: Option<Vec<u8>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct SendRecord {
    pub session: SessionId,
    pub peers: Vec<PeerId>,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct Record {
    sessions: Vec<Arc<RecordingSession>>,
    invites: Vec<InviteRecord>,
    sends: Vec<SendRecord>,
    browser: Option<BrowserEventProducer>,
    advertiser: Option<AdvertiserEventProducer>,
    assistant: Option<AssistantEventProducer>,
    browsing: bool,
    advertising: bool,
    advertise_starts: usize,
    assistant_advertising: bool,
    on_start_browsing: Option<BrowsingHook>,
    disconnect_reports: bool,
}

type BrowsingHook = Arc<dyn Fn(&BrowserEventProducer) + Send + Sync>;

pub(crate) struct RecordingTransport {
    record: Arc<Mutex<Record>>,
    with_assistant: bool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            record: Arc::new(Mutex::new(Record::default())),
            with_assistant: false,
        })
    }

    pub fn with_assistant() -> Arc<Self> {
        Arc::new(Self {
            record: Arc::new(Mutex::new(Record::default())),
            with_assistant: true,
        })
    }

    /// Open a session outside any manager, with its own throwaway event channel.
    pub fn session_for(&self, local: &Peer, service_peer: &Peer) -> PeerSession {
        let events = SessionEventProducer::new(Arc::new(Observable::new(SessionEnvelope::none())));
        PeerSession::open(
            self,
            local.clone(),
            service_peer.clone(),
            &SecurityConfig::default(),
            events,
        )
    }

    /// Run `hook` with the browser's producer, synchronously, whenever browsing starts.
    pub fn on_start_browsing<F>(&self, hook: F)
    where
        F: Fn(&BrowserEventProducer) + Send + Sync + 'static,
    {
        self.record.lock().on_start_browsing = Some(Arc::new(hook));
    }

    /// Report `NotConnected` for every member, synchronously, when a session disconnects.
    pub fn report_disconnects(&self) {
        self.record.lock().disconnect_reports = true;
    }

    pub fn browser(&self) -> Arc<dyn TransportBrowser> {
        Arc::new(RecordingBrowser {
            record: self.record.clone(),
        })
    }

    fn session(&self, id: SessionId) -> Option<Arc<RecordingSession>> {
        self.record
            .lock()
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Mark `peer` connected on `session` without firing a callback.
    pub fn connect(&self, session: SessionId, peer: PeerId) {
        if let Some(s) = self.session(session) {
            let mut connected = s.connected.lock();
            if !connected.contains(&peer) {
                connected.push(peer);
            }
        }
    }

    /// Update `session`'s membership for `state`, then report it through the session's producer.
    pub fn fire_state(&self, session: SessionId, peer: &PeerId, state: SessionState) {
        let Some(s) = self.session(session) else {
            panic!("unknown session {session}");
        };
        {
            let mut connected = s.connected.lock();
            connected.retain(|p| p != peer);
            if state == SessionState::Connected {
                connected.push(peer.clone());
            }
        }
        s.events.peer_changed_state(session, peer.clone(), state);
    }

    pub fn fire_data(&self, session: SessionId, peer: &PeerId, data: Vec<u8>) {
        let Some(s) = self.session(session) else {
            panic!("unknown session {session}");
        };
        s.events.received_data(session, peer.clone(), data);
    }

    pub fn session_producer(&self, session: SessionId) -> SessionEventProducer {
        match self.session(session) {
            Some(s) => s.events.clone(),
            None => panic!("unknown session {session}"),
        }
    }

    pub fn browser_producer(&self) -> BrowserEventProducer {
        match self.record.lock().browser.clone() {
            Some(p) => p,
            None => panic!("no browser created"),
        }
    }

    pub fn advertiser_producer(&self) -> AdvertiserEventProducer {
        match self.record.lock().advertiser.clone() {
            Some(p) => p,
            None => panic!("no advertiser created"),
        }
    }

    pub fn assistant_producer(&self) -> Option<AssistantEventProducer> {
        self.record.lock().assistant.clone()
    }

    pub fn found(&self, peer: &PeerId, info: Option<DiscoveryInfo>) {
        self.browser_producer().found_peer(peer.clone(), info);
    }

    pub fn lost(&self, peer: &PeerId) {
        self.browser_producer().lost_peer(peer.clone());
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.record.lock().sessions.iter().map(|s| s.id).collect()
    }

    pub fn is_disconnected(&self, session: SessionId) -> bool {
        self.session(session)
            .map(|s| *s.disconnected.lock())
            .unwrap_or(false)
    }

    pub fn invites(&self) -> Vec<InviteRecord> {
        self.record.lock().invites.clone()
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.record.lock().sends.clone()
    }

    pub fn is_browsing(&self) -> bool {
        self.record.lock().browsing
    }

    pub fn is_advertising(&self) -> bool {
        self.record.lock().advertising
    }

    pub fn advertise_starts(&self) -> usize {
        self.record.lock().advertise_starts
    }

    pub fn is_assistant_advertising(&self) -> bool {
        self.record.lock().assistant_advertising
    }
}

impl Transport for RecordingTransport {
    fn create_session(
        &self,
        _local: &PeerId,
        _security: &SecurityConfig,
        events: SessionEventProducer,
    ) -> Arc<dyn TransportSession> {
        let session = Arc::new(RecordingSession {
            id: SessionId::generate(),
            record: self.record.clone(),
            events,
            connected: Mutex::new(Vec::new()),
            disconnected: Mutex::new(false),
        });
        self.record.lock().sessions.push(session.clone());
        session
    }

    fn create_browser(
        &self,
        _local: &PeerId,
        _service_type: &str,
        events: BrowserEventProducer,
    ) -> Arc<dyn TransportBrowser> {
        self.record.lock().browser = Some(events);
        self.browser()
    }

    fn create_advertiser(
        &self,
        _local: &PeerId,
        _service_type: &str,
        _discovery_info: &DiscoveryInfo,
        events: AdvertiserEventProducer,
    ) -> Arc<dyn TransportAdvertiser> {
        self.record.lock().advertiser = Some(events);
        Arc::new(RecordingAdvertiser {
            record: self.record.clone(),
            assistant: false,
        })
    }

    fn create_advertiser_assistant(
        &self,
        _local: &PeerId,
        _service_type: &str,
        _session: &Arc<dyn TransportSession>,
        events: AssistantEventProducer,
    ) -> Option<Arc<dyn TransportAdvertiser>> {
        if !self.with_assistant {
            return None;
        }
        self.record.lock().assistant = Some(events);
        Some(Arc::new(RecordingAdvertiser {
            record: self.record.clone(),
            assistant: true,
        }))
    }
}

struct RecordingSession {
    id: SessionId,
    record: Arc<Mutex<Record>>,
    events: SessionEventProducer,
    connected: Mutex<Vec<PeerId>>,
    disconnected: Mutex<bool>,
}

impl TransportSession for RecordingSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.connected.lock().clone()
    }

    fn start(&self) {
        *self.disconnected.lock() = false;
    }

    fn disconnect(&self) {
        *self.disconnected.lock() = true;
        let members: Vec<PeerId> = self.connected.lock().drain(..).collect();
        if self.record.lock().disconnect_reports {
            for peer in members {
                self.events
                    .peer_changed_state(self.id, peer, SessionState::NotConnected);
            }
        }
    }

    fn send(&self, data: &[u8], peers: &[PeerId]) -> Result<(), TransportError> {
        self.record.lock().sends.push(SendRecord {
            session: self.id,
            peers: peers.to_vec(),
            data: data.to_vec(),
        });
        Ok(())
    }

    fn start_stream(&self, _name: &str, peer: &PeerId) -> Result<OutgoingStream, TransportError> {
        if !self.connected.lock().contains(peer) {
            return Err(TransportError::NotConnected(peer.clone()));
        }
        Ok(Box::new(std::io::sink()))
    }

    fn send_resource(
        &self,
        _path: &Path,
        _name: &str,
        peer: &PeerId,
        completion: Option<ResourceCompletion>,
    ) -> Option<Progress> {
        if !self.connected.lock().contains(peer) {
            if let Some(done) = completion {
                done(Err(TransportError::NotConnected(peer.clone())));
            }
            return None;
        }
        if let Some(done) = completion {
            done(Ok(()));
        }
        Some(Progress::new(0))
    }
}

struct RecordingBrowser {
    record: Arc<Mutex<Record>>,
}

impl TransportBrowser for RecordingBrowser {
    fn start_browsing(&self) {
        let hook = {
            let mut r = self.record.lock();
            r.browsing = true;
            r.on_start_browsing.clone().zip(r.browser.clone())
        };
        if let Some((hook, producer)) = hook {
            hook(&producer);
        }
    }

    fn stop_browsing(&self) {
        self.record.lock().browsing = false;
    }

    fn invite(
        &self,
        peer: &PeerId,
        session: &Arc<dyn TransportSession>,
        context: Option<&[u8]>,
        timeout: Duration,
    ) {
        self.record.lock().invites.push(InviteRecord {
            peer: peer.clone(),
            session: session.id(),
            context: context.map(<[u8]>::to_vec),
            timeout,
        });
    }
}

struct RecordingAdvertiser {
    record: Arc<Mutex<Record>>,
    assistant: bool,
}

impl TransportAdvertiser for RecordingAdvertiser {
    fn start_advertising(&self) {
        let mut r = self.record.lock();
        if self.assistant {
            r.assistant_advertising = true;
        } else {
            r.advertising = true;
            r.advertise_starts += 1;
        }
    }

    fn stop_advertising(&self) {
        let mut r = self.record.lock();
        if self.assistant {
            r.assistant_advertising = false;
        } else {
            r.advertising = false;
        }
    }
}

/// Invitation handler that records the answer it was given.
pub(crate) fn recording_invitation_handler() -> (InvitationHandler, Arc<Mutex<Vec<(bool, SessionId)>>>) {
    let answers = Arc::new(Mutex::new(Vec::new()));
    let a = answers.clone();
    let handler: InvitationHandler = Arc::new(move |accept: bool, session: &Arc<dyn TransportSession>| {
        a.lock().push((accept, session.id()));
    });
    (handler, answers)
}
