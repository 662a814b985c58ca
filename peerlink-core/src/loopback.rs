//! In-process transport linking managers of one process through a shared hub.
//!
//! Nothing is delivered from inside a transport call: every callback is queued and runs
//! when the host calls [`LoopbackHub::pump`].

use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::identity::{PeerId, SessionId};
use crate::peer::DiscoveryInfo;
use crate::producer::{
    AdvertiserEventProducer, AssistantEventProducer, BrowserEventProducer, SessionEventProducer,
};
use crate::transport::{
    CertificateHandler, InvitationHandler, OutgoingStream, Progress, ResourceCompletion,
    SecurityConfig, SessionState, Transport, TransportAdvertiser, TransportBrowser,
    TransportError, TransportSession,
};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct HubState {
    queue: VecDeque<Callback>,
    advertisers: Vec<AdvertiserEntry>,
    browsers: Vec<BrowserEntry>,
    sessions: Vec<SessionEntry>,
}

struct AdvertiserEntry {
    key: u64,
    peer: PeerId,
    service_type: String,
    info: DiscoveryInfo,
    events: AdvertiserKind,
    active: bool,
}

enum AdvertiserKind {
    Plain(AdvertiserEventProducer),
    /// Presents and accepts invitations itself, on the bound session.
    Assisted {
        events: AssistantEventProducer,
        session: SessionId,
    },
}

struct BrowserEntry {
    key: u64,
    peer: PeerId,
    service_type: String,
    events: BrowserEventProducer,
    active: bool,
    seen: HashSet<PeerId>,
}

struct SessionEntry {
    id: SessionId,
    security: SecurityConfig,
    events: SessionEventProducer,
    /// Remote peer and the remote session it is reached through.
    links: Vec<(PeerId, SessionId)>,
}

impl HubState {
    fn session(&self, id: SessionId) -> Option<&SessionEntry> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn session_mut(&mut self, id: SessionId) -> Option<&mut SessionEntry> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn link_of(&self, session: SessionId, peer: &PeerId) -> Option<SessionId> {
        self.session(session)?
            .links
            .iter()
            .find(|(p, _)| p == peer)
            .map(|(_, remote)| *remote)
    }

    fn queue_state(&mut self, session: SessionId, peer: PeerId, state: SessionState) {
        if let Some(events) = self.session(session).map(|s| s.events.clone()) {
            self.queue
                .push_back(Box::new(move || events.peer_changed_state(session, peer, state)));
        }
    }

    fn advertises(&self, peer: &PeerId, service_type: &str) -> bool {
        self.advertisers
            .iter()
            .any(|a| a.active && &a.peer == peer && a.service_type == service_type)
    }

    /// Announce every active advertiser to every active browser that has not seen it.
    fn announce(&mut self) {
        let HubState {
            queue,
            advertisers,
            browsers,
            ..
        } = self;
        for browser in browsers.iter_mut().filter(|b| b.active) {
            for adv in advertisers.iter().filter(|a| a.active) {
                if adv.peer == browser.peer
                    || adv.service_type != browser.service_type
                    || !browser.seen.insert(adv.peer.clone())
                {
                    continue;
                }
                let events = browser.events.clone();
                let peer = adv.peer.clone();
                let info = adv.info.clone();
                queue.push_back(Box::new(move || events.found_peer(peer, Some(info))));
            }
        }
    }

    /// Report loss of advertisers that went away to browsers that had seen them.
    fn withdraw(&mut self) {
        let gone: Vec<(PeerId, String)> = self
            .browsers
            .iter()
            .flat_map(|b| b.seen.iter().map(move |p| (p.clone(), b.service_type.clone())))
            .filter(|(p, svc)| !self.advertises(p, svc))
            .collect();
        for (peer, service_type) in gone {
            for browser in self.browsers.iter_mut() {
                if browser.service_type != service_type || !browser.seen.remove(&peer) {
                    continue;
                }
                let events = browser.events.clone();
                let lost = peer.clone();
                self.queue.push_back(Box::new(move || events.lost_peer(lost)));
            }
        }
    }
}

/// Shared medium. Clone freely; all clones are the same hub.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
    next_key: Arc<AtomicU64>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport for one manager attached to this hub.
    pub fn transport(&self) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport { hub: self.clone() })
    }

    /// Run queued callbacks, including those queued while pumping, until the queue is
    /// empty. Returns how many ran.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.state.lock().queue.pop_front();
            let Some(callback) = next else {
                break;
            };
            callback();
            delivered += 1;
        }
        if delivered > 0 {
            trace!(delivered, "loopback pump");
        }
        delivered
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    fn downgrade(&self) -> Weak<Mutex<HubState>> {
        Arc::downgrade(&self.state)
    }
}

pub struct LoopbackTransport {
    hub: LoopbackHub,
}

impl Transport for LoopbackTransport {
    fn create_session(
        &self,
        local: &PeerId,
        security: &SecurityConfig,
        events: SessionEventProducer,
    ) -> Arc<dyn TransportSession> {
        let id = SessionId::generate();
        self.hub.state.lock().sessions.push(SessionEntry {
            id,
            security: security.clone(),
            events,
            links: Vec::new(),
        });
        trace!(session = %id, peer = %local, "loopback session created");
        Arc::new(LoopbackSession {
            id,
            local: local.clone(),
            hub: self.hub.clone(),
        })
    }

    fn create_browser(
        &self,
        local: &PeerId,
        service_type: &str,
        events: BrowserEventProducer,
    ) -> Arc<dyn TransportBrowser> {
        let key = self.hub.key();
        self.hub.state.lock().browsers.push(BrowserEntry {
            key,
            peer: local.clone(),
            service_type: service_type.to_string(),
            events,
            active: false,
            seen: HashSet::new(),
        });
        Arc::new(LoopbackBrowser {
            key,
            local: local.clone(),
            service_type: service_type.to_string(),
            hub: self.hub.clone(),
        })
    }

    fn create_advertiser(
        &self,
        local: &PeerId,
        service_type: &str,
        discovery_info: &DiscoveryInfo,
        events: AdvertiserEventProducer,
    ) -> Arc<dyn TransportAdvertiser> {
        self.advertiser(
            local,
            service_type,
            discovery_info.clone(),
            AdvertiserKind::Plain(events),
        )
    }

    fn create_advertiser_assistant(
        &self,
        local: &PeerId,
        service_type: &str,
        session: &Arc<dyn TransportSession>,
        events: AssistantEventProducer,
    ) -> Option<Arc<dyn TransportAdvertiser>> {
        Some(self.advertiser(
            local,
            service_type,
            DiscoveryInfo::new(),
            AdvertiserKind::Assisted {
                events,
                session: session.id(),
            },
        ))
    }
}

impl LoopbackTransport {
    fn advertiser(
        &self,
        local: &PeerId,
        service_type: &str,
        info: DiscoveryInfo,
        events: AdvertiserKind,
    ) -> Arc<dyn TransportAdvertiser> {
        let key = self.hub.key();
        self.hub.state.lock().advertisers.push(AdvertiserEntry {
            key,
            peer: local.clone(),
            service_type: service_type.to_string(),
            info,
            events,
            active: false,
        });
        Arc::new(LoopbackAdvertiser {
            key,
            hub: self.hub.clone(),
        })
    }
}

struct LoopbackAdvertiser {
    key: u64,
    hub: LoopbackHub,
}

impl TransportAdvertiser for LoopbackAdvertiser {
    fn start_advertising(&self) {
        let mut st = self.hub.state.lock();
        if let Some(a) = st.advertisers.iter_mut().find(|a| a.key == self.key) {
            a.active = true;
        }
        st.announce();
    }

    fn stop_advertising(&self) {
        let mut st = self.hub.state.lock();
        if let Some(a) = st.advertisers.iter_mut().find(|a| a.key == self.key) {
            a.active = false;
        }
        st.withdraw();
    }
}

struct LoopbackBrowser {
    key: u64,
    local: PeerId,
    service_type: String,
    hub: LoopbackHub,
}

impl TransportBrowser for LoopbackBrowser {
    fn start_browsing(&self) {
        let mut st = self.hub.state.lock();
        if let Some(b) = st.browsers.iter_mut().find(|b| b.key == self.key) {
            b.active = true;
        }
        st.announce();
    }

    fn stop_browsing(&self) {
        let mut st = self.hub.state.lock();
        if let Some(b) = st.browsers.iter_mut().find(|b| b.key == self.key) {
            b.active = false;
            b.seen.clear();
        }
    }

    /// The timeout is not enforced: an unanswered invitation stays open.
    fn invite(
        &self,
        peer: &PeerId,
        session: &Arc<dyn TransportSession>,
        context: Option<&[u8]>,
        _timeout: Duration,
    ) {
        let inviter_session = session.id();
        let mut st = self.hub.state.lock();
        // An assisted advertiser takes precedence over the plain one of the same peer.
        let target = st
            .advertisers
            .iter()
            .enumerate()
            .filter(|(_, a)| a.active && &a.peer == peer && a.service_type == self.service_type)
            .max_by_key(|(_, a)| matches!(a.events, AdvertiserKind::Assisted { .. }))
            .map(|(i, _)| i);
        let Some(target) = target else {
            debug!(peer = %peer, "loopback invite: peer not advertising");
            st.queue_state(inviter_session, peer.clone(), SessionState::NotConnected);
            return;
        };
        st.queue_state(inviter_session, peer.clone(), SessionState::Connecting);

        let handler = answer_handler(
            self.hub.downgrade(),
            self.local.clone(),
            inviter_session,
            peer.clone(),
        );
        let context = context.map(<[u8]>::to_vec);
        let entry = &st.advertisers[target];
        let invitation: Callback = match &entry.events {
            AdvertiserKind::Plain(events) => {
                let events = events.clone();
                let from = self.local.clone();
                Box::new(move || events.received_invitation(from, context, handler))
            }
            AdvertiserKind::Assisted { events, session } => {
                let events = events.clone();
                let session: Arc<dyn TransportSession> = Arc::new(LoopbackSession {
                    id: *session,
                    local: entry.peer.clone(),
                    hub: self.hub.clone(),
                });
                Box::new(move || {
                    events.will_present_invitation();
                    handler(true, &session);
                    events.did_dismiss_invitation();
                })
            }
        };
        st.queue.push_back(invitation);
    }
}

/// Handler answering an invitation from `inviter` (on `inviter_session`) to `invitee`.
/// Only the first answer counts.
fn answer_handler(
    hub: Weak<Mutex<HubState>>,
    inviter: PeerId,
    inviter_session: SessionId,
    invitee: PeerId,
) -> InvitationHandler {
    let answered = AtomicBool::new(false);
    Arc::new(move |accept: bool, session: &Arc<dyn TransportSession>| {
        if answered.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(hub) = hub.upgrade() else {
            return;
        };
        let mut st = hub.lock();
        if !accept {
            debug!(peer = %invitee, "loopback invitation declined");
            st.queue_state(inviter_session, invitee.clone(), SessionState::NotConnected);
            return;
        }
        let accepting = session.id();
        let linked = match (st.session(inviter_session), st.session(accepting)) {
            (Some(a), Some(b)) => Some((a.security.identity.clone(), b.events.clone())),
            _ => None,
        };
        let Some((certificate, invitee_events)) = linked else {
            warn!(peer = %invitee, "loopback invitation accepted on unknown session");
            st.queue_state(inviter_session, invitee.clone(), SessionState::NotConnected);
            return;
        };

        if let Some(s) = st.session_mut(inviter_session) {
            s.links.retain(|(p, _)| p != &invitee);
            s.links.push((invitee.clone(), accepting));
        }
        if let Some(s) = st.session_mut(accepting) {
            s.links.retain(|(p, _)| p != &inviter);
            s.links.push((inviter.clone(), inviter_session));
        }

        if !certificate.is_empty() {
            let from = inviter.clone();
            let handler: CertificateHandler = Arc::new(move |accepted: bool| {
                trace!(accepted, "loopback certificate answered");
            });
            st.queue.push_back(Box::new(move || {
                invitee_events.received_certificate(accepting, from, Some(certificate), handler)
            }));
        }
        st.queue_state(inviter_session, invitee.clone(), SessionState::Connected);
        st.queue_state(accepting, inviter.clone(), SessionState::Connected);
        debug!(inviter = %inviter, invitee = %invitee, "loopback peers linked");
    })
}

struct LoopbackSession {
    id: SessionId,
    local: PeerId,
    hub: LoopbackHub,
}

impl LoopbackSession {
    fn remote(&self, peer: &PeerId) -> Result<(SessionId, SessionEventProducer), TransportError> {
        let st = self.hub.state.lock();
        st.link_of(self.id, peer)
            .and_then(|remote| st.session(remote).map(|s| (remote, s.events.clone())))
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))
    }
}

impl TransportSession for LoopbackSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.hub
            .state
            .lock()
            .session(self.id)
            .map(|s| s.links.iter().map(|(p, _)| p.clone()).collect())
            .unwrap_or_default()
    }

    fn start(&self) {}

    fn disconnect(&self) {
        let mut st = self.hub.state.lock();
        let links = match st.session_mut(self.id) {
            Some(s) => std::mem::take(&mut s.links),
            None => return,
        };
        for (peer, remote) in links {
            if let Some(r) = st.session_mut(remote) {
                r.links.retain(|(p, s)| !(p == &self.local && *s == self.id));
            }
            st.queue_state(remote, self.local.clone(), SessionState::NotConnected);
            st.queue_state(self.id, peer, SessionState::NotConnected);
        }
    }

    fn send(&self, data: &[u8], peers: &[PeerId]) -> Result<(), TransportError> {
        let mut unreachable = None;
        for peer in peers {
            match self.remote(peer) {
                Ok((remote, events)) => {
                    let from = self.local.clone();
                    let data = data.to_vec();
                    self.hub
                        .state
                        .lock()
                        .queue
                        .push_back(Box::new(move || events.received_data(remote, from, data)));
                }
                Err(e) => unreachable = Some(e),
            }
        }
        unreachable.map_or(Ok(()), Err)
    }

    fn start_stream(&self, name: &str, peer: &PeerId) -> Result<OutgoingStream, TransportError> {
        let (remote, events) = self.remote(peer)?;
        let (tx, rx) = mpsc::channel();
        let from = self.local.clone();
        let name = name.to_string();
        let reader = ChannelReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        };
        self.hub.state.lock().queue.push_back(Box::new(move || {
            events.received_stream(remote, from, &name, Box::new(reader))
        }));
        Ok(Box::new(ChannelWriter { tx }))
    }

    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerId,
        completion: Option<ResourceCompletion>,
    ) -> Option<Progress> {
        let (remote, events) = match self.remote(peer) {
            Ok(r) => r,
            Err(e) => {
                if let Some(done) = completion {
                    done(Err(e));
                }
                return None;
            }
        };

        let total = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let progress = Progress::new(total);
        let destination = received_path(remote, name);
        let copied = std::fs::copy(path, &destination);
        let (url, error) = match copied {
            Ok(n) => {
                progress.set_completed(n);
                (Some(destination), None)
            }
            Err(e) => (None, Some(TransportError::from(e))),
        };
        let result = error.clone().map_or(Ok(()), Err);

        let from = self.local.clone();
        let name = name.to_string();
        let started = progress.clone();
        self.hub.state.lock().queue.push_back(Box::new(move || {
            events.started_receiving_resource(remote, from.clone(), &name, started);
            events.finished_receiving_resource(remote, from, &name, url, error);
        }));
        if let Some(done) = completion {
            done(result);
        }
        Some(progress)
    }
}

fn received_path(session: SessionId, name: &str) -> PathBuf {
    let file = Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "resource".to_string());
    std::env::temp_dir().join(format!("peerlink-{session}-{file}"))
}

struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads what the paired writer sent; end of stream once the writer is dropped.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
