//! Top-level coordinator. Owns the local session, the per-peer service sessions, the
//! browser and the event channels; reconciles transport reports into one peer/session
//! directory and one public event stream.
//!
//! All shared state sits behind one non-reentrant mutex. Public events produced inside a
//! critical section are queued and published once the lock is released, so listeners may
//! call back into the manager. Channel events the transport raises synchronously on the
//! thread holding that mutex are deferred the same way.

mod outbound;

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::advertiser::{PeerAdvertiser, PeerAdvertiserAssistant};
use crate::browser::{PeerBrowser, SessionFactory, DEFAULT_INVITE_TIMEOUT};
use crate::config::{ConnectionType, ManagerConfig, ManagerMode};
use crate::error::ManagerError;
use crate::event::{InvitationReply, PeerConnectionError, PeerConnectionEvent};
use crate::identity::PeerId;
use crate::invitation::Invitation;
use crate::observable::Observable;
use crate::peer::{merge_unique, DiscoveryInfo, Peer, PeerStatus, SUB_SERVICE_KEY};
use crate::producer::{
    AdvertiserEvent, AdvertiserEventProducer, AssistantEvent, AssistantEventProducer,
    BrowserEvent, BrowserEventProducer, SessionEnvelope, SessionEvent, SessionEventProducer,
};
use crate::registry::{ManagerRegistry, Registrant};
use crate::responder::{Delivery, PeerConnectionResponder};
use crate::retry::RetryQueue;
use crate::session::PeerSession;
use crate::transport::{InvitationHandler, SecurityConfig, Transport};
use crate::wire::decode_event;

pub use outbound::{SharedResourceCompletion, DEFAULT_RECONNECT_DELAY};

const PEERS_KEY: &str = "manager.peers";
const DISPATCH_KEY: &str = "manager.dispatch";
const POLICY_KEY: &str = "manager.policy";

pub struct PeerConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    instance: Uuid,
    local: Peer,
    config: ManagerConfig,
    discovery_info: DiscoveryInfo,
    security: SecurityConfig,
    transport: Arc<dyn Transport>,
    /// Primary session; lives as long as the manager.
    session: PeerSession,
    advertiser: Option<PeerAdvertiser>,
    registry: Option<ManagerRegistry>,
    state: Mutex<ManagerState>,
    /// Thread inside the current critical section.
    lock_owner: Mutex<Option<ThreadId>>,
    /// Channel handlers raised on the thread holding `state`; run by the next `flush`.
    deferred: Mutex<VecDeque<Deferred>>,
    /// Serializes publication so events reach listeners in queue order.
    publish: ReentrantMutex<()>,
    events: Arc<Observable<PeerConnectionEvent>>,
    responder: PeerConnectionResponder,
    session_events: Arc<Observable<SessionEnvelope>>,
    browser_events: Arc<Observable<BrowserEvent>>,
    advertiser_events: Arc<Observable<AdvertiserEvent>>,
    assistant_events: Arc<Observable<AssistantEvent>>,
    session_producer: SessionEventProducer,
}

struct ManagerState {
    running: bool,
    found_peers: Vec<Peer>,
    services_sessions: Vec<PeerSession>,
    browser: Option<PeerBrowser>,
    retry_queue: Option<RetryQueue>,
    assistant: Option<PeerAdvertiserAssistant>,
    outbox: VecDeque<PeerConnectionEvent>,
}

type Deferred = Box<dyn FnOnce() + Send>;

/// Locked manager state; records the owning thread while held.
struct StateGuard<'a> {
    state: MutexGuard<'a, ManagerState>,
    owner: &'a Mutex<Option<ThreadId>>,
}

impl Deref for StateGuard<'_> {
    type Target = ManagerState;

    fn deref(&self) -> &ManagerState {
        &self.state
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut ManagerState {
        &mut self.state
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.owner.lock() = None;
    }
}

/// Creates one service session per invited peer (node mode), replacing any previous
/// session dedicated to that peer.
struct ServiceSessionFactory<'a> {
    inner: &'a ManagerInner,
    sessions: &'a mut Vec<PeerSession>,
}

impl SessionFactory for ServiceSessionFactory<'_> {
    fn session_for(&mut self, peer: &Peer) -> Option<PeerSession> {
        for stale in self.sessions.iter().filter(|s| s.service_peer() == peer) {
            stale.stop();
        }
        self.sessions.retain(|s| s.service_peer() != peer);

        let session = PeerSession::open(
            self.inner.transport.as_ref(),
            self.inner.local.clone(),
            peer.clone(),
            &self.inner.security,
            self.inner.session_producer.clone(),
        );
        session.start();
        debug!(peer = %peer.id(), session = %session.id(), "opened service session");
        self.sessions.push(session.clone());
        Some(session)
    }
}

impl PeerConnectionManager {
    pub fn new(config: ManagerConfig, transport: Arc<dyn Transport>) -> Result<Self, ManagerError> {
        Self::build(config, transport, None)
    }

    /// Like [`new`](Self::new), claiming the (service type, sub-service) channel in
    /// `registry` on every start.
    pub fn with_registry(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        registry: ManagerRegistry,
    ) -> Result<Self, ManagerError> {
        Self::build(config, transport, Some(registry))
    }

    fn build(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        registry: Option<ManagerRegistry>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let discovery_info = config.merged_discovery_info();
        let local = Peer::current_user(&config.display_name, Some(discovery_info.clone()))?;
        let security = config.security();

        let events = Arc::new(Observable::new(PeerConnectionEvent::Ready));
        let session_events = Arc::new(Observable::new(SessionEnvelope::none()));
        let browser_events = Arc::new(Observable::new(BrowserEvent::None));
        let advertiser_events = Arc::new(Observable::new(AdvertiserEvent::None));
        let assistant_events = Arc::new(Observable::new(AssistantEvent::None));
        let session_producer = SessionEventProducer::new(session_events.clone());

        let session = PeerSession::open(
            transport.as_ref(),
            local.clone(),
            local.clone(),
            &security,
            session_producer.clone(),
        );

        let advertiser = match config.manager_mode {
            ManagerMode::Master | ManagerMode::Node => Some(PeerAdvertiser::new(
                transport.create_advertiser(
                    local.id(),
                    &config.service_type,
                    &discovery_info,
                    AdvertiserEventProducer::new(advertiser_events.clone()),
                ),
            )),
            ManagerMode::Slave => None,
        };

        let browser = match config.manager_mode {
            ManagerMode::Master => None,
            mode => {
                let raw = transport.create_browser(
                    local.id(),
                    &config.service_type,
                    BrowserEventProducer::new(browser_events.clone()),
                );
                let fixed = (mode == ManagerMode::Slave).then(|| session.clone());
                Some(PeerBrowser::new(raw, fixed))
            }
        };

        info!(
            peer = %local.id(),
            service_type = %config.service_type,
            mode = ?config.manager_mode,
            connection = ?config.connection_type,
            "connection manager created"
        );

        let inner = ManagerInner {
            instance: Uuid::new_v4(),
            local,
            discovery_info,
            security,
            transport,
            session,
            advertiser,
            registry,
            state: Mutex::new(ManagerState {
                running: false,
                found_peers: Vec::new(),
                services_sessions: Vec::new(),
                browser,
                retry_queue: None,
                assistant: None,
                outbox: VecDeque::new(),
            }),
            lock_owner: Mutex::new(None),
            deferred: Mutex::new(VecDeque::new()),
            publish: ReentrantMutex::new(()),
            responder: PeerConnectionResponder::new(events.clone()),
            events,
            session_events,
            browser_events,
            advertiser_events,
            assistant_events,
            session_producer,
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // --- lifecycle ---

    pub fn start(&self) -> Result<(), ManagerError> {
        self.start_with(|| {})
    }

    /// Start sessions, browsing and advertising per mode and connection type, then call
    /// `completion`. Fails for invite-only in slave mode: there is no advertiser to
    /// present invitations through.
    pub fn start_with<F: FnOnce()>(&self, completion: F) -> Result<(), ManagerError> {
        let inner = &self.inner;
        if inner.config.connection_type == ConnectionType::InviteOnly
            && inner.config.manager_mode == ManagerMode::Slave
        {
            return Err(ManagerError::UnsupportedModeUsage);
        }
        inner.claim_channel();
        let result = {
            let mut st = inner.lock_state();
            inner.start_locked(&mut st)
        };
        inner.flush();
        result?;
        completion();
        Ok(())
    }

    /// Disconnect every session, cancel pending reconnects, forget found peers and
    /// invitations, then publish `Ended` followed by `Ready`. Safe from any state.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop, then start again. Existing connections are dropped.
    pub fn refresh_with<F: FnOnce()>(&self, completion: F) -> Result<(), ManagerError> {
        self.stop();
        self.start_with(completion)
    }

    pub fn refresh(&self) -> Result<(), ManagerError> {
        self.refresh_with(|| {})
    }

    /// Start browsing for peers to invite.
    pub fn open_session(&self) {
        if let Some(b) = self.inner.lock_state().browser.as_ref() {
            b.start_browsing();
        }
        self.inner.flush();
    }

    /// Stop browsing for peers to invite.
    pub fn close_session(&self) {
        if let Some(b) = self.inner.lock_state().browser.as_ref() {
            b.stop_browsing();
        }
        self.inner.flush();
    }

    // --- accessors ---

    pub fn local_peer(&self) -> &Peer {
        &self.inner.local
    }

    pub fn manager_mode(&self) -> ManagerMode {
        self.inner.config.manager_mode
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.inner.config.connection_type
    }

    pub fn service_type(&self) -> &str {
        &self.inner.config.service_type
    }

    pub fn sub_service(&self) -> &str {
        &self.inner.config.sub_service
    }

    pub fn discovery_info(&self) -> &DiscoveryInfo {
        &self.inner.discovery_info
    }

    /// The primary session.
    pub fn session(&self) -> &PeerSession {
        &self.inner.session
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    pub fn found_peers(&self) -> Vec<Peer> {
        self.inner.lock_state().found_peers.clone()
    }

    /// Peers connected on the primary session.
    pub fn connected_peers(&self) -> Vec<Peer> {
        self.inner.session.connected_peers()
    }

    /// Distinct service peers of the service sessions.
    pub fn connected_service_peers(&self) -> Vec<Peer> {
        connected_service_peers(&self.inner.lock_state())
    }

    pub fn all_available_sessions(&self) -> Vec<PeerSession> {
        self.inner.all_sessions(&self.inner.lock_state())
    }

    pub fn all_available_peers(&self) -> Vec<Peer> {
        self.inner.all_available_peers(&self.inner.lock_state())
    }

    pub fn invitation(&self, peer: &PeerId) -> Option<Invitation> {
        self.inner
            .lock_state()
            .browser
            .as_ref()
            .and_then(|b| b.invitation(peer).cloned())
    }

    /// The last published event.
    pub fn current_event(&self) -> PeerConnectionEvent {
        self.inner.events.value()
    }

    /// Fails with `PeerUnavailable` unless `peer` was discovered, and with
    /// `ServiceAlreadyConnected` if a service session already reaches it.
    pub fn peer_service_available(&self, peer: &Peer) -> Result<(), ManagerError> {
        peer_service_available(&self.inner.lock_state(), peer)
    }

    // --- listeners ---

    pub fn responder(&self) -> &PeerConnectionResponder {
        &self.inner.responder
    }

    pub fn listen_on<F>(&self, key: &str, delivery: Delivery, listener: F)
    where
        F: Fn(&PeerConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.responder.listen_on(key, delivery, listener);
    }

    pub fn observe_events<F>(&self, key: &str, listener: F)
    where
        F: Fn(&crate::protocol::EventInfo, &PeerSession, &Peer) + Send + Sync + 'static,
    {
        self.inner.responder.observe_events(key, listener);
    }

    pub fn remove_listener(&self, key: &str) -> bool {
        self.inner.responder.remove_listener(key)
    }

    pub fn remove_all_listeners(&self) {
        self.inner.responder.remove_all_listeners();
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.inner.stop();
        self.inner.responder.remove_all_listeners();
    }
}

impl Registrant for ManagerInner {
    fn evict(&self) {
        info!(peer = %self.local.id(), "evicted by another manager on the same channel");
        self.stop();
        self.responder.remove_all_listeners();
    }
}

impl ManagerInner {
    fn lock_state(&self) -> StateGuard<'_> {
        let state = self.state.lock();
        *self.lock_owner.lock() = Some(thread::current().id());
        StateGuard {
            state,
            owner: &self.lock_owner,
        }
    }

    fn locked_by_current_thread(&self) -> bool {
        *self.lock_owner.lock() == Some(thread::current().id())
    }

    fn run_deferred(&self) {
        loop {
            let next = self.deferred.lock().pop_front();
            let Some(job) = next else {
                break;
            };
            job();
        }
    }

    fn claim_channel(self: &Arc<Self>) {
        let Some(registry) = &self.registry else {
            return;
        };
        let weak: Weak<dyn Registrant> = Arc::downgrade(self) as Weak<dyn Registrant>;
        if let Some(previous) = registry.claim(
            &self.config.service_type,
            &self.config.sub_service,
            self.instance,
            weak,
        ) {
            previous.evict();
        }
    }

    fn release_channel(&self) {
        if let Some(registry) = &self.registry {
            registry.release(
                &self.config.service_type,
                &self.config.sub_service,
                self.instance,
            );
        }
    }

    fn start_locked(self: &Arc<Self>, st: &mut ManagerState) -> Result<(), ManagerError> {
        self.configure_peer_observers();
        self.configure_dispatch();
        self.configure_connection_policy();

        if let Some(previous) = st.retry_queue.take() {
            previous.shutdown();
        }
        st.retry_queue = Some(RetryQueue::new()?);

        self.session.start();
        if let Some(browser) = st.browser.as_ref() {
            browser.start_browsing();
        }
        if let Some(advertiser) = &self.advertiser {
            advertiser.restart();
        }
        if self.config.connection_type == ConnectionType::InviteOnly {
            if st.assistant.is_none() {
                st.assistant = self
                    .transport
                    .create_advertiser_assistant(
                        self.local.id(),
                        &self.config.service_type,
                        self.session.transport(),
                        AssistantEventProducer::new(self.assistant_events.clone()),
                    )
                    .map(PeerAdvertiserAssistant::assistant);
            }
            match st.assistant.as_ref() {
                Some(assistant) => assistant.start_advertising(),
                None => warn!("transport has no assisted advertiser"),
            }
        }

        st.running = true;
        info!(peer = %self.local.id(), "connection manager started");
        st.outbox.push_back(PeerConnectionEvent::Started);
        Ok(())
    }

    fn stop(&self) {
        {
            let mut st = self.lock_state();
            self.stop_locked(&mut st);
        }
        self.flush();
        self.release_channel();
    }

    fn stop_locked(&self, st: &mut ManagerState) {
        if let Some(queue) = st.retry_queue.take() {
            queue.shutdown();
        }
        if let Some(browser) = st.browser.as_mut() {
            browser.clear_invitations();
        }

        self.session.stop();
        for session in st.services_sessions.drain(..) {
            session.stop();
        }

        if let Some(browser) = st.browser.as_ref() {
            browser.stop_browsing();
        }
        if let Some(advertiser) = &self.advertiser {
            advertiser.stop_advertising();
        }
        if let Some(assistant) = &st.assistant {
            assistant.stop_advertising();
        }

        st.outbox.push_back(PeerConnectionEvent::Ended);
        st.found_peers.clear();
        st.outbox.push_back(PeerConnectionEvent::NearbyPeersChanged {
            found_peers: Vec::new(),
        });

        self.session_events.clear_subscribers();
        self.browser_events.clear_subscribers();
        self.advertiser_events.clear_subscribers();
        self.assistant_events.clear_subscribers();
        self.deferred.lock().clear();
        self.session_events.reset();
        self.browser_events.reset();
        self.advertiser_events.reset();
        self.assistant_events.reset();

        if st.running {
            info!(peer = %self.local.id(), "connection manager stopped");
        }
        st.running = false;
        st.outbox.push_back(PeerConnectionEvent::Ready);
    }

    // --- publication ---

    /// Run deferred channel handlers, then publish queued events in order. Reentrant: a
    /// listener publishing in turn drains the same queue.
    fn flush(&self) {
        self.run_deferred();
        let _publishing = self.publish.lock();
        loop {
            let next = self.lock_state().outbox.pop_front();
            let Some(event) = next else {
                break;
            };
            debug!(event = ?event, "manager event");
            self.events.set(event);
        }
    }

    fn publish_all(&self, events: impl IntoIterator<Item = PeerConnectionEvent>) {
        self.lock_state().outbox.extend(events);
        self.flush();
    }

    // --- channel wiring ---

    fn configure_peer_observers(self: &Arc<Self>) {
        self.browser_events.subscribe(
            PEERS_KEY,
            channel_handler(self, |inner, event: &BrowserEvent| inner.track_discovery(event)),
        );
    }

    fn configure_dispatch(self: &Arc<Self>) {
        self.browser_events.subscribe(
            DISPATCH_KEY,
            channel_handler(self, |inner, event: &BrowserEvent| inner.dispatch_browser(event)),
        );
        self.advertiser_events.subscribe(
            DISPATCH_KEY,
            channel_handler(self, |inner, event: &AdvertiserEvent| {
                inner.dispatch_advertiser(event)
            }),
        );
        self.session_events.subscribe(
            DISPATCH_KEY,
            channel_handler(self, |inner, envelope: &SessionEnvelope| {
                inner.session_event(envelope)
            }),
        );
        self.assistant_events
            .subscribe(DISPATCH_KEY, |event: &AssistantEvent| {
                trace!(?event, "assistant event");
            });
    }

    fn configure_connection_policy(self: &Arc<Self>) {
        if self.config.connection_type != ConnectionType::Automatic {
            return;
        }
        self.browser_events.subscribe(
            POLICY_KEY,
            channel_handler(self, |inner, event: &BrowserEvent| inner.auto_invite(event)),
        );
        self.advertiser_events.subscribe(
            POLICY_KEY,
            channel_handler(self, |inner, event: &AdvertiserEvent| inner.auto_accept(event)),
        );
    }

    fn dispatch_browser(&self, event: &BrowserEvent) {
        let public = match event {
            BrowserEvent::FoundPeer { peer, info } => PeerConnectionEvent::FoundPeer {
                peer: peer.clone(),
                info: info.clone(),
            },
            BrowserEvent::LostPeer { peer } => PeerConnectionEvent::LostPeer { peer: peer.clone() },
            BrowserEvent::DidNotStartBrowsing(e) => {
                PeerConnectionEvent::Error(PeerConnectionError::DidNotStartBrowsing(e.clone()))
            }
            BrowserEvent::None => return,
        };
        self.publish_all([public]);
    }

    fn dispatch_advertiser(self: &Arc<Self>, event: &AdvertiserEvent) {
        match event {
            AdvertiserEvent::DidReceiveInvitation {
                peer,
                context,
                handler,
            } => self.received_invitation(peer, context.clone(), handler.clone()),
            AdvertiserEvent::DidNotStartAdvertising(e) => {
                self.publish_all([PeerConnectionEvent::Error(
                    PeerConnectionError::DidNotStartAdvertising(e.clone()),
                )])
            }
            AdvertiserEvent::None => {}
        }
    }

    /// Automatic policy: invite every found peer of the same sub-service.
    fn auto_invite(&self, event: &BrowserEvent) {
        let BrowserEvent::FoundPeer { peer, info } = event else {
            return;
        };
        let sub_service = info
            .as_ref()
            .and_then(|i| i.get(SUB_SERVICE_KEY))
            .map(String::as_str)
            .unwrap_or("");
        if sub_service != self.config.sub_service {
            trace!(peer = %peer.id(), sub_service, "ignoring peer of another sub-service");
            return;
        }
        let result = {
            let mut st = self.lock_state();
            self.invite_locked(&mut st, peer, None, DEFAULT_INVITE_TIMEOUT)
        };
        self.flush();
        if let Err(e) = result {
            warn!(peer = %peer.id(), error = %e, "automatic invite failed");
        }
    }

    /// Automatic policy: accept every invitation on the local session and stop advertising.
    fn auto_accept(&self, event: &AdvertiserEvent) {
        let AdvertiserEvent::DidReceiveInvitation { peer, handler, .. } = event else {
            return;
        };
        info!(peer = %peer.id(), "accepting invitation");
        handler(true, self.session.transport());
        if let Some(advertiser) = &self.advertiser {
            advertiser.stop_advertising();
        }
    }

    // --- inbound ---

    fn track_discovery(&self, event: &BrowserEvent) {
        {
            let mut st = self.lock_state();
            match event {
                BrowserEvent::FoundPeer { peer, .. } => {
                    if !st.found_peers.contains(peer) {
                        let mut found = st.found_peers.clone();
                        found.push(peer.clone());
                        set_found_peers(&mut st, found);
                    }
                }
                BrowserEvent::LostPeer { peer } => {
                    self.update_peers_status(&mut st, peer, PeerStatus::Unavailable);
                    if st.found_peers.contains(peer) {
                        let found = st.found_peers.iter().filter(|p| *p != peer).cloned().collect();
                        set_found_peers(&mut st, found);
                        disconnect_service_sessions_for(&mut st, peer);
                    }
                }
                _ => {}
            }
        }
        self.flush();
    }

    fn received_invitation(
        self: &Arc<Self>,
        peer: &Peer,
        context: Option<Vec<u8>>,
        handler: InvitationHandler,
    ) {
        let weak = Arc::downgrade(self);
        let reply: InvitationReply = Arc::new(move |accept: bool| {
            if let Some(inner) = weak.upgrade() {
                handler(accept, inner.session.transport());
            }
        });
        {
            let mut st = self.lock_state();
            st.outbox.push_back(PeerConnectionEvent::ReceivedInvitation {
                peer: peer.clone(),
                context,
                handler: reply,
            });
            // A service peer dropped after a short disconnection is not rediscovered;
            // surface it again so the application can re-invite it.
            let unavailable = st
                .found_peers
                .iter()
                .find(|p| p.display_name() == peer.display_name())
                .filter(|p| p.status() == PeerStatus::Unavailable)
                .cloned();
            if let Some(service_peer) = unavailable {
                debug!(peer = %service_peer.id(), "re-publishing unavailable inviting peer");
                st.outbox.push_back(PeerConnectionEvent::FoundPeer {
                    info: service_peer.discovery_info().cloned(),
                    peer: service_peer,
                });
            }
        }
        self.flush();
    }

    fn session_event(&self, envelope: &SessionEnvelope) {
        let Some(id) = envelope.session else {
            return;
        };
        let mut accept_certificate = None;
        {
            let mut st = self.lock_state();
            let session = if id == self.session.id() {
                Some(self.session.clone())
            } else {
                st.services_sessions.iter().find(|s| s.id() == id).cloned()
            };
            let Some(session) = session else {
                trace!(session = %id, "dropping event from unknown session");
                return;
            };

            match &envelope.event {
                SessionEvent::DevicesChanged { peer } => {
                    self.devices_connection_change(&mut st, peer, &session);
                }
                SessionEvent::ReceivedData { peer, data } => {
                    st.outbox.push_back(PeerConnectionEvent::ReceivedData {
                        session: session.clone(),
                        peer: peer.clone(),
                        data: data.clone(),
                    });
                    if let Ok(event_info) = decode_event(data) {
                        st.outbox.push_back(PeerConnectionEvent::ReceivedEvent {
                            session,
                            peer: peer.clone(),
                            event_info,
                        });
                    }
                }
                SessionEvent::ReceivedStream { peer, name, stream } => {
                    st.outbox.push_back(PeerConnectionEvent::ReceivedStream {
                        session,
                        peer: peer.clone(),
                        name: name.clone(),
                        stream: stream.clone(),
                    });
                }
                SessionEvent::StartedReceivingResource {
                    peer,
                    name,
                    progress,
                } => {
                    st.outbox
                        .push_back(PeerConnectionEvent::StartedReceivingResource {
                            session,
                            peer: peer.clone(),
                            name: name.clone(),
                            progress: progress.clone(),
                        });
                }
                SessionEvent::FinishedReceivingResource {
                    peer,
                    name,
                    url,
                    error,
                } => {
                    st.outbox
                        .push_back(PeerConnectionEvent::FinishedReceivingResource {
                            session,
                            peer: peer.clone(),
                            name: name.clone(),
                            url: url.clone(),
                            error: error.clone(),
                        });
                }
                SessionEvent::ReceivedCertificate {
                    peer,
                    certificate,
                    handler,
                } => {
                    st.outbox.push_back(PeerConnectionEvent::ReceivedCertificate {
                        session,
                        peer: peer.clone(),
                        certificate: certificate.clone(),
                        handler: handler.clone(),
                    });
                    if self.config.auto_accept_certificates {
                        accept_certificate = Some(handler.clone());
                    }
                }
                SessionEvent::None => {}
            }
        }
        self.flush();
        if let Some(handler) = accept_certificate {
            handler(true);
        }
    }

    /// Reconcile one connection-state report for `peer` on `session`.
    fn devices_connection_change(&self, st: &mut ManagerState, peer: &Peer, session: &PeerSession) {
        self.update_peers_status(st, peer, peer.status());
        let distant = session.is_distant_service_session();

        match peer.status() {
            PeerStatus::Connecting if distant => {
                self.update_invitation(st, peer, PeerStatus::Connecting);
            }
            PeerStatus::NotConnected if *session != self.session && distant => {
                if st.found_peers.contains(peer)
                    && self.update_invitation(st, peer, PeerStatus::NotConnected)
                {
                    // Transient drop inside a retry cycle, not a disconnect.
                    debug!(peer = %peer.id(), session = %session.id(), "reconnecting, change not published");
                    return;
                }
                disconnect_service_session(st, session);
                self.update_peers_status(st, peer, PeerStatus::Unavailable);
                self.update_invitation(st, peer, PeerStatus::Unavailable);
            }
            _ => {
                self.update_invitation(st, peer, PeerStatus::Connected);
            }
        }

        if distant && peer != session.service_peer() {
            trace!(peer = %peer.id(), session = %session.id(), "third-party change on service session");
            return;
        }
        st.outbox.push_back(PeerConnectionEvent::DevicesChanged {
            session: session.clone(),
            peer: peer.clone(),
            connected_peers: self.session.connected_peers(),
        });
    }

    // --- bookkeeping ---

    /// Project `status` onto every record of `peer`, keeping identity and metadata.
    fn update_peers_status(&self, st: &mut ManagerState, peer: &Peer, status: PeerStatus) {
        let found = st
            .found_peers
            .iter()
            .map(|p| if p == peer { p.with_status(status) } else { p.clone() })
            .collect();
        set_found_peers(st, found);

        for session in st.services_sessions.iter_mut() {
            if session.peer() != peer && session.service_peer() != peer {
                continue;
            }
            let local = if session.peer() == peer {
                session.peer().with_status(status)
            } else {
                session.peer().clone()
            };
            let service = if session.service_peer() == peer {
                session.service_peer().with_status(status)
            } else {
                session.service_peer().clone()
            };
            *session = session.with_peers(local, service);
        }
    }

    fn update_invitation(&self, st: &mut ManagerState, peer: &Peer, status: PeerStatus) -> bool {
        let node = self.config.manager_mode == ManagerMode::Node;
        let ManagerState {
            browser,
            services_sessions,
            ..
        } = st;
        let Some(browser) = browser.as_mut() else {
            return false;
        };
        let mut factory = ServiceSessionFactory {
            inner: self,
            sessions: services_sessions,
        };
        let factory: Option<&mut dyn SessionFactory> = if node { Some(&mut factory) } else { None };
        browser.update_invitation(peer, status, factory)
    }

    fn invite_locked(
        &self,
        st: &mut ManagerState,
        peer: &Peer,
        context: Option<Vec<u8>>,
        timeout: std::time::Duration,
    ) -> Result<(), ManagerError> {
        peer_service_available(st, peer)?;
        let target = st
            .found_peers
            .iter()
            .find(|p| *p == peer)
            .cloned()
            .unwrap_or_else(|| peer.clone());

        let node = self.config.manager_mode == ManagerMode::Node;
        let ManagerState {
            browser,
            services_sessions,
            ..
        } = st;
        let browser = browser.as_mut().ok_or(ManagerError::UnsupportedModeUsage)?;
        let mut factory = ServiceSessionFactory {
            inner: self,
            sessions: services_sessions,
        };
        let factory: Option<&mut dyn SessionFactory> = if node { Some(&mut factory) } else { None };
        browser.invite_peer(&target, None, context, timeout, factory)
    }

    fn all_sessions(&self, st: &ManagerState) -> Vec<PeerSession> {
        let mut sessions = Vec::with_capacity(1 + st.services_sessions.len());
        sessions.push(self.session.clone());
        sessions.extend(st.services_sessions.iter().cloned());
        sessions
    }

    fn all_available_peers(&self, st: &ManagerState) -> Vec<Peer> {
        let mut peers = self.session.connected_peers();
        for session in &st.services_sessions {
            merge_unique(&mut peers, [session.service_peer().clone()]);
            merge_unique(&mut peers, session.connected_peers());
        }
        peers
    }
}

/// Subscriber running `handle` for each channel event. An event the transport raised on
/// the thread inside a critical section is handled once that section's `flush` runs.
fn channel_handler<E>(
    inner: &Arc<ManagerInner>,
    handle: fn(&Arc<ManagerInner>, &E),
) -> impl Fn(&E) + Send + Sync + 'static
where
    E: Clone + Send + 'static,
{
    let weak = Arc::downgrade(inner);
    move |event: &E| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.locked_by_current_thread() {
            handle(&inner, event);
            return;
        }
        trace!("channel event raised under the state lock, deferred");
        let weak = weak.clone();
        let event = event.clone();
        inner.deferred.lock().push_back(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                handle(&inner, &event);
            }
        }));
    }
}

fn connected_service_peers(st: &ManagerState) -> Vec<Peer> {
    let mut peers = Vec::new();
    merge_unique(
        &mut peers,
        st.services_sessions.iter().map(|s| s.service_peer().clone()),
    );
    peers
}

fn peer_service_available(st: &ManagerState, peer: &Peer) -> Result<(), ManagerError> {
    if !st.found_peers.contains(peer) {
        warn!(peer = %peer.id(), "invitation canceled, peer unavailable");
        return Err(ManagerError::PeerUnavailable);
    }
    let already = connected_service_peers(st).iter().any(|p| {
        (p == peer || p.display_name() == peer.display_name()) && p.status() == PeerStatus::Connected
    });
    if already {
        warn!(peer = %peer.id(), "invitation canceled, service already connected");
        return Err(ManagerError::ServiceAlreadyConnected);
    }
    Ok(())
}

/// Replace the found set; publishes `NearbyPeersChanged` when membership or a status changed.
fn set_found_peers(st: &mut ManagerState, peers: Vec<Peer>) {
    let unchanged = st.found_peers.len() == peers.len()
        && st
            .found_peers
            .iter()
            .zip(&peers)
            .all(|(a, b)| a == b && a.status() == b.status());
    if unchanged {
        return;
    }
    st.found_peers = peers;
    st.outbox.push_back(PeerConnectionEvent::NearbyPeersChanged {
        found_peers: st.found_peers.clone(),
    });
}

fn disconnect_service_session(st: &mut ManagerState, session: &PeerSession) {
    for lost in st.services_sessions.iter().filter(|s| *s == session) {
        lost.stop();
    }
    st.services_sessions.retain(|s| s != session);
}

/// Tear down the service sessions dedicated to a lost peer, keeping any it is still
/// connected on.
fn disconnect_service_sessions_for(st: &mut ManagerState, peer: &Peer) {
    let lost = |s: &PeerSession| s.service_peer() == peer && !s.contains(peer.id());
    for session in st.services_sessions.iter().filter(|s| lost(s)) {
        debug!(peer = %peer.id(), session = %session.id(), "closing service session of lost peer");
        session.stop();
    }
    st.services_sessions.retain(|s| !lost(s));
}
