//! Boundary with the radio-level transport: discovery, advertisement, sessions and transfers.
//! The core never performs I/O itself; a transport implements these traits and reports
//! back through the producers it is handed.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::identity::{PeerId, SessionId};
use crate::peer::DiscoveryInfo;
use crate::producer::{
    AdvertiserEventProducer, AssistantEventProducer, BrowserEventProducer, SessionEventProducer,
};

/// Per-peer connection state reported by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    NotConnected,
    Connecting,
    Connected,
}

/// Session encryption preference, passed through to the transport untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPreference {
    #[default]
    Optional,
    Required,
    None,
}

/// Opaque security material for a session.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    /// DER blobs: identity first, then zero or more chain certificates.
    pub identity: Vec<Vec<u8>>,
    pub encryption: EncryptionPreference,
}

/// Transfer progress shared between the transport and observers.
#[derive(Clone, Default)]
pub struct Progress {
    completed: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        let p = Self::default();
        p.total.store(total, Ordering::Relaxed);
        p
    }

    pub fn advance(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_completed(&self, n: u64) {
        self.completed.store(n, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.completed() >= self.total()
    }

    /// Completed fraction in [0, 1]. An empty transfer counts as done.
    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        (self.completed().min(total) as f64) / (total as f64)
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Progress({}/{})", self.completed(), self.total())
    }
}

/// Readable end of a stream opened by a remote peer.
pub type IncomingStream = Arc<parking_lot::Mutex<Box<dyn io::Read + Send>>>;
/// Writable end of a stream opened towards a remote peer.
pub type OutgoingStream = Box<dyn io::Write + Send>;

/// Answer to an incoming invitation: accept flag and the session to join on accept.
pub type InvitationHandler = Arc<dyn Fn(bool, &Arc<dyn TransportSession>) + Send + Sync>;
/// Answer to a certificate check.
pub type CertificateHandler = Arc<dyn Fn(bool) + Send + Sync>;
/// Called once when a resource transfer ends.
pub type ResourceCompletion = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Opaque transport failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("io: {0}")]
    Io(Arc<io::Error>),
    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

/// Factory for the transport primitives one manager uses.
pub trait Transport: Send + Sync {
    fn create_session(
        &self,
        local: &PeerId,
        security: &SecurityConfig,
        events: SessionEventProducer,
    ) -> Arc<dyn TransportSession>;

    fn create_browser(
        &self,
        local: &PeerId,
        service_type: &str,
        events: BrowserEventProducer,
    ) -> Arc<dyn TransportBrowser>;

    fn create_advertiser(
        &self,
        local: &PeerId,
        service_type: &str,
        discovery_info: &DiscoveryInfo,
        events: AdvertiserEventProducer,
    ) -> Arc<dyn TransportAdvertiser>;

    /// Assisted advertiser that presents invitations to the user itself. Transports
    /// without such a flow return `None`.
    fn create_advertiser_assistant(
        &self,
        _local: &PeerId,
        _service_type: &str,
        _session: &Arc<dyn TransportSession>,
        _events: AssistantEventProducer,
    ) -> Option<Arc<dyn TransportAdvertiser>> {
        None
    }
}

/// One transport session. Callbacks may be delivered synchronously from inside these
/// methods; the manager defers them until it leaves its critical section.
pub trait TransportSession: Send + Sync {
    fn id(&self) -> SessionId;
    fn connected_peers(&self) -> Vec<PeerId>;
    /// Resume delivering callbacks.
    fn start(&self);
    /// Leave the session and stop delivering callbacks.
    fn disconnect(&self);
    /// Reliable send to the listed connected peers.
    fn send(&self, data: &[u8], peers: &[PeerId]) -> Result<(), TransportError>;
    fn start_stream(&self, name: &str, peer: &PeerId) -> Result<OutgoingStream, TransportError>;
    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerId,
        completion: Option<ResourceCompletion>,
    ) -> Option<Progress>;
}

/// Discovery and invites. Same callback rule as [`TransportSession`].
pub trait TransportBrowser: Send + Sync {
    fn start_browsing(&self);
    fn stop_browsing(&self);
    fn invite(
        &self,
        peer: &PeerId,
        session: &Arc<dyn TransportSession>,
        context: Option<&[u8]>,
        timeout: Duration,
    );
}

/// Same callback rule as [`TransportSession`].
pub trait TransportAdvertiser: Send + Sync {
    fn start_advertising(&self);
    fn stop_advertising(&self);
}
