//! Peer value: identity plus a point-in-time status projection.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::identity::{IdentityError, PeerId};
use crate::transport::SessionState;

/// Discovery metadata advertised alongside a peer.
pub type DiscoveryInfo = BTreeMap<String, String>;

/// Key under which the sub-service discriminator is advertised.
pub const SUB_SERVICE_KEY: &str = "subService";

/// Connection status of a peer as last reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// The local participant. Assigned once at construction.
    CurrentUser,
    /// Discovered through browsing.
    Available,
    /// Lost by the browser or dropped after a failed connection.
    Unavailable,
    Connecting,
    Connected,
    NotConnected,
}

impl From<SessionState> for PeerStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::NotConnected => PeerStatus::NotConnected,
            SessionState::Connecting => PeerStatus::Connecting,
            SessionState::Connected => PeerStatus::Connected,
        }
    }
}

/// A participant. Two peers are equal iff their identities are equal, whatever their status.
#[derive(Clone)]
pub struct Peer {
    id: PeerId,
    status: PeerStatus,
    discovery_info: Option<DiscoveryInfo>,
}

impl Peer {
    pub fn new(id: PeerId, status: PeerStatus) -> Self {
        Self {
            id,
            status,
            discovery_info: None,
        }
    }

    /// The local participant.
    pub fn current_user(
        display_name: &str,
        discovery_info: Option<DiscoveryInfo>,
    ) -> Result<Self, IdentityError> {
        Ok(Self {
            id: PeerId::new(display_name)?,
            status: PeerStatus::CurrentUser,
            discovery_info,
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        self.id.display_name()
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn discovery_info(&self) -> Option<&DiscoveryInfo> {
        self.discovery_info.as_ref()
    }

    /// Same identity and metadata, new status. The local participant keeps CurrentUser.
    pub fn with_status(&self, status: PeerStatus) -> Self {
        let status = if self.status == PeerStatus::CurrentUser {
            PeerStatus::CurrentUser
        } else {
            status
        };
        Self {
            id: self.id.clone(),
            status,
            discovery_info: self.discovery_info.clone(),
        }
    }

    pub fn with_discovery_info(mut self, info: Option<DiscoveryInfo>) -> Self {
        self.discovery_info = info;
        self
    }

    /// Sub-service advertised by this peer, empty when absent.
    pub fn sub_service(&self) -> &str {
        self.discovery_info
            .as_ref()
            .and_then(|info| info.get(SUB_SERVICE_KEY))
            .map(String::as_str)
            .unwrap_or("")
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("status", &self.status)
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.id, self.status)
    }
}

/// Append peers not already present, keeping first-seen order.
pub(crate) fn merge_unique(into: &mut Vec<Peer>, peers: impl IntoIterator<Item = Peer>) {
    for peer in peers {
        if !into.contains(&peer) {
            into.push(peer);
        }
    }
}
