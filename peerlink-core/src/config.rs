//! Manager configuration. Every field has a default so partial TOML/JSON works.

use serde::Deserialize;

use crate::identity::{validate_display_name, IdentityError};
use crate::peer::{DiscoveryInfo, SUB_SERVICE_KEY};
use crate::transport::{EncryptionPreference, SecurityConfig};

/// Default behavior on discovery and on incoming invitations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Invite every discovered peer with a matching sub-service; accept every invitation.
    #[default]
    Automatic,
    /// Hand invitations to the transport's assisted flow.
    InviteOnly,
    /// No default behavior; the application drives invites.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerMode {
    /// Advertise and wait for invitations.
    #[default]
    Master,
    /// Browse and invite through the primary session.
    Slave,
    /// Advertise and browse; each invited peer gets its own service session.
    Node,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Channel on which peers find each other (default "peerlink").
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Discriminator advertised under `subService`.
    #[serde(default)]
    pub sub_service: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default)]
    pub discovery_info: DiscoveryInfo,
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub manager_mode: ManagerMode,
    #[serde(default)]
    pub encryption: EncryptionPreference,
    /// DER blobs: identity first, then chain certificates.
    #[serde(default)]
    pub security_identity: Vec<Vec<u8>>,
    #[serde(default = "default_true")]
    pub auto_accept_certificates: bool,
}

fn default_service_type() -> String {
    "peerlink".to_string()
}
fn default_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| validate_display_name(h).is_ok())
        .unwrap_or_else(|| "peerlink".to_string())
}
fn default_true() -> bool {
    true
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            sub_service: String::new(),
            display_name: default_display_name(),
            discovery_info: DiscoveryInfo::new(),
            connection_type: ConnectionType::default(),
            manager_mode: ManagerMode::default(),
            encryption: EncryptionPreference::default(),
            security_identity: Vec::new(),
            auto_accept_certificates: true,
        }
    }
}

impl ManagerConfig {
    pub fn new(service_type: &str, display_name: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            display_name: display_name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_sub_service(mut self, sub_service: &str) -> Self {
        self.sub_service = sub_service.to_string();
        self
    }

    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    pub fn with_manager_mode(mut self, mode: ManagerMode) -> Self {
        self.manager_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<(), IdentityError> {
        validate_display_name(&self.display_name)
    }

    /// Discovery info with the sub-service merged in. Explicit entries win.
    pub fn merged_discovery_info(&self) -> DiscoveryInfo {
        let mut info = DiscoveryInfo::new();
        info.insert(SUB_SERVICE_KEY.to_string(), self.sub_service.clone());
        info.extend(self.discovery_info.clone());
        info
    }

    pub fn security(&self) -> SecurityConfig {
        SecurityConfig {
            identity: self.security_identity.clone(),
            encryption: self.encryption,
        }
    }
}
