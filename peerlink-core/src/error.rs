//! Errors returned by the browser and the connection manager.

use crate::identity::IdentityError;
use crate::invitation::InvitationError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The operation needs a session or role the current manager mode does not have.
    #[error("operation not supported in the current manager mode")]
    UnsupportedModeUsage,
    #[error("peer is not among the discovered peers")]
    PeerUnavailable,
    #[error("peer is already connected through a service session")]
    ServiceAlreadyConnected,
    #[error("no invitation recorded for peer")]
    UnknownInvitation,
    #[error("maximum connection retries exceeded")]
    MaxConnectionRetriesExceeded,
    #[error("an invitation to this peer is already pending")]
    InvitationPending,
    #[error("connection state inconsistent with invitation")]
    ConnectionInconsistency,
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl From<InvitationError> for ManagerError {
    fn from(e: InvitationError) -> Self {
        match e {
            InvitationError::InvitationPending => ManagerError::InvitationPending,
            InvitationError::ConnectionInconsistency => ManagerError::ConnectionInconsistency,
            InvitationError::MaxConnectionRetriesExceeded => {
                ManagerError::MaxConnectionRetriesExceeded
            }
        }
    }
}
