//! Invitation bookkeeping on top of a transport browser: issues invites, follows their
//! progress and decides between retrying and abandoning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::ManagerError;
use crate::identity::PeerId;
use crate::invitation::{Invitation, InvitationError, InvitationStatus};
use crate::peer::{Peer, PeerStatus};
use crate::session::PeerSession;
use crate::transport::TransportBrowser;

pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Supplies a session to reach `peer` when the browser has no fixed session (node mode).
pub trait SessionFactory {
    fn session_for(&mut self, peer: &Peer) -> Option<PeerSession>;
}

pub struct PeerBrowser {
    browser: Arc<dyn TransportBrowser>,
    /// Fixed session used for every invite (slave mode).
    session: Option<PeerSession>,
    invitations: HashMap<PeerId, Invitation>,
}

impl PeerBrowser {
    pub fn new(browser: Arc<dyn TransportBrowser>, session: Option<PeerSession>) -> Self {
        Self {
            browser,
            session,
            invitations: HashMap::new(),
        }
    }

    pub fn start_browsing(&self) {
        self.browser.start_browsing();
    }

    pub fn stop_browsing(&self) {
        self.browser.stop_browsing();
    }

    pub fn invitation(&self, peer: &PeerId) -> Option<&Invitation> {
        self.invitations.get(peer)
    }

    pub fn invitations(&self) -> impl Iterator<Item = &Invitation> {
        self.invitations.values()
    }

    pub fn clear_invitations(&mut self) {
        self.invitations.clear();
    }

    /// Invite `peer`. A first invite needs a session: `session`, else the fixed session,
    /// else one from `factory`. A peer with an invitation in flight is re-invited through
    /// [`retry_invitation`](Self::retry_invitation) unless that invitation is pending.
    pub fn invite_peer(
        &mut self,
        peer: &Peer,
        session: Option<PeerSession>,
        context: Option<Vec<u8>>,
        timeout: Duration,
        factory: Option<&mut dyn SessionFactory>,
    ) -> Result<(), ManagerError> {
        match self.invitations.get(peer.id()).map(Invitation::status) {
            Some(InvitationStatus::Pending) => return Err(ManagerError::InvitationPending),
            Some(_) => return self.retry_invitation(peer, context, timeout, factory),
            None => {}
        }

        let session = match session.or_else(|| self.session.clone()) {
            Some(s) => s,
            None => factory
                .and_then(|f| f.session_for(peer))
                .ok_or(ManagerError::UnsupportedModeUsage)?,
        };

        info!(peer = %peer.id(), session = %session.id(), "inviting peer");
        self.invitations.insert(
            peer.id().clone(),
            Invitation::new(peer.clone(), session.clone(), context.clone(), 0),
        );
        self.send_invite(peer, &session, context.as_deref(), timeout);
        Ok(())
    }

    /// Re-invite a peer whose invitation failed. A failure that never went through
    /// `Pending` switches to a fresh session. Exhausted invitations are dropped.
    pub fn retry_invitation(
        &mut self,
        peer: &Peer,
        context: Option<Vec<u8>>,
        timeout: Duration,
        factory: Option<&mut dyn SessionFactory>,
    ) -> Result<(), ManagerError> {
        let existing = self
            .invitations
            .get(peer.id())
            .cloned()
            .ok_or(ManagerError::UnknownInvitation)?;

        match existing.transition(InvitationStatus::Failed, None, context.clone()) {
            Ok(next) => {
                info!(
                    peer = %peer.id(),
                    retry = next.retry_count(),
                    session = %next.session().id(),
                    "retrying invitation"
                );
                self.replace_and_send(next, timeout);
                Ok(())
            }
            Err(InvitationError::ConnectionInconsistency) => {
                if let Err(e) = existing.transition(InvitationStatus::Inconsistent, None, None) {
                    return Err(self.abandon(peer, e));
                }
                let session = match self.session.clone() {
                    Some(s) => Some(s),
                    None => factory.and_then(|f| f.session_for(peer)),
                };
                let Some(session) = session else {
                    self.invitations.remove(peer.id());
                    return Err(ManagerError::UnsupportedModeUsage);
                };
                let next = existing.transition(InvitationStatus::Inconsistent, Some(session), context)?;
                info!(
                    peer = %peer.id(),
                    session = %next.session().id(),
                    "inconsistent invitation, retrying on new session"
                );
                self.replace_and_send(next, timeout);
                Ok(())
            }
            Err(e) => Err(self.abandon(peer, e)),
        }
    }

    /// Follow a status change reported for `peer`. Returns whether a matching invitation
    /// existed and was acted upon; for `NotConnected` that means a retry was issued.
    pub fn update_invitation(
        &mut self,
        peer: &Peer,
        status: PeerStatus,
        factory: Option<&mut dyn SessionFactory>,
    ) -> bool {
        match status {
            PeerStatus::Connecting => {
                let Some(existing) = self.invitations.get(peer.id()) else {
                    return false;
                };
                match existing.transition(InvitationStatus::Pending, None, None) {
                    Ok(next) => {
                        debug!(peer = %peer.id(), "invitation pending");
                        self.invitations.insert(peer.id().clone(), next);
                        true
                    }
                    Err(_) => false,
                }
            }
            PeerStatus::NotConnected => {
                match self.retry_invitation(peer, None, DEFAULT_INVITE_TIMEOUT, factory) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(peer = %peer.id(), error = %e, "invitation not retried");
                        false
                    }
                }
            }
            _ => {
                let resolved = self.invitations.remove(peer.id()).is_some();
                if resolved {
                    debug!(peer = %peer.id(), ?status, "invitation resolved");
                }
                resolved
            }
        }
    }

    fn replace_and_send(&mut self, next: Invitation, timeout: Duration) {
        let peer = next.peer().clone();
        let session = next.session().clone();
        let context = next.context().map(<[u8]>::to_vec);
        self.invitations.insert(peer.id().clone(), next);
        self.send_invite(&peer, &session, context.as_deref(), timeout);
    }

    fn abandon(&mut self, peer: &Peer, e: InvitationError) -> ManagerError {
        warn!(peer = %peer.id(), error = %e, "abandoning invitation");
        self.invitations.remove(peer.id());
        e.into()
    }

    fn send_invite(
        &self,
        peer: &Peer,
        session: &PeerSession,
        context: Option<&[u8]>,
        timeout: Duration,
    ) {
        self.browser
            .invite(peer.id(), session.transport(), context, timeout);
    }
}
