//! One invitation attempt from the local peer to a remote peer, as an immutable snapshot.
//! "Mutating" an invitation means replacing it with the result of [`Invitation::transition`].

use std::fmt;

use crate::peer::Peer;
use crate::session::PeerSession;

/// Ordinary failure budget (connecting, then dropped).
pub const MAX_CONNECTION_RETRIES: u32 = 3;
/// Budget for failures that never passed through `Pending`.
pub const MAX_INCONSISTENT_CONNECTION_RETRIES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationStatus {
    /// Created; an invite may have been sent.
    Unknown,
    /// The transport reported the peer as connecting.
    Pending,
    /// Dropped after `Pending`; retry count incremented.
    Failed,
    /// Dropped without ever becoming `Pending`.
    Inconsistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvitationError {
    #[error("invitation pending")]
    InvitationPending,
    #[error("connection inconsistency")]
    ConnectionInconsistency,
    #[error("max connection retries exceeded")]
    MaxConnectionRetriesExceeded,
}

/// Equality is by target peer: one invitation per peer at a time.
#[derive(Clone)]
pub struct Invitation {
    peer: Peer,
    session: PeerSession,
    context: Option<Vec<u8>>,
    retry_count: u32,
    inconsistent_count: u32,
    status: InvitationStatus,
}

impl Invitation {
    pub fn new(
        peer: Peer,
        session: PeerSession,
        context: Option<Vec<u8>>,
        retry_count: u32,
    ) -> Self {
        Self {
            peer,
            session,
            context,
            retry_count,
            inconsistent_count: 0,
            status: InvitationStatus::Unknown,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn context(&self) -> Option<&[u8]> {
        self.context.as_deref()
    }

    /// Ordinary failures so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Consecutive inconsistent failures.
    pub fn inconsistent_count(&self) -> u32 {
        self.inconsistent_count
    }

    pub fn status(&self) -> InvitationStatus {
        self.status
    }

    /// Next snapshot with `status`. `session` and `context` replace the current ones when given.
    ///
    /// The two budgets are counted apart and neither transition resets the other.
    /// - `Inconsistent`: the inconsistent count continues across consecutive inconsistent
    ///   transitions and restarts at 0 otherwise; reaching its budget fails.
    /// - `Failed`: only valid from `Pending`; fails once the ordinary budget is spent,
    ///   otherwise increments the ordinary count.
    /// - anything else keeps both counts.
    pub fn transition(
        &self,
        status: InvitationStatus,
        session: Option<PeerSession>,
        context: Option<Vec<u8>>,
    ) -> Result<Invitation, InvitationError> {
        let mut retry_count = self.retry_count;
        let mut inconsistent_count = self.inconsistent_count;
        match status {
            InvitationStatus::Inconsistent => {
                let attempts = if self.status == InvitationStatus::Inconsistent {
                    self.inconsistent_count + 1
                } else {
                    0
                };
                if attempts >= MAX_INCONSISTENT_CONNECTION_RETRIES {
                    return Err(InvitationError::MaxConnectionRetriesExceeded);
                }
                inconsistent_count = attempts;
            }
            InvitationStatus::Failed => {
                if self.status != InvitationStatus::Pending {
                    return Err(InvitationError::ConnectionInconsistency);
                }
                if self.retry_count >= MAX_CONNECTION_RETRIES {
                    return Err(InvitationError::MaxConnectionRetriesExceeded);
                }
                retry_count += 1;
            }
            InvitationStatus::Unknown | InvitationStatus::Pending => {}
        }
        Ok(Invitation {
            peer: self.peer.clone(),
            session: session.unwrap_or_else(|| self.session.clone()),
            context: context.or_else(|| self.context.clone()),
            retry_count,
            inconsistent_count,
            status,
        })
    }
}

impl PartialEq for Invitation {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer
    }
}

impl PartialEq<Peer> for Invitation {
    fn eq(&self, other: &Peer) -> bool {
        self.peer == *other
    }
}

impl fmt::Debug for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invitation(peer: {}, status: {:?}, retries: {}/{}, session: {})",
            self.peer.id(),
            self.status,
            self.retry_count,
            self.inconsistent_count,
            self.session.id()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::peer::PeerStatus;
    use crate::testing::RecordingTransport;

    fn setup() -> (std::sync::Arc<RecordingTransport>, Peer, PeerSession) {
        let transport = RecordingTransport::new();
        let me = Peer::current_user("me", None).unwrap();
        let session = transport.session_for(&me, &me);
        let x = Peer::new(PeerId::new("x").unwrap(), PeerStatus::Available);
        (transport, x, session)
    }

    #[test]
    fn failed_retries_are_bounded() {
        let (_t, x, s) = setup();
        let inv = Invitation::new(x, s, None, 0);
        assert_eq!(inv.status(), InvitationStatus::Unknown);

        let mut inv = inv.transition(InvitationStatus::Pending, None, None).unwrap();
        for expected in 1..=MAX_CONNECTION_RETRIES {
            inv = inv.transition(InvitationStatus::Failed, None, None).unwrap();
            assert_eq!(inv.status(), InvitationStatus::Failed);
            assert_eq!(inv.retry_count(), expected);
            inv = inv.transition(InvitationStatus::Pending, None, None).unwrap();
            assert_eq!(inv.retry_count(), expected);
        }
        assert_eq!(
            inv.transition(InvitationStatus::Failed, None, None).unwrap_err(),
            InvitationError::MaxConnectionRetriesExceeded
        );
    }

    #[test]
    fn failed_requires_pending() {
        let (_t, x, s) = setup();
        let unknown = Invitation::new(x, s, None, 0);
        assert_eq!(
            unknown.transition(InvitationStatus::Failed, None, None).unwrap_err(),
            InvitationError::ConnectionInconsistency
        );

        let pending = unknown.transition(InvitationStatus::Pending, None, None).unwrap();
        let failed = pending.transition(InvitationStatus::Failed, None, None).unwrap();
        assert_eq!(
            failed.transition(InvitationStatus::Failed, None, None).unwrap_err(),
            InvitationError::ConnectionInconsistency
        );

        let inconsistent = unknown
            .transition(InvitationStatus::Inconsistent, None, None)
            .unwrap();
        assert_eq!(
            inconsistent
                .transition(InvitationStatus::Failed, None, None)
                .unwrap_err(),
            InvitationError::ConnectionInconsistency
        );
    }

    #[test]
    fn second_consecutive_inconsistent_fails() {
        let (_t, x, s) = setup();
        let inv = Invitation::new(x, s, None, 0);
        let first = inv.transition(InvitationStatus::Inconsistent, None, None).unwrap();
        assert_eq!(first.inconsistent_count(), 0);
        assert_eq!(
            first
                .transition(InvitationStatus::Inconsistent, None, None)
                .unwrap_err(),
            InvitationError::MaxConnectionRetriesExceeded
        );
    }

    #[test]
    fn inconsistent_budget_is_separate() {
        let (_t, x, s) = setup();
        let inv = Invitation::new(x, s, None, 0)
            .transition(InvitationStatus::Pending, None, None)
            .unwrap()
            .transition(InvitationStatus::Failed, None, None)
            .unwrap();
        assert_eq!(inv.retry_count(), 1);
        let inc = inv.transition(InvitationStatus::Inconsistent, None, None).unwrap();
        assert_eq!(inc.retry_count(), 1);
        assert_eq!(inc.inconsistent_count(), 0);
        let back = inc.transition(InvitationStatus::Pending, None, None).unwrap();
        assert_eq!(back.retry_count(), 1);
        assert!(back.transition(InvitationStatus::Inconsistent, None, None).is_ok());
    }

    #[test]
    fn alternating_failures_spend_the_ordinary_budget() {
        let (_t, x, s) = setup();
        let mut inv = Invitation::new(x, s, None, 0);
        for expected in 1..=MAX_CONNECTION_RETRIES {
            inv = inv
                .transition(InvitationStatus::Pending, None, None)
                .unwrap()
                .transition(InvitationStatus::Failed, None, None)
                .unwrap()
                .transition(InvitationStatus::Inconsistent, None, None)
                .unwrap();
            assert_eq!(inv.retry_count(), expected);
        }
        let pending = inv.transition(InvitationStatus::Pending, None, None).unwrap();
        assert_eq!(
            pending.transition(InvitationStatus::Failed, None, None).unwrap_err(),
            InvitationError::MaxConnectionRetriesExceeded
        );
    }

    #[test]
    fn transition_replaces_session_and_context() {
        let (t, x, s) = setup();
        let me = s.peer().clone();
        let other = t.session_for(&me, &x);
        let inv = Invitation::new(x.clone(), s.clone(), Some(vec![1]), 0);
        let kept = inv.transition(InvitationStatus::Pending, None, None).unwrap();
        assert_eq!(kept.session(), &s);
        assert_eq!(kept.context(), Some(&[1u8][..]));

        let moved = inv
            .transition(InvitationStatus::Inconsistent, Some(other.clone()), Some(vec![2]))
            .unwrap();
        assert_eq!(moved.session(), &other);
        assert_eq!(moved.context(), Some(&[2u8][..]));
        assert_eq!(moved, inv);
        assert!(moved == x);
    }
}
