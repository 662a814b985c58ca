//! Outbound operations: invites, delayed reconnects and payload fan-out.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::PeerConnectionManager;
use crate::error::ManagerError;
use crate::peer::Peer;
use crate::protocol::EventInfo;
use crate::retry::ReconnectToken;
use crate::session::PeerSession;
use crate::transport::{OutgoingStream, Progress, ResourceCompletion, TransportError};
use crate::wire::{encode_event, FrameEncodeError};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Completion shared by every per-peer transfer of one `send_resource` call.
pub type SharedResourceCompletion = Arc<dyn Fn(Result<(), TransportError>) + Send + Sync>;

impl PeerConnectionManager {
    /// Invite a discovered peer. In node mode the invite goes through a fresh service
    /// session dedicated to `peer`.
    pub fn invite_peer(
        &self,
        peer: &Peer,
        context: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let result = {
            let mut st = inner.lock_state();
            inner.invite_locked(&mut st, peer, context, timeout)
        };
        inner.flush();
        result
    }

    /// Invite `peer` again after `delay`. `peer` must be discovered now; the job is
    /// dropped if its token is cancelled, or the manager stopped, before it fires.
    pub fn attempt_reconnect(
        &self,
        peer: &Peer,
        context: Option<Vec<u8>>,
        timeout: Duration,
        delay: Duration,
    ) -> Result<ReconnectToken, ManagerError> {
        let st = self.inner.lock_state();
        if !st.found_peers.contains(peer) {
            warn!(peer = %peer.id(), "reconnect canceled, peer unavailable");
            return Err(ManagerError::PeerUnavailable);
        }
        let Some(queue) = st.retry_queue.as_ref() else {
            debug!(peer = %peer.id(), "manager not running, reconnect not scheduled");
            let token = ReconnectToken::default();
            token.cancel();
            return Ok(token);
        };

        debug!(peer = %peer.id(), ?delay, "scheduling reconnect");
        let weak = Arc::downgrade(&self.inner);
        let peer = peer.clone();
        Ok(queue.schedule(delay, move |token| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let result = {
                let mut st = inner.lock_state();
                if token.is_cancelled() || !st.running {
                    trace!(peer = %peer.id(), "reconnect dropped");
                    return;
                }
                inner.invite_locked(&mut st, &peer, context, timeout)
            };
            inner.flush();
            if let Err(e) = result {
                warn!(peer = %peer.id(), error = %e, "reconnect failed");
            }
        }))
    }

    /// Send `data` to `peers`, or to every available peer when empty. Each peer gets at
    /// most one copy even when several sessions reach it; unreachable peers are skipped.
    pub fn send_data(&self, data: &[u8], peers: &[Peer]) {
        let (sessions, mut remaining) = {
            let st = self.inner.lock_state();
            let requested = if peers.is_empty() {
                self.inner.all_available_peers(&st)
            } else {
                peers.to_vec()
            };
            (self.inner.all_sessions(&st), requested)
        };

        for session in sessions {
            if remaining.is_empty() {
                break;
            }
            let targets: Vec<Peer> = session
                .connected_peers()
                .into_iter()
                .filter(|p| remaining.contains(p))
                .collect();
            if targets.is_empty() {
                continue;
            }
            remaining.retain(|p| !targets.contains(p));
            trace!(session = %session.id(), peers = targets.len(), bytes = data.len(), "sending data");
            session.send_data(data, &targets);
        }

        if !remaining.is_empty() {
            debug!(unreachable = remaining.len(), "some peers not reachable, not sent");
        }
    }

    /// Frame `event` and send it like [`send_data`](Self::send_data).
    pub fn send_event(&self, event: &EventInfo, peers: &[Peer]) -> Result<(), FrameEncodeError> {
        let frame = encode_event(event)?;
        self.send_data(&frame, peers);
        Ok(())
    }

    /// Open a named stream to `peer` on the first session it is connected on.
    pub fn send_data_stream(
        &self,
        name: &str,
        peer: &Peer,
    ) -> Result<OutgoingStream, TransportError> {
        self.session_reaching(peer).send_data_stream(name, peer)
    }

    /// Send the file at `path` to each of `peers`, or to every peer connected on the
    /// primary session when empty. Returns the progress handle of each started transfer.
    pub fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peers: &[Peer],
        completion: Option<SharedResourceCompletion>,
    ) -> HashMap<Peer, Option<Progress>> {
        let targets = if peers.is_empty() {
            self.inner.session.connected_peers()
        } else {
            peers.to_vec()
        };

        targets
            .into_iter()
            .map(|peer| {
                let done = completion.clone().map(|c| {
                    Box::new(move |result: Result<(), TransportError>| c(result))
                        as ResourceCompletion
                });
                let progress = self
                    .session_reaching(&peer)
                    .send_resource(path, name, &peer, done);
                (peer, progress)
            })
            .collect()
    }

    fn session_reaching(&self, peer: &Peer) -> PeerSession {
        let st = self.inner.lock_state();
        self.inner
            .all_sessions(&st)
            .into_iter()
            .find(|s| s.contains(peer.id()))
            .unwrap_or_else(|| self.inner.session.clone())
    }
}
