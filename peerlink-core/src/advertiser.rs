//! Advertising the local peer, directly or through an assisted flow that presents
//! invitations to the user.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::transport::TransportAdvertiser;

/// The assisted flow shares the advertiser's bookkeeping.
pub type PeerAdvertiserAssistant = PeerAdvertiser;

pub struct PeerAdvertiser {
    advertiser: Arc<dyn TransportAdvertiser>,
    label: &'static str,
    advertising: AtomicBool,
}

impl PeerAdvertiser {
    pub fn new(advertiser: Arc<dyn TransportAdvertiser>) -> Self {
        Self::labelled(advertiser, "advertiser")
    }

    /// Assisted advertiser (invite-only connection type).
    pub fn assistant(advertiser: Arc<dyn TransportAdvertiser>) -> Self {
        Self::labelled(advertiser, "advertiser assistant")
    }

    fn labelled(advertiser: Arc<dyn TransportAdvertiser>, label: &'static str) -> Self {
        Self {
            advertiser,
            label,
            advertising: AtomicBool::new(false),
        }
    }

    pub fn start_advertising(&self) {
        debug!("starting {}", self.label);
        self.advertiser.start_advertising();
        self.advertising.store(true, Ordering::Release);
    }

    pub fn stop_advertising(&self) {
        if self.advertising.swap(false, Ordering::AcqRel) {
            debug!("stopping {}", self.label);
        }
        self.advertiser.stop_advertising();
    }

    /// Stop, then start again.
    pub fn restart(&self) {
        self.stop_advertising();
        self.start_advertising();
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::DiscoveryInfo;
    use crate::testing::RecordingTransport;
    use crate::transport::Transport;
    use crate::identity::PeerId;
    use crate::observable::Observable;
    use crate::producer::{AdvertiserEvent, AdvertiserEventProducer};

    #[test]
    fn restart_tracks_state() {
        let transport = RecordingTransport::new();
        let events = AdvertiserEventProducer::new(Arc::new(Observable::new(AdvertiserEvent::None)));
        let raw = transport.create_advertiser(
            &PeerId::new("me").unwrap(),
            "svc",
            &DiscoveryInfo::new(),
            events,
        );
        let adv = PeerAdvertiser::new(raw);
        assert!(!adv.is_advertising());
        adv.restart();
        assert!(adv.is_advertising());
        assert!(transport.is_advertising());
        assert_eq!(transport.advertise_starts(), 1);
        adv.stop_advertising();
        assert!(!adv.is_advertising());
        assert!(!transport.is_advertising());
    }
}
