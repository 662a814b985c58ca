//! Keyed application listeners over the manager's public event channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::event::PeerConnectionEvent;
use crate::observable::Observable;
use crate::peer::Peer;
use crate::protocol::EventInfo;
use crate::session::PeerSession;

/// Where a listener runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// On the thread that published the event.
    #[default]
    Inline,
    /// On a task of the tokio runtime current at registration, in publication order.
    Background,
}

#[derive(Clone)]
pub struct PeerConnectionResponder {
    events: Arc<Observable<PeerConnectionEvent>>,
}

impl PeerConnectionResponder {
    pub fn new(events: Arc<Observable<PeerConnectionEvent>>) -> Self {
        Self { events }
    }

    /// Register `listener` under `key`, replacing any listener with that key. It is first
    /// called with the current event.
    pub fn listen_on<F>(&self, key: &str, delivery: Delivery, listener: F)
    where
        F: Fn(&PeerConnectionEvent) + Send + Sync + 'static,
    {
        match delivery {
            Delivery::Inline => self.events.subscribe_with_current(key, listener),
            Delivery::Background => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let (tx, mut rx) = mpsc::unbounded_channel::<PeerConnectionEvent>();
                    handle.spawn(async move {
                        while let Some(event) = rx.recv().await {
                            listener(&event);
                        }
                    });
                    self.events
                        .subscribe_with_current(key, move |event: &PeerConnectionEvent| {
                            let _ = tx.send(event.clone());
                        });
                }
                Err(_) => {
                    warn!(key, "no tokio runtime for background listener, delivering inline");
                    self.events.subscribe_with_current(key, listener);
                }
            },
        }
    }

    /// Register a listener for received events only.
    pub fn observe_events<F>(&self, key: &str, listener: F)
    where
        F: Fn(&EventInfo, &PeerSession, &Peer) + Send + Sync + 'static,
    {
        self.events.subscribe(key, move |event: &PeerConnectionEvent| {
            if let PeerConnectionEvent::ReceivedEvent {
                session,
                peer,
                event_info,
            } = event
            {
                listener(event_info, session, peer);
            }
        });
    }

    pub fn remove_listener(&self, key: &str) -> bool {
        self.events.unsubscribe(key)
    }

    pub fn remove_all_listeners(&self) {
        self.events.clear_subscribers();
    }

    pub fn listener_count(&self) -> usize {
        self.events.subscriber_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn responder() -> (Arc<Observable<PeerConnectionEvent>>, PeerConnectionResponder) {
        let events = Arc::new(Observable::new(PeerConnectionEvent::Ready));
        (events.clone(), PeerConnectionResponder::new(events))
    }

    #[test]
    fn inline_listener_sees_current_then_new() {
        let (events, r) = responder();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        r.listen_on("a", Delivery::Inline, move |e| s.lock().push(e.name()));
        events.set(PeerConnectionEvent::Started);
        assert_eq!(*seen.lock(), vec!["ready", "started"]);
    }

    #[test]
    fn remove_listener_stops_delivery() {
        let (events, r) = responder();
        let seen = Arc::new(Mutex::new(0usize));
        let s = seen.clone();
        r.listen_on("a", Delivery::Inline, move |_| *s.lock() += 1);
        assert!(r.remove_listener("a"));
        events.set(PeerConnectionEvent::Started);
        assert_eq!(*seen.lock(), 1);

        r.listen_on("b", Delivery::Inline, |_| {});
        r.listen_on("c", Delivery::Inline, |_| {});
        r.remove_all_listeners();
        assert_eq!(r.listener_count(), 0);
    }

    #[test]
    fn background_without_runtime_falls_back_inline() {
        let (events, r) = responder();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        r.listen_on("a", Delivery::Background, move |e| s.lock().push(e.name()));
        events.set(PeerConnectionEvent::Ended);
        assert_eq!(*seen.lock(), vec!["ready", "ended"]);
    }

    #[tokio::test]
    async fn background_listener_runs_on_task_in_order() {
        let (events, r) = responder();
        let (tx, mut rx) = mpsc::unbounded_channel();
        r.listen_on("bg", Delivery::Background, move |e| {
            let _ = tx.send(e.name());
        });
        events.set(PeerConnectionEvent::Started);
        events.set(PeerConnectionEvent::Ended);
        assert_eq!(rx.recv().await, Some("ready"));
        assert_eq!(rx.recv().await, Some("started"));
        assert_eq!(rx.recv().await, Some("ended"));
    }
}
