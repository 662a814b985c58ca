//! Single-value event channel with ordered, keyed subscribers.

use std::sync::Arc;

use parking_lot::Mutex;

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct State<T> {
    value: T,
    subscribers: Vec<(String, Subscriber<T>)>,
}

/// Holds the latest value and broadcasts every new one. Subscribers run in
/// subscription order, outside the channel's lock, so a subscriber may call back
/// into the channel.
pub struct Observable<T> {
    initial: T,
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        Self {
            state: Mutex::new(State {
                value: initial.clone(),
                subscribers: Vec::new(),
            }),
            initial,
        }
    }

    pub fn value(&self) -> T {
        self.state.lock().value.clone()
    }

    /// Register `f` under `key`. An existing subscriber with the same key is replaced
    /// in place and keeps its position.
    pub fn subscribe<F>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let key = key.into();
        let f: Subscriber<T> = Arc::new(f);
        let mut st = self.state.lock();
        match st.subscribers.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = f,
            None => st.subscribers.push((key, f)),
        }
    }

    /// Like [`subscribe`](Self::subscribe), but first calls `f` with the current value.
    pub fn subscribe_with_current<F>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let current = self.value();
        f(&current);
        self.subscribe(key, f);
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        let mut st = self.state.lock();
        let before = st.subscribers.len();
        st.subscribers.retain(|(k, _)| k != key);
        st.subscribers.len() != before
    }

    pub fn clear_subscribers(&self) {
        self.state.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Store `value`, then broadcast it to a snapshot of the current subscribers.
    pub fn set(&self, value: T) {
        let subscribers: Vec<Subscriber<T>> = {
            let mut st = self.state.lock();
            st.value = value.clone();
            st.subscribers.iter().map(|(_, f)| f.clone()).collect()
        };
        for f in subscribers {
            f(&value);
        }
    }

    /// Restore the initial value without notifying anyone.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        st.value = self.initial.clone();
    }
}
