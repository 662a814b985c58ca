//! Process-wide claim on a (service type, sub-service) channel, so two managers on the
//! same device never mingle signals. Injected into managers explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

/// Something that can be told to give up its channel.
pub(crate) trait Registrant: Send + Sync {
    fn evict(&self);
}

struct Entry {
    owner: Uuid,
    holder: Weak<dyn Registrant>,
}

#[derive(Clone, Default)]
pub struct ManagerRegistry {
    entries: Arc<Mutex<HashMap<(String, String), Entry>>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner` as holder of the channel. Returns the previous live holder, if it
    /// was someone else, so the caller can evict it outside the registry lock.
    pub(crate) fn claim(
        &self,
        service_type: &str,
        sub_service: &str,
        owner: Uuid,
        holder: Weak<dyn Registrant>,
    ) -> Option<Arc<dyn Registrant>> {
        let key = (service_type.to_string(), sub_service.to_string());
        let previous = self
            .entries
            .lock()
            .insert(key, Entry { owner, holder });
        let previous = previous.filter(|e| e.owner != owner)?;
        let holder = previous.holder.upgrade()?;
        info!(service_type, sub_service, "channel taken over from another manager");
        Some(holder)
    }

    /// Release the channel if `owner` still holds it.
    pub(crate) fn release(&self, service_type: &str, sub_service: &str, owner: Uuid) -> bool {
        let key = (service_type.to_string(), sub_service.to_string());
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(e) if e.owner == owner => {
                entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Whether a live manager holds the channel.
    pub fn is_claimed(&self, service_type: &str, sub_service: &str) -> bool {
        let key = (service_type.to_string(), sub_service.to_string());
        self.entries
            .lock()
            .get(&key)
            .map_or(false, |e| e.holder.strong_count() > 0)
    }

    pub(crate) fn holder(&self, service_type: &str, sub_service: &str) -> Option<Uuid> {
        let key = (service_type.to_string(), sub_service.to_string());
        self.entries.lock().get(&key).map(|e| e.owner)
    }
}
