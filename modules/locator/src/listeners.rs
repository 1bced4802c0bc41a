use crate::lock;
use signance_core::ResolvedEndpoint;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

pub type ConnectionLostFn = dyn Fn(&ResolvedEndpoint) + Send + Sync;

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    map: Mutex<BTreeMap<u64, Arc<ConnectionLostFn>>>,
}

impl Listeners {
    pub(crate) fn add(self: &Arc<Self>, f: Arc<ConnectionLostFn>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.map).insert(id, f);
        Subscription { id, listeners: Some(Arc::downgrade(self)) }
    }

    fn remove(&self, id: u64) {
        lock(&self.map).remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.map).len()
    }

    /// Call every listener outside the lock. A panicking listener does not stop the rest.
    pub(crate) fn notify(&self, lost: &ResolvedEndpoint) {
        let snapshot: Vec<Arc<ConnectionLostFn>> = lock(&self.map).values().cloned().collect();
        for f in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(lost))).is_err() {
                warn!(base_url = %lost.base_url, "connection-lost listener panicked");
            }
        }
    }
}

/// Registration handle for a connection-lost listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Option<Weak<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keep the listener registered for the rest of the locator's life.
    pub fn detach(mut self) {
        self.listeners = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(l) = self.listeners.take().and_then(|w| w.upgrade()) {
            l.remove(self.id);
        }
    }
}
