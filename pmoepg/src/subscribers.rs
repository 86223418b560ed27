//! Change notifications for the live cache.

use crate::entry::{ChannelId, ProgrammeEntry};
use parking_lot::Mutex;
use std::sync::Arc;

/// One changed channel: its id and the entry now cached for it
pub type EpgUpdate = (ChannelId, ProgrammeEntry);

/// Callback invoked with the updates of a refresh cycle
pub type EpgUpdateCallback = Arc<dyn Fn(&[EpgUpdate]) + Send + Sync>;

/// Handle returned by [`Subscribers::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, EpgUpdateCallback)>,
}

/// Registry of update callbacks, invoked in registration order
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<Registry>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: EpgUpdateCallback) -> SubscriptionId {
        let mut registry = self.inner.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.callbacks.push((id, callback));
        id
    }

    /// Returns `false` when `id` was not (or no longer) registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.inner.lock();
        let before = registry.callbacks.len();
        registry.callbacks.retain(|(sid, _)| *sid != id);
        registry.callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every subscriber with `updates`; nothing happens for an
    /// empty list.
    pub fn publish(&self, updates: &[EpgUpdate]) {
        if updates.is_empty() {
            return;
        }
        // Released before the calls so callbacks may (un)subscribe.
        let callbacks: Vec<_> = {
            let registry = self.inner.lock();
            registry.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback(updates);
        }
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}
