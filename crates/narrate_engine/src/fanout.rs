use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use narrate_logging::{narrate_error, narrate_warn};

use crate::ChannelMessage;

type Callback = Arc<dyn Fn(&ChannelMessage) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(u64, Callback)>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One inbound channel, many independent listeners.
///
/// Clones share the same registry.
#[derive(Clone, Default)]
pub struct FanOut {
    registry: Arc<Mutex<Registry>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }

    /// Delivers `message` to everyone subscribed when the call started.
    ///
    /// Returns how many callbacks completed without error.
    pub fn publish(&self, message: &ChannelMessage) -> usize {
        let snapshot: Vec<(u64, Callback)> = lock(&self.registry).subscribers.clone();
        let mut delivered = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => narrate_warn!("Subscriber {} failed: {:#}", id, err),
                Err(_) => narrate_error!("Subscriber {} panicked", id),
            }
        }
        delivered
    }
}

/// Handle that keeps a callback registered. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry)
                .subscribers
                .retain(|(id, _)| *id != self.id);
        }
    }
}
