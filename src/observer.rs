//! # Observer Registry
//!
//! Subscribe-style fan-out used by the session (message / connection / error channels),
//! the playback aggregator (playback events) and the call coordinator (state, recognition,
//! reply and error channels).
//!
//! ## Delivery Contract:
//! - Subscribers are called in subscription order with a shared reference to the event
//! - A panicking subscriber is logged and skipped; the remaining subscribers still run
//! - The registry lock is never held while a subscriber runs, so a subscriber may
//!   subscribe, unsubscribe or notify from inside its own callback
//! - [`Subscription::unsubscribe`] removes exactly the callback it was returned for

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::error;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// A set of callbacks for one event type.
pub struct Observers<T> {
    name: &'static str,
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: 'static> Observers<T> {
    /// Create an empty registry. `name` only appears in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a callback and get back the handle that removes it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Deliver `event` to every current subscriber.
    pub fn notify(&self, event: &T) {
        // Snapshot so callbacks can touch the registry without deadlocking
        let snapshot: Vec<Callback<T>> = lock(&self.registry)
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
            if outcome.is_err() {
                error!(observers = self.name, "Subscriber panicked, continuing with the rest");
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscriber.
    pub fn clear(&self) {
        lock(&self.registry).entries.clear();
    }
}

fn lock<T>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by [`Observers::subscribe`].
///
/// Dropping the handle keeps the callback registered; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
