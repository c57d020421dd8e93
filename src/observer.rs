//! Listener registry shared by the sync status reporter and the storage
//! backends' change notifications.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
};

use log::{trace, warn};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<T>>,
}

/// A set of callbacks invoked with every emitted value.
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Listeners {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    /// Registers a callback. It stays registered until the returned handle is
    /// unsubscribed or the registry is cleared.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = match self.registry.lock() {
            Ok(mut registry) => {
                let id = registry.next_id;
                registry.next_id += 1;
                registry.callbacks.insert(id, Arc::new(callback));
                id
            }
            Err(e) => {
                warn!("Listener registry poisoned, subscription dropped: {}", e);
                return Subscription::detached();
            }
        };
        trace!("Registered listener {}", id);

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    if let Ok(mut registry) = registry.lock() {
                        registry.callbacks.remove(&id);
                        trace!("Removed listener {}", id);
                    }
                }
            })),
        }
    }

    /// Calls every registered callback with `value`.
    ///
    /// Callbacks run outside the registry lock so they may subscribe or
    /// unsubscribe re-entrantly.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = match self.registry.lock() {
            Ok(registry) => registry.callbacks.values().cloned().collect(),
            Err(e) => {
                warn!("Listener registry poisoned, event dropped: {}", e);
                return;
            }
        };
        for callback in callbacks {
            callback(value);
        }
    }

    /// Removes every callback.
    pub fn clear(&self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.callbacks.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .map(|registry| registry.callbacks.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by a registration. Call [`Subscription::unsubscribe`] to
/// stop receiving events; dropping the handle keeps the callback registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn detached() -> Self {
        Subscription { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
