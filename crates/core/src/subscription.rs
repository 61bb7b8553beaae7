//! Disposable handler subscriptions
//!
//! `on()` hands back a [`Subscription`] instead of expecting a matching
//! `off()` call later. Dropping (or disposing) the subscription removes the
//! handler. A [`SubscriptionSet`] collects everything registered for one
//! call session so cleanup can release it in one step.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Guard that unregisters a handler when dropped
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create a subscription that runs `unsubscribe` exactly once
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription with nothing to release
    pub fn noop() -> Self {
        Self { unsubscribe: None }
    }

    /// Whether the handler is still registered through this guard
    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }

    /// Unregister now
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// All subscriptions owned by one call session
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Dispose every subscription, returning how many were released
    ///
    /// Calling it again is a no-op.
    pub fn dispose_all(&mut self) -> usize {
        let count = self.subscriptions.len();
        self.subscriptions.clear();
        count
    }
}

impl Extend<Subscription> for SubscriptionSet {
    fn extend<T: IntoIterator<Item = Subscription>>(&mut self, iter: T) {
        self.subscriptions.extend(iter);
    }
}

struct RegistryInner<H> {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, H)>>,
}

/// Keyed handler registry for transport implementations
///
/// Handlers are cloned out before dispatch, so a handler may drop its own
/// subscription (or register new ones) while being invoked.
pub struct HandlerRegistry<H> {
    inner: Arc<Mutex<RegistryInner<H>>>,
}

impl<H> Clone for HandlerRegistry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Clone + Send + 'static> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Clone + Send + 'static> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                handlers: HashMap::new(),
            })),
        }
    }

    /// Register a handler under `key`
    pub fn register(&self, key: &str, handler: H) -> Subscription {
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner
                .handlers
                .entry(key.to_string())
                .or_default()
                .push((id, handler));
            id
        };

        let registry: Weak<Mutex<RegistryInner<H>>> = Arc::downgrade(&self.inner);
        let key = key.to_string();
        Subscription::new(move || {
            let Some(inner) = registry.upgrade() else {
                return;
            };
            let mut inner = inner.lock();
            let now_empty = match inner.handlers.get_mut(&key) {
                Some(list) => {
                    list.retain(|(handler_id, _)| *handler_id != id);
                    list.is_empty()
                },
                None => false,
            };
            if now_empty {
                inner.handlers.remove(&key);
            }
        })
    }

    /// Snapshot of the handlers currently registered under `key`
    pub fn handlers(&self, key: &str) -> Vec<H> {
        self.inner
            .lock()
            .handlers
            .get(key)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .handlers
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Total number of registered handlers across all keys
    pub fn total(&self) -> usize {
        self.inner.lock().handlers.values().map(Vec::len).sum()
    }
}
