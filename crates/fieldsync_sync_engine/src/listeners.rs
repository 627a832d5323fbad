//! Callback registries with unsubscribe handles.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: u64);
}

struct Registry<E> {
    name: &'static str,
    next_id: AtomicU64,
    handlers: RwLock<Vec<(u64, Handler<E>)>>,
}

impl<E> Unsubscribe for Registry<E> {
    fn unsubscribe(&self, id: u64) {
        self.handlers.write().retain(|(hid, _)| *hid != id);
    }
}

/// An ordered list of callbacks for events of type `E`.
///
/// Handlers run synchronously on the emitting thread, in subscription
/// order. The list is snapshotted before dispatch, so a handler may
/// subscribe or unsubscribe (itself included) without deadlocking. A
/// panicking handler is logged and skipped; later handlers still run.
pub struct Listeners<E> {
    registry: Arc<Registry<E>>,
}

impl<E: 'static> Listeners<E> {
    /// Creates an empty registry. `name` labels log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            registry: Arc::new(Registry {
                name,
                next_id: AtomicU64::new(1),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Registers `handler`. It stays registered until the returned
    /// [`Subscription`] is unsubscribed or dropped.
    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.handlers.write().push((id, Arc::new(handler)));
        let registry: Arc<dyn Unsubscribe> = self.registry.clone();
        Subscription {
            id,
            registry: Some(Arc::downgrade(&registry)),
        }
    }

    /// Calls every handler with `event`. Returns how many ran to completion.
    pub fn emit(&self, event: &E) -> usize {
        let handlers: Vec<Handler<E>> = self
            .registry
            .handlers
            .read()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(registry = self.registry.name, "event handler panicked"),
            }
        }
        delivered
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.registry.handlers.read().len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.registry.handlers.read().is_empty()
    }

    /// Removes every handler. Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        self.registry.handlers.write().clear();
    }
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("name", &self.registry.name)
            .field("handlers", &self.registry.handlers.read().len())
            .finish()
    }
}

/// Handle to a registered callback.
///
/// Dropping the handle unsubscribes. Call [`Subscription::detach`] to keep
/// the callback registered for the lifetime of its registry instead.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Option<Weak<dyn Unsubscribe>>,
}

impl Subscription {
    /// Removes the callback. Safe to call any number of times, and after
    /// the registry itself is gone.
    pub fn unsubscribe(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|w| w.upgrade()) {
            registry.unsubscribe(self.id);
        }
    }

    /// Whether this handle still controls a registration.
    pub fn is_active(&self) -> bool {
        self.registry
            .as_ref()
            .is_some_and(|w| w.strong_count() > 0)
    }

    /// Releases the handle without unsubscribing.
    pub fn detach(mut self) {
        self.registry = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn emits_in_subscription_order() {
        let listeners = Listeners::<u32>::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().push(("first", *v)))
        };
        let s2 = {
            let seen = seen.clone();
            listeners.subscribe(move |v| seen.lock().push(("second", *v)))
        };

        assert_eq!(listeners.emit(&7), 2);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
        drop((s1, s2));
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let listeners = Listeners::<()>::new("test");
        let mut sub = listeners.subscribe(|_| {});
        assert_eq!(listeners.len(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(listeners.is_empty());
        assert!(!sub.is_active());
    }

    #[test]
    fn drop_unsubscribes_and_detach_does_not() {
        let listeners = Listeners::<()>::new("test");
        {
            let _sub = listeners.subscribe(|_| {});
            assert_eq!(listeners.len(), 1);
        }
        assert!(listeners.is_empty());

        listeners.subscribe(|_| {}).detach();
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn unsubscribe_after_registry_dropped() {
        let listeners = Listeners::<()>::new("test");
        let mut sub = listeners.subscribe(|_| {});
        drop(listeners);
        assert!(!sub.is_active());
        sub.unsubscribe();
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let listeners = Listeners::<u8>::new("test");
        let reached = Arc::new(Mutex::new(false));

        let _a = listeners.subscribe(|_| panic!("handler bug"));
        let _b = {
            let reached = reached.clone();
            listeners.subscribe(move |_| *reached.lock() = true)
        };

        assert_eq!(listeners.emit(&1), 1);
        assert!(*reached.lock());
    }

    #[test]
    fn handler_may_unsubscribe_during_emit() {
        let listeners = Listeners::<()>::new("test");
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let sub = {
            let slot = slot.clone();
            listeners.subscribe(move |_| {
                if let Some(mut s) = slot.lock().take() {
                    s.unsubscribe();
                }
            })
        };
        *slot.lock() = Some(sub);

        listeners.emit(&());
        assert!(listeners.is_empty());
    }

    #[test]
    fn clear_removes_everything() {
        let listeners = Listeners::<()>::new("test");
        let sub = listeners.subscribe(|_| {});
        listeners.clear();
        assert!(listeners.is_empty());
        drop(sub);
    }
}
