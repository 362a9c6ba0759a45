//! Typed listener registry with per-listener panic isolation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::error;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct RegistryInner<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

fn lock<T>(inner: &Mutex<RegistryInner<T>>) -> MutexGuard<'_, RegistryInner<T>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Listeners for one event kind, invoked in registration order.
pub struct ListenerRegistry<T> {
    name: &'static str,
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T: 'static> ListenerRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(callback)));

        let weak: Weak<Mutex<RegistryInner<T>>> = Arc::downgrade(&self.inner);
        Unsubscribe {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Deliver `event` to every current listener. A panicking listener is
    /// logged and stays registered; the rest still run. Returns how many
    /// listeners completed normally.
    pub fn emit(&self, event: &T) -> usize {
        let snapshot: Vec<Listener<T>> = lock(&self.inner)
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let mut delivered = 0;
        for listener in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| (*listener)(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(event = self.name, "realtime listener panicked"),
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by a subscription. Calling [`Unsubscribe::unsubscribe`]
/// removes exactly that listener; dropping the handle keeps it registered.
pub struct Unsubscribe {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&u32) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move |_: &u32| {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let registry = ListenerRegistry::<u32>::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            let _ = registry.subscribe(move |value| seen.lock().unwrap().push((tag, *value)));
        }
        registry.emit(&1);
        registry.emit(&2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a", 1), ("b", 1), ("c", 1), ("a", 2), ("b", 2), ("c", 2)]
        );
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let registry = ListenerRegistry::<u32>::new("test");
        let (first_count, first) = counter();
        let (second_count, second) = counter();
        let first_handle = registry.subscribe(first);
        let _second_handle = registry.subscribe(second);

        registry.emit(&1);
        first_handle.unsubscribe();
        registry.emit(&2);
        registry.emit(&3);

        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn identical_callbacks_are_tracked_separately() {
        let registry = ListenerRegistry::<u32>::new("test");
        let (count, callback) = counter();
        let callback = Arc::new(callback);
        let a = {
            let cb = Arc::clone(&callback);
            registry.subscribe(move |v| (*cb)(v))
        };
        let _b = {
            let cb = Arc::clone(&callback);
            registry.subscribe(move |v| (*cb)(v))
        };
        a.unsubscribe();
        registry.emit(&7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let registry = ListenerRegistry::<u32>::new("test");
        let _bad = registry.subscribe(|_| panic!("listener bug"));
        let (count, good) = counter();
        let _good = registry.subscribe(good);

        assert_eq!(registry.emit(&1), 1);
        assert_eq!(registry.emit(&2), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 2, "panicking listener stays subscribed");
    }

    #[test]
    fn unsubscribe_after_registry_drop_is_harmless() {
        let registry = ListenerRegistry::<u32>::new("test");
        let handle = registry.subscribe(|_| {});
        drop(registry);
        handle.unsubscribe();
    }
}
