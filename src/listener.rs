//! Typed, disposable event listener registries.
//!
//! Every public event surface (engine-level `on_incoming_call`, call-level
//! `on_message`, etc) is backed by a [`Registry<T>`]. Registering returns a
//! [`Disposer`]; dropping or explicitly calling it removes the listener, so
//! callers never need a matching `off()` call threaded through their own
//! bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type BoxedListener<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    listeners: Mutex<Vec<(u64, BoxedListener<T>)>>,
    next_id: AtomicU64,
}

/// An ordered collection of listeners for events of type `T`.
///
/// Cloning a `Registry` shares the same underlying listener list; this is
/// how a registry can be handed to both the engine's public API and its
/// internal actor loop without wrapping it in an `Arc` at every call site.
pub struct Registry<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a listener, returning a handle that removes it on drop.
    pub fn add<F>(&self, f: F) -> Disposer<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .push((id, Box::new(f)));
        Disposer {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Invoke every currently-registered listener with `event`, in
    /// registration order.
    ///
    /// The lock is held for the duration of the emit, so a listener must
    /// not call back into `add`/`dispose` on this same registry without
    /// deadlocking — matching the single-threaded-callback expectation of
    /// the actor loop that is this registry's only caller.
    pub fn emit(&self, event: &T) {
        let guard = self.inner.listeners.lock().unwrap();
        for (_, f) in guard.iter() {
            f(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its associated listener when dropped or explicitly [`dispose`]d.
///
/// [`dispose`]: Disposer::dispose
pub struct Disposer<T> {
    id: u64,
    inner: Arc<Inner<T>>,
}

impl<T> Disposer<T> {
    /// Remove the listener now, rather than waiting for drop.
    pub fn dispose(self) {
        // Drop performs the removal; this makes the intent explicit at the
        // call site instead of relying on scope exit.
    }
}

impl<T> Drop for Disposer<T> {
    fn drop(&mut self) {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emits_to_registered_listeners_in_order() {
        let registry: Registry<i32> = Registry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen1 = seen.clone();
        let seen2 = seen.clone();
        let _a = registry.add(move |v| seen1.lock().unwrap().push(("a", *v)));
        let _b = registry.add(move |v| seen2.lock().unwrap().push(("b", *v)));

        registry.emit(&42);

        assert_eq!(*seen.lock().unwrap(), vec![("a", 42), ("b", 42)]);
    }

    #[test]
    fn disposer_removes_listener_on_drop() {
        let registry: Registry<i32> = Registry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let disposer = registry.add(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        registry.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(disposer);
        registry.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_dispose_removes_listener() {
        let registry: Registry<i32> = Registry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let disposer = registry.add(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        disposer.dispose();
        registry.emit(&1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
