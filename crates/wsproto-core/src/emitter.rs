//! Named-event publish/subscribe registry with per-emitter failure isolation.
//!
//! Listeners are async closures that receive an owned clone of the emitted
//! payload. `emit` runs them one after another in registration order and
//! completes once every listener has finished.
//!
//! An emitter may carry one recovery handler. When a listener panics the
//! handler is told which event and listener failed and the remaining
//! listeners still run. Without a handler the panic resumes in the caller of
//! `emit`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::errors::ListenerFailure;
use crate::ids::ListenerId;

/// Type-erased listener stored in the registry.
pub type Listener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called with (event name, listener id, failure, payload) when a listener panics.
pub type RecoveryHandler<T> = Arc<dyn Fn(&str, ListenerId, &ListenerFailure, &T) + Send + Sync>;

struct Registered<T> {
    id: ListenerId,
    once: bool,
    listener: Listener<T>,
}

impl<T> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            listener: Arc::clone(&self.listener),
        }
    }
}

pub struct Emitter<T> {
    listeners: RwLock<HashMap<String, Vec<Registered<T>>>>,
    recovery: RwLock<Option<RecoveryHandler<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            recovery: RwLock::new(None),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> Emitter<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event`.
    pub fn on<F, Fut>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(event.into(), listener, false)
    }

    /// Register a listener that is removed before its first invocation.
    pub fn once<F, Fut>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(event.into(), listener, true)
    }

    fn register<F, Fut>(&self, event: String, listener: F, once: bool) -> ListenerId
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = ListenerId::next(&self.next_id);
        let listener: Listener<T> = Arc::new(move |payload| listener(payload).boxed());
        self.listeners
            .write()
            .entry(event)
            .or_default()
            .push(Registered { id, once, listener });
        id
    }

    /// Remove a listener. Returns false if it was not registered for `event`.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }

    /// Install the recovery handler, replacing any previous one.
    pub fn recover_with<F>(&self, handler: F)
    where
        F: Fn(&str, ListenerId, &ListenerFailure, &T) + Send + Sync + 'static,
    {
        *self.recovery.write() = Some(Arc::new(handler));
    }

    pub fn has_recovery(&self) -> bool {
        self.recovery.read().is_some()
    }

    /// Invoke every listener registered for `event`, in registration order.
    /// Returns the number of listeners invoked.
    pub async fn emit(&self, event: &str, payload: T) -> usize {
        let snapshot = self.snapshot(event);
        let count = snapshot.len();

        for entry in snapshot {
            let listener = Arc::clone(&entry.listener);
            let arg = payload.clone();
            let outcome = AssertUnwindSafe(async move { listener(arg).await })
                .catch_unwind()
                .await;

            if let Err(panic) = outcome {
                let recovery = self.recovery.read().clone();
                match recovery {
                    Some(handler) => {
                        let failure = ListenerFailure::from_panic(panic.as_ref());
                        handler(event, entry.id, &failure, &payload);
                    }
                    None => std::panic::resume_unwind(panic),
                }
            }
        }

        count
    }

    // The registry lock is released before any listener runs, so listeners
    // may register or remove listeners on this emitter.
    fn snapshot(&self, event: &str) -> Vec<Registered<T>> {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(event) else {
            return Vec::new();
        };
        let snapshot = entries.clone();
        entries.retain(|entry| !entry.once);
        if entries.is_empty() {
            listeners.remove(event);
        }
        snapshot
    }
}
