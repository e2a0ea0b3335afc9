//! Typed publish/subscribe primitive
//!
//! Every observable object in the engine (tasks, graphs, workflows) carries an
//! [`EventBus`] parameterized by its event enum. The bus makes three promises:
//!
//! 1. **Registration order**: listeners are invoked in the order they were added.
//! 2. **Re-entrancy safety**: emitting from inside a handler cannot deadlock, and
//!    listeners added during an emission are not invoked for that emission.
//! 3. **Isolation**: a panicking listener never takes down the emitter; the panic
//!    is reported through the bus's listener-error hook.
//!
//! Listeners are synchronous closures; async consumers bridge with
//! [`EventBus::wait_for`], which resolves a future on the first matching event.
//!
//! # Example
//!
//! ```rust,ignore
//! let bus: EventBus<TaskEvent> = EventBus::new();
//! let sub = bus.on(|event| println!("{event:?}"));
//!
//! let completed = bus.wait_for(|e| matches!(e, TaskEvent::Complete { .. }));
//! bus.emit(TaskEvent::Start);
//! bus.emit(TaskEvent::Complete { output: json!({}) });
//! let event = completed.await;
//!
//! sub.unsubscribe();
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

/// Listener callback for events of type `E`
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Hook invoked when a listener panics during emission
pub type ListenerErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Entry<E> {
    id: u64,
    once: bool,
    filter: Option<Arc<dyn Fn(&E) -> bool + Send + Sync>>,
    listener: Listener<E>,
}

struct BusInner<E> {
    listeners: Mutex<Vec<Entry<E>>>,
    next_id: AtomicU64,
    error_hook: Mutex<Option<ListenerErrorHook>>,
}

/// Handle identifying one registered listener
///
/// Call [`EventSubscription::unsubscribe`] to remove the listener. Dropping
/// the handle leaves the listener attached for the bus's lifetime.
pub struct EventSubscription<E> {
    id: u64,
    bus: Weak<BusInner<E>>,
}

impl<E> EventSubscription<E> {
    /// Remove the listener from its bus
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.listeners.lock().retain(|entry| entry.id != self.id);
        }
    }
}

/// Typed event bus (cheap to clone; clones share listeners)
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Send + Sync + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + Sync + 'static> EventBus<E> {
    /// Create a bus with no listeners
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                error_hook: Mutex::new(None),
            }),
        }
    }

    /// Register a listener; returns its unsubscribe handle
    pub fn on(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> EventSubscription<E> {
        self.register(Arc::new(listener), false, None)
    }

    /// Register a listener removed after its first invocation
    pub fn once(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> EventSubscription<E> {
        self.register(Arc::new(listener), true, None)
    }

    /// Install the hook invoked when a listener panics
    pub fn on_listener_error(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.error_hook.lock() = Some(Arc::new(hook));
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn register(
        &self,
        listener: Listener<E>,
        once: bool,
        filter: Option<Arc<dyn Fn(&E) -> bool + Send + Sync>>,
    ) -> EventSubscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push(Entry {
            id,
            once,
            filter,
            listener,
        });
        EventSubscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every listener registered before this call
    ///
    /// Listeners run on the emitting thread, outside the registry lock, in
    /// registration order. `once` listeners (and satisfied `wait_for`
    /// registrations) are removed after delivery.
    pub fn emit(&self, event: E) {
        // Snapshot so handlers may subscribe/unsubscribe/emit freely.
        let snapshot: Vec<(u64, bool, Option<Arc<dyn Fn(&E) -> bool + Send + Sync>>, Listener<E>)> = {
            let listeners = self.inner.listeners.lock();
            listeners
                .iter()
                .map(|e| (e.id, e.once, e.filter.clone(), Arc::clone(&e.listener)))
                .collect()
        };

        let mut fired_once: Vec<u64> = Vec::new();
        for (id, once, filter, listener) in snapshot {
            if let Some(filter) = &filter {
                if !filter(&event) {
                    continue;
                }
            }
            if once {
                // Removing before invocation keeps `once` exact even if the
                // listener itself re-emits the same event.
                fired_once.push(id);
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if let Err(panic) = outcome {
                let message = panic_message(&panic);
                warn!(listener_id = id, %message, "event listener panicked");
                let hook = self.inner.error_hook.lock().clone();
                if let Some(hook) = hook {
                    hook(&message);
                }
            }
        }

        if !fired_once.is_empty() {
            self.inner
                .listeners
                .lock()
                .retain(|entry| !fired_once.contains(&entry.id));
        }
    }
}

impl<E: Clone + Send + Sync + 'static> EventBus<E> {
    /// Future resolving to the first event matching `predicate`
    ///
    /// Resolves to `None` if the bus is dropped before a match arrives.
    pub fn wait_for(
        &self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> impl std::future::Future<Output = Option<E>> {
        let (tx, rx) = oneshot::channel::<E>();
        let slot = Mutex::new(Some(tx));
        let subscription = self.register(
            Arc::new(move |event: &E| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(event.clone());
                }
            }),
            true,
            Some(Arc::new(predicate)),
        );
        async move {
            let result = rx.await.ok();
            // Keep the registration alive until resolution so the filter entry
            // is cleaned up exactly once.
            drop(subscription);
            result
        }
    }

    /// Future resolving to the next event of any kind
    pub fn wait_next(&self) -> impl std::future::Future<Output = Option<E>> {
        self.wait_for(|_| true)
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_run_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(move |_| order.lock().push(tag));
        }
        bus.emit(1);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn once_fires_exactly_once() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            bus.once(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit(1);
        bus.emit(2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sub = {
            let count = Arc::clone(&count);
            bus.on(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        bus.emit(1);
        sub.unsubscribe();
        bus.emit(2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_added_during_emission_skips_current_event() {
        let bus: EventBus<u32> = EventBus::new();
        let late_calls = Arc::new(AtomicUsize::new(0));
        {
            let bus_inner = bus.clone();
            let late_calls = Arc::clone(&late_calls);
            bus.on(move |_| {
                let late_calls = Arc::clone(&late_calls);
                bus_inner.on(move |_| {
                    late_calls.fetch_add(1, Ordering::SeqCst);
                });
            });
        }
        bus.emit(1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        bus.emit(2);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emitting_from_a_listener_does_not_deadlock() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let bus_inner = bus.clone();
            let seen = Arc::clone(&seen);
            bus.on(move |event| {
                seen.lock().push(*event);
                if *event == 1 {
                    bus_inner.emit(2);
                }
            });
        }
        bus.emit(1);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let bus: EventBus<u32> = EventBus::new();
        let reported = Arc::new(Mutex::new(Vec::new()));
        {
            let reported = Arc::clone(&reported);
            bus.on_listener_error(move |message| reported.lock().push(message.to_string()));
        }
        bus.on(|_| panic!("bad listener"));
        let survived = Arc::new(AtomicUsize::new(0));
        {
            let survived = Arc::clone(&survived);
            bus.on(move |_| {
                survived.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit(1);
        assert_eq!(survived.load(Ordering::SeqCst), 1);
        assert_eq!(reported.lock().len(), 1);
        assert!(reported.lock()[0].contains("bad listener"));
    }

    #[tokio::test]
    async fn wait_for_resolves_on_match() {
        let bus: EventBus<u32> = EventBus::new();
        let waiter = bus.wait_for(|e| *e == 7);
        bus.emit(3);
        bus.emit(7);
        assert_eq!(waiter.await, Some(7));
    }

    #[tokio::test]
    async fn wait_for_resolves_none_when_bus_drops() {
        let bus: EventBus<u32> = EventBus::new();
        let waiter = bus.wait_for(|_| true);
        drop(bus);
        assert_eq!(waiter.await, None);
    }
}
