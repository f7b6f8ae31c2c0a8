//! Listener registration and fan-out.
//!
//! [`ListenerRegistry`] is the thread-safe add/remove/notify primitive used by every notification
//! source in the crate: flag changes, data source status and data store status. Notifications are
//! never delivered on the producer's thread; [`Broadcaster`] hands them to the client's
//! [`TaskDispatcher`](crate::task_dispatcher::TaskDispatcher) thread.
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use crate::task_dispatcher::TaskDispatcher;

/// A receiver of notifications of type `T`.
///
/// Listeners are registered as `Arc<dyn Listener<T>>` and identified by pointer: to remove a
/// listener, pass the same `Arc` that was added. Any `Fn(&T)` closure is a listener.
///
/// ```
/// # use std::sync::Arc;
/// # use flagpulse::{FlagChangeEvent, FlagChangeListener};
/// let listener: FlagChangeListener = Arc::new(|event: &FlagChangeEvent| {
///     println!("flag {} changed", event.flag_key);
/// });
/// ```
///
/// # Notes
///
/// Listeners are called from a single background thread, one at a time. A slow listener delays
/// all notifications that come after it. A panicking listener is logged and skipped.
pub trait Listener<T>: Send + Sync {
    /// Handle a notification.
    fn notify(&self, value: &T);
}

impl<T, F: Fn(&T) + Send + Sync> Listener<T> for F {
    fn notify(&self, value: &T) {
        self(value);
    }
}

struct Registration<T> {
    listener: Arc<dyn Listener<T>>,
    /// Cleared on removal, so a notification that is already iterating over a snapshot skips
    /// the listener.
    active: AtomicBool,
}

/// Thread-safe set of listeners.
///
/// The listener list is copy-on-write: `notify` iterates over a snapshot taken when it starts, so
/// registration changes never wait for listener code.
pub struct ListenerRegistry<T> {
    registrations: RwLock<Arc<Vec<Arc<Registration<T>>>>>,
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        ListenerRegistry {
            registrations: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<T> ListenerRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        ListenerRegistry::default()
    }

    /// Register a listener. Adding the same listener twice registers it twice.
    pub fn add(&self, listener: Arc<dyn Listener<T>>) {
        let registration = Arc::new(Registration {
            listener,
            active: AtomicBool::new(true),
        });

        let mut slot = self
            .registrations
            .write()
            .expect("thread holding listeners lock should not panic");
        let mut registrations = Vec::with_capacity(slot.len() + 1);
        registrations.extend(slot.iter().cloned());
        registrations.push(registration);
        *slot = Arc::new(registrations);
    }

    /// Unregister one registration of `listener`. Does nothing if the listener is not registered.
    ///
    /// Once this returns, the listener receives no further notifications.
    pub fn remove(&self, listener: &Arc<dyn Listener<T>>) {
        let mut slot = self
            .registrations
            .write()
            .expect("thread holding listeners lock should not panic");

        let Some(position) = slot
            .iter()
            .position(|registration| same_listener(&registration.listener, listener))
        else {
            return;
        };

        slot[position].active.store(false, Ordering::SeqCst);

        let mut registrations: Vec<_> = slot.iter().cloned().collect();
        registrations.remove(position);
        *slot = Arc::new(registrations);
    }

    /// Returns `true` if at least one listener is registered.
    pub fn has_listeners(&self) -> bool {
        !self.snapshot().is_empty()
    }

    /// Deliver `value` to every listener registered at the time of the call.
    ///
    /// A listener that panics is logged; the remaining listeners still receive the value.
    pub fn notify(&self, value: &T) {
        for registration in self.snapshot().iter() {
            if !registration.active.load(Ordering::SeqCst) {
                continue;
            }

            let result = catch_unwind(AssertUnwindSafe(|| registration.listener.notify(value)));
            if let Err(panic) = result {
                log::warn!(target: "flagpulse",
                           "unexpected panic from a listener: {}", panic_message(&*panic));
            }
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Registration<T>>>> {
        let registrations = self
            .registrations
            .read()
            .expect("thread holding listeners lock should not panic");
        Arc::clone(&registrations)
    }
}

/// Compare listeners by the address of their data, ignoring vtables.
fn same_listener<T>(a: &Arc<dyn Listener<T>>, b: &Arc<dyn Listener<T>>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// A [`ListenerRegistry`] whose notifications run on the dispatch thread.
pub(crate) struct Broadcaster<T> {
    registry: Arc<ListenerRegistry<T>>,
    dispatcher: Arc<TaskDispatcher>,
}

impl<T: Send + Sync + 'static> Broadcaster<T> {
    pub(crate) fn new(dispatcher: Arc<TaskDispatcher>) -> Broadcaster<T> {
        Broadcaster {
            registry: Arc::new(ListenerRegistry::new()),
            dispatcher,
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn Listener<T>>) {
        self.registry.add(listener);
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn Listener<T>>) {
        self.registry.remove(listener);
    }

    pub(crate) fn has_listeners(&self) -> bool {
        self.registry.has_listeners()
    }

    /// Schedule delivery of `value` to the current listeners. Returns immediately.
    pub(crate) fn broadcast(&self, value: T) {
        if !self.registry.has_listeners() {
            return;
        }

        let registry = Arc::clone(&self.registry);
        self.dispatcher.submit(move || registry.notify(&value));
    }
}
