//! Flag change notifications.
//!
//! [`FlagTracker`] notifies listeners when a flag's configuration changes. Derived "value change"
//! listeners re-evaluate the flag for a fixed context and only fire when the evaluated value
//! actually changes.
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::{
    listeners::{Broadcaster, Listener},
    task_dispatcher::TaskDispatcher,
    Context,
};

/// Capability to evaluate a flag for a context. Flag rule evaluation lives outside this crate.
///
/// Any `Fn(&str, &Context) -> serde_json::Value` closure is an evaluator.
pub trait Evaluator: Send + Sync {
    /// Evaluate `flag_key` for `context`, returning the resulting flag value.
    fn evaluate(&self, flag_key: &str, context: &Context) -> serde_json::Value;
}

impl<F: Fn(&str, &Context) -> serde_json::Value + Send + Sync> Evaluator for F {
    fn evaluate(&self, flag_key: &str, context: &Context) -> serde_json::Value {
        self(flag_key, context)
    }
}

pub(crate) struct NoopEvaluator;
impl Evaluator for NoopEvaluator {
    fn evaluate(&self, _flag_key: &str, _context: &Context) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// A flag's configuration changed. The flag's value for a given context may or may not differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagChangeEvent {
    /// Key of the changed flag.
    pub flag_key: String,
}

/// A flag's evaluated value changed for a specific context.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagValueChangeEvent {
    /// Key of the changed flag.
    pub flag_key: String,
    /// Value before the change.
    pub old_value: serde_json::Value,
    /// Value after the change.
    pub new_value: serde_json::Value,
}

/// A registered flag change listener.
pub type FlagChangeListener = Arc<dyn Listener<FlagChangeEvent>>;

/// Re-evaluates one flag for one context on every change of that flag, and reports value deltas.
struct FlagValueChangeAdapter {
    flag_key: String,
    context: Context,
    evaluator: Arc<dyn Evaluator>,
    /// Only touched from the dispatch thread; the mutex exists to satisfy `Sync`.
    last_value: Mutex<serde_json::Value>,
    callback: Box<dyn Listener<FlagValueChangeEvent>>,
}

impl Listener<FlagChangeEvent> for FlagValueChangeAdapter {
    fn notify(&self, event: &FlagChangeEvent) {
        if event.flag_key != self.flag_key {
            return;
        }

        let new_value = self.evaluator.evaluate(&self.flag_key, &self.context);

        let old_value = {
            let mut last_value = self
                .last_value
                .lock()
                .expect("thread holding flag value lock should not panic");
            if *last_value == new_value {
                return;
            }
            std::mem::replace(&mut *last_value, new_value.clone())
        };

        log::trace!(target: "flagpulse",
                    flag_key:display = self.flag_key,
                    context_key = self.context.key();
                    "flag value changed");

        self.callback.notify(&FlagValueChangeEvent {
            flag_key: self.flag_key.clone(),
            old_value,
            new_value,
        });
    }
}

/// Registration point for flag change listeners.
pub struct FlagTracker {
    broadcaster: Broadcaster<FlagChangeEvent>,
    evaluator: Arc<dyn Evaluator>,
}

impl FlagTracker {
    pub(crate) fn new(dispatcher: Arc<TaskDispatcher>, evaluator: Arc<dyn Evaluator>) -> Self {
        FlagTracker {
            broadcaster: Broadcaster::new(dispatcher),
            evaluator,
        }
    }

    /// Register a listener that is called whenever any flag's configuration changes, including
    /// indirect changes through prerequisites or segments.
    pub fn add_flag_change_listener(&self, listener: FlagChangeListener) {
        self.broadcaster.add(listener);
    }

    /// Unregister a listener added with [`FlagTracker::add_flag_change_listener`] or returned by
    /// [`FlagTracker::add_flag_value_change_listener`].
    pub fn remove_flag_change_listener(&self, listener: &FlagChangeListener) {
        self.broadcaster.remove(listener);
    }

    /// Register a callback that is called when the value of `flag_key` for `context` changes.
    ///
    /// The current value is evaluated immediately. Each time the flag's configuration changes, the
    /// flag is evaluated again and `callback` is called only if the value differs from the last one.
    ///
    /// Returns the underlying flag change listener, which can be passed to
    /// [`FlagTracker::remove_flag_change_listener`].
    ///
    /// ```
    /// # fn test(tracker: &flagpulse::FlagTracker) {
    /// # use flagpulse::{Context, FlagValueChangeEvent};
    /// let listener = tracker.add_flag_value_change_listener(
    ///     "new-checkout",
    ///     Context::new("user-key"),
    ///     |event: &FlagValueChangeEvent| {
    ///         println!("{} is now {}", event.flag_key, event.new_value);
    ///     },
    /// );
    /// tracker.remove_flag_change_listener(&listener);
    /// # }
    /// ```
    pub fn add_flag_value_change_listener(
        &self,
        flag_key: impl Into<String>,
        context: Context,
        callback: impl Listener<FlagValueChangeEvent> + 'static,
    ) -> FlagChangeListener {
        let flag_key = flag_key.into();
        let initial_value = self.evaluator.evaluate(&flag_key, &context);

        let listener: FlagChangeListener = Arc::new(FlagValueChangeAdapter {
            flag_key,
            context,
            evaluator: Arc::clone(&self.evaluator),
            last_value: Mutex::new(initial_value),
            callback: Box::new(callback),
        });
        self.broadcaster.add(Arc::clone(&listener));
        listener
    }

    /// Notify listeners that `flag_key` changed.
    pub(crate) fn notify_flag_changed(&self, flag_key: impl Into<String>) {
        self.broadcaster.broadcast(FlagChangeEvent {
            flag_key: flag_key.into(),
        });
    }

    pub(crate) fn has_listeners(&self) -> bool {
        self.broadcaster.has_listeners()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{mpsc, Arc, Mutex},
        time::Duration,
    };

    use serde_json::{json, Value};

    use super::*;

    const NO_MORE: Duration = Duration::from_millis(100);
    const WAIT: Duration = Duration::from_secs(1);

    /// Evaluator backed by a table of `(flag, context key) -> value`.
    #[derive(Default)]
    struct TableEvaluator {
        values: Mutex<HashMap<(String, String), Value>>,
    }

    impl TableEvaluator {
        fn set(&self, flag_key: &str, context_key: &str, value: Value) {
            self.values
                .lock()
                .unwrap()
                .insert((flag_key.to_owned(), context_key.to_owned()), value);
        }
    }

    impl Evaluator for TableEvaluator {
        fn evaluate(&self, flag_key: &str, context: &Context) -> Value {
            self.values
                .lock()
                .unwrap()
                .get(&(flag_key.to_owned(), context.key().to_owned()))
                .cloned()
                .unwrap_or(Value::Null)
        }
    }

    fn tracker(evaluator: Arc<dyn Evaluator>) -> FlagTracker {
        let dispatcher = Arc::new(TaskDispatcher::start(None).unwrap());
        FlagTracker::new(dispatcher, evaluator)
    }

    fn sink<T: Clone + Send + 'static>() -> (impl Fn(&T) + Send + Sync + 'static, mpsc::Receiver<T>)
    {
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        let listener = move |value: &T| {
            let _ = sender.lock().unwrap().send(value.clone());
        };
        (listener, receiver)
    }

    fn change_sink() -> (FlagChangeListener, mpsc::Receiver<FlagChangeEvent>) {
        let (listener, receiver) = sink::<FlagChangeEvent>();
        (Arc::new(listener), receiver)
    }

    #[test]
    fn sends_flag_change_events_until_listener_removed() {
        let tracker = tracker(Arc::new(NoopEvaluator));
        let (listener1, events1) = change_sink();
        let (listener2, events2) = change_sink();
        tracker.add_flag_change_listener(Arc::clone(&listener1));
        tracker.add_flag_change_listener(Arc::clone(&listener2));

        assert!(events1.recv_timeout(NO_MORE).is_err());

        tracker.notify_flag_changed("flagkey");

        assert_eq!(events1.recv_timeout(WAIT).unwrap().flag_key, "flagkey");
        assert_eq!(events2.recv_timeout(WAIT).unwrap().flag_key, "flagkey");
        assert!(events1.recv_timeout(NO_MORE).is_err());
        assert!(events2.recv_timeout(NO_MORE).is_err());

        tracker.remove_flag_change_listener(&listener1);
        tracker.notify_flag_changed("flagkey");

        assert_eq!(events2.recv_timeout(WAIT).unwrap().flag_key, "flagkey");
        assert!(events1.recv_timeout(NO_MORE).is_err());
        assert!(events2.recv_timeout(NO_MORE).is_err());
    }

    #[test]
    fn notifications_preserve_key_order() {
        let tracker = tracker(Arc::new(NoopEvaluator));
        let (listener, events) = change_sink();
        tracker.add_flag_change_listener(listener);

        for key in ["a", "b", "c"] {
            tracker.notify_flag_changed(key);
        }

        let keys: Vec<_> = (0..3)
            .map(|_| events.recv_timeout(WAIT).unwrap().flag_key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn sends_value_change_only_when_value_changes_for_context() {
        let evaluator = Arc::new(TableEvaluator::default());
        evaluator.set("important-flag", "important-user", json!(false));
        evaluator.set("important-flag", "unimportant-user", json!(false));
        let tracker = tracker(evaluator.clone());

        let (callback1, events1) = sink::<FlagValueChangeEvent>();
        let (callback2, events2) = sink::<FlagValueChangeEvent>();
        let (callback3, events3) = sink::<FlagValueChangeEvent>();
        let user = Context::new("important-user");
        let other_user = Context::new("unimportant-user");

        tracker.add_flag_value_change_listener("important-flag", user.clone(), callback1);
        let listener2 = tracker.add_flag_value_change_listener("important-flag", user, callback2);
        tracker.remove_flag_change_listener(&listener2);
        tracker.add_flag_value_change_listener("important-flag", other_user, callback3);

        evaluator.set("important-flag", "important-user", json!(true));
        tracker.notify_flag_changed("important-flag");

        let event = events1.recv_timeout(WAIT).unwrap();
        assert_eq!(
            event,
            FlagValueChangeEvent {
                flag_key: "important-flag".to_owned(),
                old_value: json!(false),
                new_value: json!(true),
            }
        );
        assert!(events1.recv_timeout(NO_MORE).is_err());
        assert!(events2.recv_timeout(NO_MORE).is_err());
        assert!(events3.recv_timeout(NO_MORE).is_err());
    }

    #[test]
    fn value_change_listener_ignores_other_flags_and_tracks_last_value() {
        let evaluator = Arc::new(TableEvaluator::default());
        evaluator.set("flag", "user", json!("a"));
        let tracker = tracker(evaluator.clone());
        let (callback, events) = sink::<FlagValueChangeEvent>();
        tracker.add_flag_value_change_listener("flag", Context::new("user"), callback);

        evaluator.set("flag", "user", json!("b"));
        tracker.notify_flag_changed("other-flag");
        assert!(events.recv_timeout(NO_MORE).is_err());

        tracker.notify_flag_changed("flag");
        let first = events.recv_timeout(WAIT).unwrap();
        assert_eq!((first.old_value, first.new_value), (json!("a"), json!("b")));

        tracker.notify_flag_changed("flag");
        assert!(events.recv_timeout(NO_MORE).is_err());

        evaluator.set("flag", "user", json!("a"));
        tracker.notify_flag_changed("flag");
        let second = events.recv_timeout(WAIT).unwrap();
        assert_eq!((second.old_value, second.new_value), (json!("b"), json!("a")));
    }

    #[test]
    fn listeners_run_on_dispatch_thread() {
        let tracker = tracker(Arc::new(NoopEvaluator));
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        tracker.add_flag_change_listener(Arc::new(move |_: &FlagChangeEvent| {
            let name = std::thread::current().name().map(ToOwned::to_owned);
            let _ = sender.lock().unwrap().send(name);
        }));

        tracker.notify_flag_changed("flagkey");

        assert_eq!(
            receiver.recv_timeout(WAIT).unwrap().as_deref(),
            Some(TaskDispatcher::THREAD_NAME)
        );
    }
}
