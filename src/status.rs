//! Status of the subsystems the client depends on: the data source that keeps flag data fresh and
//! the data store that holds it.
//!
//! Both are built on [`StatusTracker`], which holds the latest immutable status value and notifies
//! listeners whenever it is replaced.
use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    listeners::{Broadcaster, Listener},
    task_dispatcher::TaskDispatcher,
};

/// Holds the latest status of a monitored subsystem.
///
/// Status values are immutable and replaced as a whole; readers get a copy of the latest value and
/// never wait for listeners.
pub(crate) struct StatusTracker<S> {
    current: Mutex<Arc<S>>,
    changed: Condvar,
    broadcaster: Broadcaster<S>,
}

impl<S: Clone + Send + Sync + 'static> StatusTracker<S> {
    pub(crate) fn new(initial: S, dispatcher: Arc<TaskDispatcher>) -> StatusTracker<S> {
        StatusTracker {
            current: Mutex::new(Arc::new(initial)),
            changed: Condvar::new(),
            broadcaster: Broadcaster::new(dispatcher),
        }
    }

    pub(crate) fn get(&self) -> S {
        let current = self
            .current
            .lock()
            .expect("thread holding status lock should not panic");
        S::clone(&**current)
    }

    /// Replace the status with the result of `f` and notify listeners, even if the value did not
    /// change.
    pub(crate) fn update(&self, f: impl FnOnce(&S) -> S) -> S {
        let mut current = self
            .current
            .lock()
            .expect("thread holding status lock should not panic");

        let new_status = f(&**current);
        *current = Arc::new(new_status.clone());
        self.changed.notify_all();
        // Broadcasting under the lock keeps notifications in the same order as updates.
        self.broadcaster.broadcast(new_status.clone());

        new_status
    }

    /// Block until `done` returns `true` for the current status or `timeout` elapses. Returns the
    /// last observed status.
    pub(crate) fn wait_until(&self, timeout: Option<Duration>, done: impl Fn(&S) -> bool) -> S {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut current = self
            .current
            .lock()
            .expect("thread holding status lock should not panic");

        loop {
            if done(&**current) {
                return S::clone(&**current);
            }

            match deadline {
                None => {
                    current = self
                        .changed
                        .wait(current)
                        .expect("thread holding status lock should not panic");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return S::clone(&**current);
                    }
                    current = self
                        .changed
                        .wait_timeout(current, deadline - now)
                        .expect("thread holding status lock should not panic")
                        .0;
                }
            }
        }
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn Listener<S>>) {
        self.broadcaster.add(listener);
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn Listener<S>>) {
        self.broadcaster.remove(listener);
    }
}

/// State of the data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceState {
    /// The data source has not received its first full data set yet.
    Initializing,
    /// The data source is receiving updates.
    Valid,
    /// The data source hit a problem it expects to recover from; flag data may be stale.
    Interrupted,
    /// The data source was shut down or hit an error it will not recover from.
    Off,
}

/// Category of a data source error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// An unexpected error, such as an uncaught panic.
    Unknown,
    /// An I/O error such as a dropped connection.
    NetworkError,
    /// The service returned an HTTP error status.
    ErrorResponse,
    /// The service returned data that could not be parsed.
    InvalidData,
    /// The data source could not write to the data store.
    StoreError,
}

/// Details of the last data source error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Error category.
    pub kind: ErrorKind,
    /// HTTP status code, for [`ErrorKind::ErrorResponse`].
    pub status_code: Option<u16>,
    /// Human-readable description.
    pub message: Option<String>,
    /// When the error happened.
    pub time: DateTime<Utc>,
}

impl ErrorInfo {
    /// An error of the given kind, timestamped now.
    pub fn new(kind: ErrorKind, message: Option<String>) -> ErrorInfo {
        ErrorInfo {
            kind,
            status_code: None,
            message,
            time: Utc::now(),
        }
    }

    /// An [`ErrorKind::ErrorResponse`] error for `status_code`, timestamped now.
    pub fn from_http_status(status_code: u16) -> ErrorInfo {
        ErrorInfo {
            kind: ErrorKind::ErrorResponse,
            status_code: Some(status_code),
            message: None,
            time: Utc::now(),
        }
    }
}

/// Data source status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceStatus {
    /// Current state.
    pub state: DataSourceState,
    /// When `state` last changed. Updates that keep the same state do not move it.
    pub state_since: DateTime<Utc>,
    /// The most recent error, if any. It is kept after the data source recovers.
    pub last_error: Option<ErrorInfo>,
}

/// Access to the data source status, for the host application.
pub struct DataSourceStatusProvider {
    tracker: StatusTracker<DataSourceStatus>,
}

impl DataSourceStatusProvider {
    pub(crate) fn new(dispatcher: Arc<TaskDispatcher>) -> DataSourceStatusProvider {
        let initial = DataSourceStatus {
            state: DataSourceState::Initializing,
            state_since: Utc::now(),
            last_error: None,
        };
        DataSourceStatusProvider {
            tracker: StatusTracker::new(initial, dispatcher),
        }
    }

    /// Latest data source status.
    pub fn get_status(&self) -> DataSourceStatus {
        self.tracker.get()
    }

    /// Register a listener for status changes. It is called on the dispatch thread.
    pub fn add_status_listener(&self, listener: Arc<dyn Listener<DataSourceStatus>>) {
        self.tracker.add_listener(listener);
    }

    /// Unregister a listener previously passed to [`DataSourceStatusProvider::add_status_listener`].
    pub fn remove_status_listener(&self, listener: &Arc<dyn Listener<DataSourceStatus>>) {
        self.tracker.remove_listener(listener);
    }

    /// Block until the data source reaches `desired_state`.
    ///
    /// Returns `true` once the state is reached. Returns `false` if `timeout` elapses first or if
    /// the data source is turned [`DataSourceState::Off`] (unless that is the desired state).
    /// `None` waits indefinitely.
    pub fn wait_for(&self, desired_state: DataSourceState, timeout: Option<Duration>) -> bool {
        let status = self.tracker.wait_until(timeout, |status| {
            status.state == desired_state || status.state == DataSourceState::Off
        });
        status.state == desired_state
    }

    pub(crate) fn update_status(
        &self,
        new_state: DataSourceState,
        new_error: Option<ErrorInfo>,
    ) -> DataSourceStatus {
        self.tracker.update(|old| {
            // Retrying after an interruption is still an interruption from the application's
            // point of view.
            let state = if new_state == DataSourceState::Initializing
                && old.state == DataSourceState::Interrupted
            {
                DataSourceState::Interrupted
            } else {
                new_state
            };

            DataSourceStatus {
                state,
                state_since: if state == old.state {
                    old.state_since
                } else {
                    Utc::now()
                },
                last_error: new_error.or_else(|| old.last_error.clone()),
            }
        })
    }
}

/// The kind of data store the client uses. Determines whether store status is monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DataStoreKind {
    /// In-memory store. Always available, so its status is not monitored.
    #[default]
    InMemory,
    /// Persistent store backed by an external database.
    Persistent,
}

/// Data store status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreStatus {
    /// `false` if the store is known to be unreachable.
    pub available: bool,
    /// `true` if the store may have lost data while unavailable and needs to be repopulated.
    pub refresh_needed: bool,
}

impl DataStoreStatus {
    /// Status of a store that is working normally.
    pub const AVAILABLE: DataStoreStatus = DataStoreStatus {
        available: true,
        refresh_needed: false,
    };
}

/// Access to the data store status, for the host application.
pub struct DataStoreStatusProvider {
    tracker: StatusTracker<DataStoreStatus>,
    monitoring_enabled: bool,
}

impl DataStoreStatusProvider {
    pub(crate) fn new(kind: DataStoreKind, dispatcher: Arc<TaskDispatcher>) -> Self {
        DataStoreStatusProvider {
            tracker: StatusTracker::new(DataStoreStatus::AVAILABLE, dispatcher),
            monitoring_enabled: kind == DataStoreKind::Persistent,
        }
    }

    /// Latest data store status. Always [`DataStoreStatus::AVAILABLE`] when monitoring is
    /// disabled.
    pub fn get_status(&self) -> DataStoreStatus {
        if !self.monitoring_enabled {
            return DataStoreStatus::AVAILABLE;
        }
        self.tracker.get()
    }

    /// Returns `true` if the data store reports status changes. In-memory stores do not.
    pub fn is_status_monitoring_enabled(&self) -> bool {
        self.monitoring_enabled
    }

    /// Register a listener for status changes. It is called on the dispatch thread.
    pub fn add_status_listener(&self, listener: Arc<dyn Listener<DataStoreStatus>>) {
        self.tracker.add_listener(listener);
    }

    /// Unregister a listener previously passed to [`DataStoreStatusProvider::add_status_listener`].
    pub fn remove_status_listener(&self, listener: &Arc<dyn Listener<DataStoreStatus>>) {
        self.tracker.remove_listener(listener);
    }

    pub(crate) fn update_status(&self, new_status: DataStoreStatus) {
        if !self.monitoring_enabled {
            log::debug!(target: "flagpulse", "ignoring data store status update, monitoring is disabled");
            return;
        }
        self.tracker.update(|_| new_status);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc},
        time::Duration,
    };

    use chrono::Utc;

    use super::*;
    use crate::task_dispatcher::TaskDispatcher;

    fn dispatcher() -> Arc<TaskDispatcher> {
        Arc::new(TaskDispatcher::start(None).unwrap())
    }

    #[test]
    fn data_source_starts_initializing() {
        let before = Utc::now();
        let provider = DataSourceStatusProvider::new(dispatcher());

        let status = provider.get_status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert!(status.state_since >= before);
        assert_eq!(status.last_error, None);
    }

    #[test]
    fn state_since_changes_only_with_state() {
        let provider = DataSourceStatusProvider::new(dispatcher());
        let valid = provider.update_status(DataSourceState::Valid, None);

        std::thread::sleep(Duration::from_millis(5));
        let error = ErrorInfo::new(ErrorKind::NetworkError, Some("reset".to_owned()));
        let still_valid = provider.update_status(DataSourceState::Valid, Some(error.clone()));

        assert_eq!(still_valid.state_since, valid.state_since);
        assert_eq!(still_valid.last_error, Some(error));
    }

    #[test]
    fn off_with_error_is_reflected() {
        let provider = DataSourceStatusProvider::new(dispatcher());
        provider.update_status(DataSourceState::Valid, None);

        let error = ErrorInfo::from_http_status(401);
        provider.update_status(DataSourceState::Off, Some(error.clone()));

        let status = provider.get_status();
        assert_eq!(status.state, DataSourceState::Off);
        assert!(status.state_since >= error.time);
        assert_eq!(status.last_error, Some(error));
    }

    #[test]
    fn initializing_after_interrupted_stays_interrupted() {
        let provider = DataSourceStatusProvider::new(dispatcher());
        provider.update_status(DataSourceState::Valid, None);
        let interrupted = provider.update_status(DataSourceState::Interrupted, None);

        let status = provider.update_status(DataSourceState::Initializing, None);

        assert_eq!(status.state, DataSourceState::Interrupted);
        assert_eq!(status.state_since, interrupted.state_since);
    }

    #[test]
    fn data_source_listeners_receive_updates() {
        let provider = DataSourceStatusProvider::new(dispatcher());
        let (sender, receiver) = mpsc::channel();
        let sender = std::sync::Mutex::new(sender);
        provider.add_status_listener(Arc::new(move |status: &DataSourceStatus| {
            sender.lock().unwrap().send(status.clone()).unwrap();
        }));

        let error = ErrorInfo::from_http_status(401);
        provider.update_status(DataSourceState::Off, Some(error.clone()));

        let status = receiver.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(status.state, DataSourceState::Off);
        assert_eq!(status.last_error, Some(error));
    }

    #[test]
    fn wait_for_returns_when_state_reached() {
        let provider = Arc::new(DataSourceStatusProvider::new(dispatcher()));
        {
            let provider = Arc::clone(&provider);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                provider.update_status(DataSourceState::Valid, None);
            });
        }

        assert!(provider.wait_for(DataSourceState::Valid, Some(Duration::from_secs(2))));
    }

    #[test]
    fn wait_for_gives_up_on_off_or_timeout() {
        let provider = DataSourceStatusProvider::new(dispatcher());
        assert!(!provider.wait_for(DataSourceState::Valid, Some(Duration::from_millis(20))));

        provider.update_status(DataSourceState::Off, None);
        assert!(!provider.wait_for(DataSourceState::Valid, None));
        assert!(provider.wait_for(DataSourceState::Off, None));
    }

    #[test]
    fn in_memory_store_is_not_monitored() {
        let provider = DataStoreStatusProvider::new(DataStoreKind::InMemory, dispatcher());

        provider.update_status(DataStoreStatus {
            available: false,
            refresh_needed: true,
        });

        assert!(!provider.is_status_monitoring_enabled());
        assert_eq!(provider.get_status(), DataStoreStatus::AVAILABLE);
    }

    #[test]
    fn persistent_store_status_updates_and_notifies() {
        let provider = DataStoreStatusProvider::new(DataStoreKind::Persistent, dispatcher());
        let (sender, receiver) = mpsc::channel();
        let sender = std::sync::Mutex::new(sender);
        provider.add_status_listener(Arc::new(move |status: &DataStoreStatus| {
            sender.lock().unwrap().send(*status).unwrap();
        }));

        let unavailable = DataStoreStatus {
            available: false,
            refresh_needed: false,
        };
        assert!(provider.is_status_monitoring_enabled());
        assert_eq!(provider.get_status(), DataStoreStatus::AVAILABLE);

        provider.update_status(unavailable);
        provider.update_status(unavailable);

        assert_eq!(provider.get_status(), unavailable);
        // Identical updates are still delivered.
        assert_eq!(receiver.recv_timeout(Duration::from_secs(1)).unwrap(), unavailable);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(1)).unwrap(), unavailable);
    }
}
