//! Interfaces through which the flag update transport and the data store report to the client.
use std::sync::Arc;

use crate::{
    status::{
        DataSourceState, DataSourceStatus, DataSourceStatusProvider, DataStoreStatus,
        DataStoreStatusProvider, ErrorInfo,
    },
    FlagTracker, Result,
};

/// A source of flag configuration updates, such as a streaming or polling connection.
///
/// The client calls `start` once during construction and `close` once when it is closed. The source
/// reports its progress through the provided [`DataSourceUpdates`].
pub trait DataSource: Send + Sync {
    /// Begin receiving updates. Should not block waiting for the first update.
    fn start(&self, updates: DataSourceUpdates) -> Result<()>;

    /// Stop receiving updates.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A data source for applications that feed flag changes in themselves through
/// [`DataSourceUpdates`]. Considers itself valid as soon as it starts.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalUpdatesOnly;

impl DataSource for ExternalUpdatesOnly {
    fn start(&self, updates: DataSourceUpdates) -> Result<()> {
        updates.update_status(DataSourceState::Valid, None);
        Ok(())
    }
}

/// Handle for a data source to report its status and the flags that changed.
#[derive(Clone)]
pub struct DataSourceUpdates {
    status: Arc<DataSourceStatusProvider>,
    flag_tracker: Arc<FlagTracker>,
}

impl DataSourceUpdates {
    pub(crate) fn new(
        status: Arc<DataSourceStatusProvider>,
        flag_tracker: Arc<FlagTracker>,
    ) -> DataSourceUpdates {
        DataSourceUpdates {
            status,
            flag_tracker,
        }
    }

    /// Report the data source's state, and optionally the error that caused it.
    ///
    /// Reporting `Initializing` while `Interrupted` leaves the state `Interrupted`. The previous
    /// error is kept when `error` is `None`.
    pub fn update_status(
        &self,
        state: DataSourceState,
        error: Option<ErrorInfo>,
    ) -> DataSourceStatus {
        let status = self.status.update_status(state, error);
        log::debug!(target: "flagpulse",
                    state:serde = status.state;
                    "data source status updated");
        status
    }

    /// Report that the configuration of each of `flag_keys` changed. Flag change listeners are
    /// notified once per key, in order.
    pub fn flags_changed<I>(&self, flag_keys: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        if !self.flag_tracker.has_listeners() {
            return;
        }
        for flag_key in flag_keys {
            self.flag_tracker.notify_flag_changed(flag_key);
        }
    }
}

/// Handle for a persistent data store to report its availability.
#[derive(Clone)]
pub struct DataStoreUpdates {
    status: Arc<DataStoreStatusProvider>,
}

impl DataStoreUpdates {
    pub(crate) fn new(status: Arc<DataStoreStatusProvider>) -> DataStoreUpdates {
        DataStoreUpdates { status }
    }

    /// Report the store's status. Ignored if the store's status is not monitored.
    pub fn update_status(&self, status: DataStoreStatus) {
        self.status.update_status(status);
    }
}
