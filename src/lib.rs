//! Client-side telemetry for feature flag SDKs: analytics events, self-diagnostics and change
//! notifications.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`], created from a [`ClientConfig`]. The client:
//!
//! - buffers analytics events produced by flag evaluations and application calls
//!   ([`Client::evaluate`], [`Client::identify`], [`Client::track`]) and delivers them to the
//!   events service in the background, with periodic [diagnostic](diagnostics) events;
//! - notifies registered listeners when flag configurations change ([`FlagTracker`]) and when the
//!   health of the data source or data store changes ([`DataSourceStatusProvider`],
//!   [`DataStoreStatusProvider`]).
//!
//! Flag rule evaluation and the transport that receives flag updates live outside this crate.
//! They plug in through the [`Evaluator`] and [`DataSource`] traits.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Only constructing and closing the client can
//! fail; event delivery and listener notifications never return errors to the caller. Delivery
//! problems are logged and the affected events are dropped.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, under the `flagpulse` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! A runnable example can be found in the `demos` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod config;
mod context;
mod data_source;
pub mod diagnostics;
mod error;
pub mod events;
mod flag_tracker;
mod listeners;
mod status;
mod task_dispatcher;

pub use client::Client;
pub use config::ClientConfig;
pub use context::Context;
pub use data_source::{DataSource, DataSourceUpdates, DataStoreUpdates, ExternalUpdatesOnly};
pub use error::{Error, Result};
pub use flag_tracker::{
    Evaluator, FlagChangeEvent, FlagChangeListener, FlagTracker, FlagValueChangeEvent,
};
pub use listeners::{Listener, ListenerRegistry};
pub use status::{
    DataSourceState, DataSourceStatus, DataSourceStatusProvider, DataStoreKind, DataStoreStatus,
    DataStoreStatusProvider, ErrorInfo, ErrorKind,
};
