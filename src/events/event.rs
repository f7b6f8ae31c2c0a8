use std::sync::Arc;

use chrono::{DateTime, Utc};
use derive_more::From;

use crate::Context;

/// An analytics event submitted to the event processor.
#[derive(Debug, Clone, PartialEq, From)]
pub enum Event {
    /// A flag was evaluated.
    FeatureRequest(FeatureRequestEvent),
    /// The application registered or updated a context.
    Identify(IdentifyEvent),
    /// The application recorded a custom event.
    Custom(CustomEvent),
}

impl Event {
    pub(crate) fn context(&self) -> &Arc<Context> {
        match self {
            Event::FeatureRequest(event) => &event.context,
            Event::Identify(event) => &event.context,
            Event::Custom(event) => &event.context,
        }
    }
}

/// The result of one flag evaluation.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct FeatureRequestEvent {
    pub creation_date: DateTime<Utc>,
    pub flag_key: String,
    /// Version of the flag configuration that was evaluated.
    pub version: Option<u64>,
    pub context: Arc<Context>,
    pub value: serde_json::Value,
    /// The default value the caller passed to the evaluation.
    pub default: serde_json::Value,
    /// Index of the variation that was served.
    pub variation: Option<usize>,
    pub reason: Option<serde_json::Value>,
    /// Send the full event rather than only counting it in the summary.
    pub track_events: bool,
    /// Send a debug copy of the event while this time is in the future.
    pub debug_events_until: Option<DateTime<Utc>>,
}

impl FeatureRequestEvent {
    /// Create an untracked event for the current time.
    pub fn new(
        flag_key: impl Into<String>,
        context: impl Into<Arc<Context>>,
        value: serde_json::Value,
    ) -> FeatureRequestEvent {
        FeatureRequestEvent {
            creation_date: Utc::now(),
            flag_key: flag_key.into(),
            version: None,
            context: context.into(),
            value,
            default: serde_json::Value::Null,
            variation: None,
            reason: None,
            track_events: false,
            debug_events_until: None,
        }
    }
}

/// Registers a context and its attributes with the events service.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct IdentifyEvent {
    pub creation_date: DateTime<Utc>,
    pub context: Arc<Context>,
}

impl IdentifyEvent {
    /// Create an event for the current time.
    pub fn new(context: impl Into<Arc<Context>>) -> IdentifyEvent {
        IdentifyEvent {
            creation_date: Utc::now(),
            context: context.into(),
        }
    }
}

/// An application-defined event, optionally carrying data and a metric value.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct CustomEvent {
    pub creation_date: DateTime<Utc>,
    pub key: String,
    pub context: Arc<Context>,
    pub data: Option<serde_json::Value>,
    pub metric_value: Option<f64>,
}

impl CustomEvent {
    /// Create an event without data for the current time.
    pub fn new(key: impl Into<String>, context: impl Into<Arc<Context>>) -> CustomEvent {
        CustomEvent {
            creation_date: Utc::now(),
            key: key.into(),
            context: context.into(),
            data: None,
            metric_value: None,
        }
    }
}
