//! Wire format of analytics payloads.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{ser::SerializeMap, Serialize, Serializer};

use super::{
    event::{CustomEvent, FeatureRequestEvent, IdentifyEvent},
    summary::EventSummary,
};
use crate::Context;

/// An event as it is placed in the output buffer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OutputEvent {
    Feature(FeatureRequestEvent),
    Debug(FeatureRequestEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
    Index {
        creation_date: DateTime<Utc>,
        context: Arc<Context>,
    },
}

/// Serialized form of [`OutputEvent`], borrowing from it.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum WireEvent<'a> {
    Feature(FeatureWire<'a>),
    Debug(FeatureWire<'a>),
    Identify(ContextWire<'a>),
    Custom(CustomWire<'a>),
    Index(ContextWire<'a>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FeatureWire<'a> {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    creation_date: DateTime<Utc>,
    key: &'a str,
    value: &'a serde_json::Value,
    default: &'a serde_json::Value,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_context_keys"
    )]
    context_keys: Option<&'a Context>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a Context>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a serde_json::Value>,
}

impl<'a> FeatureWire<'a> {
    /// Debug events carry the full context since no index event is guaranteed.
    fn new(event: &'a FeatureRequestEvent, full_context: bool) -> FeatureWire<'a> {
        let context: &Context = &event.context;
        FeatureWire {
            creation_date: event.creation_date,
            key: &event.flag_key,
            value: &event.value,
            default: &event.default,
            context_keys: (!full_context).then_some(context),
            context: full_context.then_some(context),
            version: event.version,
            variation: event.variation,
            reason: event.reason.as_ref(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextWire<'a> {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    creation_date: DateTime<Utc>,
    context: &'a Context,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CustomWire<'a> {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    creation_date: DateTime<Utc>,
    key: &'a str,
    #[serde(serialize_with = "serialize_context_keys")]
    context_keys: Option<&'a Context>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric_value: Option<f64>,
}

/// `{kind: key}`, used instead of the full context by events that rely on index events.
fn serialize_context_keys<S: Serializer>(
    context: &Option<&Context>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(usize::from(context.is_some())))?;
    if let Some(context) = context {
        map.serialize_entry(context.kind(), context.key())?;
    }
    map.end()
}

impl OutputEvent {
    fn wire(&self) -> WireEvent<'_> {
        match self {
            OutputEvent::Feature(event) => WireEvent::Feature(FeatureWire::new(event, false)),
            OutputEvent::Debug(event) => WireEvent::Debug(FeatureWire::new(event, true)),
            OutputEvent::Identify(event) => WireEvent::Identify(ContextWire {
                creation_date: event.creation_date,
                context: &event.context,
            }),
            OutputEvent::Custom(event) => WireEvent::Custom(CustomWire {
                creation_date: event.creation_date,
                key: &event.key,
                context_keys: Some(&*event.context),
                data: event.data.as_ref(),
                metric_value: event.metric_value,
            }),
            OutputEvent::Index {
                creation_date,
                context,
            } => WireEvent::Index(ContextWire {
                creation_date: *creation_date,
                context,
            }),
        }
    }
}

impl Serialize for OutputEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.wire().serialize(serializer)
    }
}

/// One element of the payload array.
#[derive(Serialize)]
#[serde(untagged)]
enum PayloadItem<'a> {
    Event(&'a OutputEvent),
    Summary(&'a EventSummary),
}

/// A serialized batch, ready to hand to an [`EventSender`](super::EventSender).
#[derive(Debug, Clone)]
pub(crate) struct Payload {
    pub json: String,
    pub event_count: usize,
}

/// Serialize `events` followed by the summary (if not empty) as one JSON array.
pub(crate) fn format_payload(
    events: &[OutputEvent],
    summary: &EventSummary,
) -> serde_json::Result<Payload> {
    let mut items: Vec<PayloadItem> = events.iter().map(PayloadItem::Event).collect();
    if !summary.is_empty() {
        items.push(PayloadItem::Summary(summary));
    }

    Ok(Payload {
        json: serde_json::to_string(&items)?,
        event_count: items.len(),
    })
}
