use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::event::FeatureRequestEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CounterKey {
    variation: Option<usize>,
    version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
struct Counter {
    value: serde_json::Value,
    count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct FlagSummary {
    default: serde_json::Value,
    #[serde(serialize_with = "serialize_counters")]
    counters: BTreeMap<CounterKey, Counter>,
}

#[derive(Serialize)]
struct CounterWire<'a> {
    value: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    /// The flag was not found.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    unknown: bool,
    count: u64,
}

fn serialize_counters<S: Serializer>(
    counters: &BTreeMap<CounterKey, Counter>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(counters.iter().map(|(key, counter)| CounterWire {
        value: &counter.value,
        variation: key.variation,
        version: key.version,
        unknown: key.version.is_none(),
        count: counter.count,
    }))
}

/// Evaluation counts per flag, variation and version, accumulated between flushes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "kind", rename = "summary", rename_all = "camelCase")]
pub(crate) struct EventSummary {
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    start_date: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    end_date: Option<DateTime<Utc>>,
    features: BTreeMap<String, FlagSummary>,
}

impl EventSummary {
    pub(crate) fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub(crate) fn add(&mut self, event: &FeatureRequestEvent) {
        let date = event.creation_date;
        self.start_date = Some(self.start_date.map_or(date, |start| start.min(date)));
        self.end_date = Some(self.end_date.map_or(date, |end| end.max(date)));

        let flag = self
            .features
            .entry(event.flag_key.clone())
            .or_insert_with(|| FlagSummary {
                default: event.default.clone(),
                counters: BTreeMap::new(),
            });
        let counter = flag
            .counters
            .entry(CounterKey {
                variation: event.variation,
                version: event.version,
            })
            .or_insert_with(|| Counter {
                value: event.value.clone(),
                count: 0,
            });
        counter.count += 1;
    }
}
