//! Self-diagnostic events describing the SDK's configuration and event pipeline health.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Identifies one SDK instance across all of its diagnostic events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticId {
    /// Random id generated at startup.
    pub diagnostic_id: String,
    /// Last 6 characters of the SDK key.
    pub sdk_key_suffix: String,
}

impl DiagnosticId {
    /// Generate a new id for an SDK instance configured with `sdk_key`.
    pub fn new(sdk_key: &str) -> DiagnosticId {
        let suffix_start = sdk_key
            .char_indices()
            .rev()
            .nth(5)
            .map_or(0, |(index, _)| index);

        DiagnosticId {
            diagnostic_id: Uuid::new_v4().to_string(),
            sdk_key_suffix: sdk_key[suffix_start..].to_owned(),
        }
    }
}

/// Summary of the SDK configuration reported once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct DiagnosticConfiguration {
    /// The events base URL differs from the default.
    pub custom_events_uri: bool,
    pub events_capacity: usize,
    pub connect_timeout_millis: u64,
    pub request_timeout_millis: u64,
    pub events_flush_interval_millis: u64,
    pub context_keys_capacity: usize,
    pub diagnostic_recording_interval_millis: u64,
    /// `"memory"` or `"persistent"`.
    pub data_store_type: String,
    pub send_events: bool,
}

/// Name and version of this SDK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct SdkInfo {
    pub name: &'static str,
    pub version: &'static str,
}

/// The platform the SDK runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct PlatformInfo {
    pub name: &'static str,
    pub os_name: &'static str,
    pub os_arch: &'static str,
}

/// Sent once, when the event processor starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct InitEvent {
    pub id: DiagnosticId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub creation_date: DateTime<Utc>,
    pub sdk: SdkInfo,
    pub platform: PlatformInfo,
    pub configuration: DiagnosticConfiguration,
}

/// Sent periodically with counters accumulated since the previous one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsEvent {
    /// Identifies the SDK instance.
    pub id: DiagnosticId,
    /// Start of the period covered by this event.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub data_since_date: DateTime<Utc>,
    /// End of the period covered by this event.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub creation_date: DateTime<Utc>,
    /// Events dropped because a queue was full.
    pub dropped_events: u64,
    /// Events whose context had already been indexed since the last flush.
    pub deduplicated_users: u64,
    /// Number of events (excluding the summary) in the most recent flushed batch.
    pub events_in_last_batch: u64,
}

/// A diagnostic event, serialized with its `kind`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum DiagnosticEvent {
    /// Kind `diagnostic-init`.
    #[serde(rename = "diagnostic-init")]
    Init(InitEvent),
    /// Kind `diagnostic`.
    #[serde(rename = "diagnostic")]
    Statistics(StatisticsEvent),
}

/// Counters feeding the periodic [`StatisticsEvent`].
///
/// Counters are updated from the event processor's consumer thread and read (and reset) when a
/// statistics event is created, possibly from another thread.
#[derive(Debug)]
pub struct DiagnosticAccumulator {
    id: DiagnosticId,
    configuration: DiagnosticConfiguration,
    data_since: Mutex<DateTime<Utc>>,
    dropped_events: AtomicU64,
    deduplicated_users: AtomicU64,
    events_in_last_batch: AtomicU64,
}

impl DiagnosticAccumulator {
    /// Start accumulating. The first statistics event covers the time since this call.
    pub fn new(id: DiagnosticId, configuration: DiagnosticConfiguration) -> DiagnosticAccumulator {
        DiagnosticAccumulator {
            id,
            configuration,
            data_since: Mutex::new(Utc::now()),
            dropped_events: AtomicU64::new(0),
            deduplicated_users: AtomicU64::new(0),
            events_in_last_batch: AtomicU64::new(0),
        }
    }

    /// Id included in every event.
    pub fn id(&self) -> &DiagnosticId {
        &self.id
    }

    pub(crate) fn data_since(&self) -> DateTime<Utc> {
        *self
            .data_since
            .lock()
            .expect("thread holding diagnostics lock should not panic")
    }

    pub(crate) fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deduplicated_user(&self) {
        self.deduplicated_users.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_events_in_batch(&self, count: usize) {
        self.events_in_last_batch
            .store(count as u64, Ordering::Relaxed);
    }

    /// Describe this SDK instance.
    pub fn create_init_event(&self) -> DiagnosticEvent {
        DiagnosticEvent::Init(InitEvent {
            id: self.id.clone(),
            creation_date: self.data_since(),
            sdk: SdkInfo {
                name: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
            },
            platform: PlatformInfo {
                name: "Rust",
                os_name: std::env::consts::OS,
                os_arch: std::env::consts::ARCH,
            },
            configuration: self.configuration.clone(),
        })
    }

    /// Take the counters accumulated since the previous call and start a new period.
    pub fn create_event_and_reset(&self) -> DiagnosticEvent {
        let mut data_since = self
            .data_since
            .lock()
            .expect("thread holding diagnostics lock should not panic");
        let now = Utc::now();

        let event = StatisticsEvent {
            id: self.id.clone(),
            data_since_date: *data_since,
            creation_date: now,
            dropped_events: self.dropped_events.swap(0, Ordering::Relaxed),
            deduplicated_users: self.deduplicated_users.swap(0, Ordering::Relaxed),
            events_in_last_batch: self.events_in_last_batch.swap(0, Ordering::Relaxed),
        };
        *data_since = now;

        DiagnosticEvent::Statistics(event)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn accumulator() -> DiagnosticAccumulator {
        DiagnosticAccumulator::new(
            DiagnosticId::new("sdk-key-abcdef"),
            DiagnosticConfiguration::default(),
        )
    }

    #[test]
    fn id_keeps_last_six_characters_of_sdk_key() {
        assert_eq!(DiagnosticId::new("sdk-key-abcdef").sdk_key_suffix, "abcdef");
        assert_eq!(DiagnosticId::new("key").sdk_key_suffix, "key");
        assert_eq!(DiagnosticId::new("xxxxxéèàùöü").sdk_key_suffix, "éèàùöü");
        assert!(Uuid::parse_str(&DiagnosticId::new("key").diagnostic_id).is_ok());
    }

    #[test]
    fn init_event_describes_sdk_and_platform() {
        let json = serde_json::to_value(accumulator().create_init_event()).unwrap();

        assert_eq!(json["kind"], "diagnostic-init");
        assert_eq!(json["id"]["sdkKeySuffix"], "abcdef");
        assert_eq!(json["sdk"]["name"], "flagpulse");
        assert_eq!(json["platform"]["name"], "Rust");
        assert_eq!(json["platform"]["osName"], std::env::consts::OS);
        assert!(json["creationDate"].is_i64());
        assert!(json["configuration"].is_object());
    }

    #[test]
    fn statistics_event_resets_counters() {
        let accumulator = accumulator();
        let started = accumulator.data_since();
        accumulator.record_dropped_event();
        accumulator.record_deduplicated_user();
        accumulator.record_deduplicated_user();
        accumulator.record_events_in_batch(3);

        let DiagnosticEvent::Statistics(first) = accumulator.create_event_and_reset() else {
            panic!("expected statistics event");
        };
        assert_eq!(first.data_since_date, started);
        assert_eq!(first.creation_date, accumulator.data_since());
        assert_eq!(first.dropped_events, 1);
        assert_eq!(first.deduplicated_users, 2);
        assert_eq!(first.events_in_last_batch, 3);

        let DiagnosticEvent::Statistics(second) = accumulator.create_event_and_reset() else {
            panic!("expected statistics event");
        };
        assert_eq!(second.data_since_date, first.creation_date);
        assert_eq!(second.dropped_events, 0);
        assert_eq!(second.deduplicated_users, 0);
        assert_eq!(second.events_in_last_batch, 0);
    }

    #[test]
    fn statistics_event_serialization() {
        let event = accumulator().create_event_and_reset();
        let json = serde_json::to_value(&event).unwrap();

        let DiagnosticEvent::Statistics(stats) = event else {
            panic!("expected statistics event");
        };
        assert_eq!(
            json,
            json!({
                "kind": "diagnostic",
                "id": {
                    "diagnosticId": stats.id.diagnostic_id,
                    "sdkKeySuffix": "abcdef",
                },
                "dataSinceDate": stats.data_since_date.timestamp_millis(),
                "creationDate": stats.creation_date.timestamp_millis(),
                "droppedEvents": 0,
                "deduplicatedUsers": 0,
                "eventsInLastBatch": 0,
            })
        );
    }
}
