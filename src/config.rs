use std::{sync::Arc, time::Duration};

use crate::{
    data_source::{DataSource, ExternalUpdatesOnly},
    diagnostics::DiagnosticConfiguration,
    events::{EventProcessorConfig, EventSender, HttpConfig},
    flag_tracker::{Evaluator, NoopEvaluator},
    status::DataStoreKind,
    Client, Result,
};

/// Configuration for [`Client`].
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) events_base_url: String,
    pub(crate) capacity: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) context_keys_capacity: usize,
    pub(crate) diagnostic_recording_interval: Duration,
    pub(crate) diagnostic_opt_out: bool,
    pub(crate) send_events: bool,
    pub(crate) http: HttpConfig,
    pub(crate) data_store: DataStoreKind,
    pub(crate) data_source: Box<dyn DataSource>,
    pub(crate) thread_priority: Option<i32>,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) event_sender: Option<Arc<dyn EventSender>>,
}

impl ClientConfig {
    /// Default base URL of the events service.
    pub const DEFAULT_EVENTS_BASE_URL: &'static str = "https://events.flagpulse.dev";

    /// Lowest accepted value for [`ClientConfig::flush_interval`].
    pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

    /// Lowest accepted value for [`ClientConfig::diagnostic_recording_interval`].
    pub const MIN_DIAGNOSTIC_RECORDING_INTERVAL: Duration = Duration::from_secs(60);

    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use flagpulse::ClientConfig;
    /// ClientConfig::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> ClientConfig {
        let sdk_key = sdk_key.into();
        ClientConfig {
            http: HttpConfig::new(sdk_key.clone()),
            sdk_key,
            events_base_url: ClientConfig::DEFAULT_EVENTS_BASE_URL.to_owned(),
            capacity: EventProcessorConfig::DEFAULT_CAPACITY,
            flush_interval: EventProcessorConfig::DEFAULT_FLUSH_INTERVAL,
            context_keys_capacity: EventProcessorConfig::DEFAULT_CONTEXT_KEYS_CAPACITY,
            diagnostic_recording_interval:
                EventProcessorConfig::DEFAULT_DIAGNOSTIC_RECORDING_INTERVAL,
            diagnostic_opt_out: false,
            send_events: true,
            data_store: DataStoreKind::default(),
            data_source: Box::new(ExternalUpdatesOnly),
            thread_priority: None,
            evaluator: Arc::new(NoopEvaluator),
            event_sender: None,
        }
    }

    /// Override base URL of the events service. Clients should use the default setting in most
    /// cases.
    pub fn events_base_url(mut self, events_base_url: impl Into<String>) -> ClientConfig {
        self.events_base_url = events_base_url.into();
        self
    }

    /// Maximum number of events buffered between flushes. Events beyond it are dropped. Zero is
    /// raised to one.
    pub fn capacity(mut self, capacity: usize) -> ClientConfig {
        self.capacity = capacity.max(1);
        self
    }

    /// Interval between automatic flushes. Values below [`ClientConfig::MIN_FLUSH_INTERVAL`] are
    /// raised to it.
    pub fn flush_interval(mut self, flush_interval: Duration) -> ClientConfig {
        self.flush_interval = flush_interval.max(ClientConfig::MIN_FLUSH_INTERVAL);
        self
    }

    /// Number of distinct contexts remembered between flushes to avoid sending duplicate index
    /// events.
    pub fn context_keys_capacity(mut self, context_keys_capacity: usize) -> ClientConfig {
        self.context_keys_capacity = context_keys_capacity;
        self
    }

    /// Interval between periodic diagnostic events. Values below
    /// [`ClientConfig::MIN_DIAGNOSTIC_RECORDING_INTERVAL`] are raised to it.
    pub fn diagnostic_recording_interval(mut self, interval: Duration) -> ClientConfig {
        self.diagnostic_recording_interval =
            interval.max(ClientConfig::MIN_DIAGNOSTIC_RECORDING_INTERVAL);
        self
    }

    /// Disable diagnostic events.
    pub fn diagnostic_opt_out(mut self, opt_out: bool) -> ClientConfig {
        self.diagnostic_opt_out = opt_out;
        self
    }

    /// Set to `false` to disable analytics and diagnostic events entirely.
    pub fn send_events(mut self, send_events: bool) -> ClientConfig {
        self.send_events = send_events;
        self
    }

    /// Add a header sent with every request to the events service.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> ClientConfig {
        self.http.headers.push((name.into(), value.into()));
        self
    }

    /// Timeout for establishing a connection to the events service.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientConfig {
        self.http.connect_timeout = timeout;
        self
    }

    /// Timeout for a single request to the events service.
    pub fn request_timeout(mut self, timeout: Duration) -> ClientConfig {
        self.http.request_timeout = timeout;
        self
    }

    /// Delay before a failed delivery is retried.
    pub fn retry_delay(mut self, delay: Duration) -> ClientConfig {
        self.http.retry_delay = delay;
        self
    }

    /// Kind of data store flags are kept in. Persistent stores have their status monitored.
    pub fn data_store(mut self, data_store: DataStoreKind) -> ClientConfig {
        self.data_store = data_store;
        self
    }

    /// Source of flag configuration updates. Defaults to [`ExternalUpdatesOnly`].
    pub fn data_source(mut self, data_source: impl DataSource + 'static) -> ClientConfig {
        self.data_source = Box::new(data_source);
        self
    }

    /// Priority of the thread that runs listeners.
    ///
    /// Accepted for portability of configurations; it currently has no effect.
    pub fn thread_priority(mut self, priority: i32) -> ClientConfig {
        self.thread_priority = Some(priority);
        self
    }

    /// Evaluator used by [`Client::evaluate`] and by flag value change listeners.
    ///
    /// ```
    /// # use flagpulse::{ClientConfig, Context};
    /// let config = ClientConfig::from_sdk_key("sdk-key").evaluator(|_flag_key: &str, context: &Context| {
    ///     serde_json::Value::Bool(context.key() == "beta-tester")
    /// });
    /// ```
    pub fn evaluator(mut self, evaluator: impl Evaluator + 'static) -> ClientConfig {
        self.evaluator = Arc::new(evaluator);
        self
    }

    #[cfg(test)]
    pub(crate) fn event_sender(mut self, event_sender: Arc<dyn EventSender>) -> ClientConfig {
        self.event_sender = Some(event_sender);
        self
    }

    pub(crate) fn diagnostic_configuration(&self) -> DiagnosticConfiguration {
        DiagnosticConfiguration {
            custom_events_uri: self.events_base_url != ClientConfig::DEFAULT_EVENTS_BASE_URL,
            events_capacity: self.capacity,
            connect_timeout_millis: duration_millis(self.http.connect_timeout),
            request_timeout_millis: duration_millis(self.http.request_timeout),
            events_flush_interval_millis: duration_millis(self.flush_interval),
            context_keys_capacity: self.context_keys_capacity,
            diagnostic_recording_interval_millis: duration_millis(
                self.diagnostic_recording_interval,
            ),
            data_store_type: match self.data_store {
                DataStoreKind::InMemory => "memory",
                DataStoreKind::Persistent => "persistent",
            }
            .to_owned(),
            send_events: self.send_events,
        }
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use flagpulse::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_sdk_key("sdk-key")
    ///     .send_events(false)
    ///     .to_client()
    ///     .unwrap();
    /// client.close().unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ClientConfig;
    use crate::status::DataStoreKind;

    #[test]
    fn diagnostic_interval_is_clamped() {
        let config = ClientConfig::from_sdk_key("sdk-key")
            .diagnostic_recording_interval(Duration::from_secs(1));
        assert_eq!(
            config.diagnostic_recording_interval,
            ClientConfig::MIN_DIAGNOSTIC_RECORDING_INTERVAL
        );

        let config = ClientConfig::from_sdk_key("sdk-key")
            .diagnostic_recording_interval(Duration::from_secs(120));
        assert_eq!(config.diagnostic_recording_interval, Duration::from_secs(120));
    }

    #[test]
    fn flush_interval_and_capacity_are_clamped() {
        let config = ClientConfig::from_sdk_key("sdk-key")
            .flush_interval(Duration::ZERO)
            .capacity(0);
        assert_eq!(config.flush_interval, ClientConfig::MIN_FLUSH_INTERVAL);
        assert_eq!(config.capacity, 1);

        let config = ClientConfig::from_sdk_key("sdk-key")
            .flush_interval(Duration::from_secs(2))
            .capacity(50);
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(config.capacity, 50);
    }

    #[test]
    fn diagnostic_configuration_reflects_settings() {
        let defaults = ClientConfig::from_sdk_key("sdk-key").diagnostic_configuration();
        assert!(!defaults.custom_events_uri);
        assert_eq!(defaults.events_capacity, 10_000);
        assert_eq!(defaults.events_flush_interval_millis, 5_000);
        assert_eq!(defaults.diagnostic_recording_interval_millis, 900_000);
        assert_eq!(defaults.data_store_type, "memory");

        let custom = ClientConfig::from_sdk_key("sdk-key")
            .events_base_url("http://localhost:8080")
            .capacity(100)
            .flush_interval(Duration::from_secs(1))
            .data_store(DataStoreKind::Persistent)
            .diagnostic_configuration();
        assert!(custom.custom_events_uri);
        assert_eq!(custom.events_capacity, 100);
        assert_eq!(custom.events_flush_interval_millis, 1_000);
        assert_eq!(custom.data_store_type, "persistent");
    }
}
