use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use url::Url;

use crate::{
    data_source::{DataSource, DataSourceUpdates, DataStoreUpdates},
    diagnostics::{DiagnosticAccumulator, DiagnosticId},
    events::{
        CustomEvent, Event, EventProcessor, EventProcessorConfig, EventSender, FeatureRequestEvent,
        HttpEventSender, IdentifyEvent,
    },
    flag_tracker::{Evaluator, FlagTracker},
    status::{DataSourceStatusProvider, DataStoreStatusProvider},
    task_dispatcher::TaskDispatcher,
    ClientConfig, Context, Result,
};

/// The client-side half of a feature flag SDK: sends analytics events and tells the application
/// when flags or the health of their data change.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```
/// # use flagpulse::{Client, ClientConfig, Context};
/// let client = Client::new(ClientConfig::from_sdk_key("sdk-key").send_events(false)).unwrap();
/// client.identify(Context::new("user-key"));
/// client.close().unwrap();
/// ```
pub struct Client {
    dispatcher: Arc<TaskDispatcher>,
    evaluator: Arc<dyn Evaluator>,
    flag_tracker: Arc<FlagTracker>,
    data_source_status: Arc<DataSourceStatusProvider>,
    data_store_status: Arc<DataStoreStatusProvider>,
    data_source: Box<dyn DataSource>,
    /// `None` if sending events is disabled.
    event_processor: Option<EventProcessor>,
    closed: AtomicBool,
}

impl Client {
    /// Create a new `Client` using the specified configuration, and start its data source.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if the events base URL cannot be
    ///   parsed.
    /// - [`Error::InvalidHeader`](crate::Error::InvalidHeader) if the SDK key or a configured
    ///   header is not a valid header value.
    /// - [`Error::Io`](crate::Error::Io) if a background thread cannot be started.
    pub fn new(config: ClientConfig) -> Result<Client> {
        let dispatcher = Arc::new(TaskDispatcher::start(config.thread_priority)?);

        let flag_tracker = Arc::new(FlagTracker::new(
            Arc::clone(&dispatcher),
            Arc::clone(&config.evaluator),
        ));
        let data_source_status = Arc::new(DataSourceStatusProvider::new(Arc::clone(&dispatcher)));
        let data_store_status = Arc::new(DataStoreStatusProvider::new(
            config.data_store,
            Arc::clone(&dispatcher),
        ));

        let event_processor = if config.send_events {
            Some(start_event_processor(&config)?)
        } else {
            log::debug!(target: "flagpulse", "sending events is disabled");
            None
        };

        let ClientConfig {
            evaluator,
            data_source,
            ..
        } = config;

        let client = Client {
            dispatcher,
            evaluator,
            flag_tracker,
            data_source_status,
            data_store_status,
            data_source,
            event_processor,
            closed: AtomicBool::new(false),
        };

        client.data_source.start(client.data_source_updates())?;

        Ok(client)
    }

    /// Register listeners for flag configuration and value changes.
    pub fn flag_tracker(&self) -> &FlagTracker {
        &self.flag_tracker
    }

    /// Status of the data source, and listeners for its changes.
    pub fn data_source_status_provider(&self) -> &DataSourceStatusProvider {
        &self.data_source_status
    }

    /// Status of the data store, and listeners for its changes.
    pub fn data_store_status_provider(&self) -> &DataStoreStatusProvider {
        &self.data_store_status
    }

    /// Handle through which a data source reports status and flag changes.
    pub fn data_source_updates(&self) -> DataSourceUpdates {
        DataSourceUpdates::new(
            Arc::clone(&self.data_source_status),
            Arc::clone(&self.flag_tracker),
        )
    }

    /// Handle through which a data store reports its status.
    pub fn data_store_updates(&self) -> DataStoreUpdates {
        DataStoreUpdates::new(Arc::clone(&self.data_store_status))
    }

    /// Evaluate `flag_key` for `context` with the configured evaluator and record the evaluation.
    ///
    /// Returns `default` if the evaluator produces no value (`null`).
    pub fn evaluate(
        &self,
        flag_key: &str,
        context: &Context,
        default: serde_json::Value,
    ) -> serde_json::Value {
        let value = match self.evaluator.evaluate(flag_key, context) {
            serde_json::Value::Null => default.clone(),
            value => value,
        };

        log::trace!(target: "flagpulse",
                    flag_key,
                    context_key = context.key(),
                    value:serde = value;
                    "evaluated a flag");

        self.send_event(FeatureRequestEvent {
            default,
            ..FeatureRequestEvent::new(flag_key, context.clone(), value.clone())
        });

        value
    }

    /// Submit an analytics event. Never blocks; the event is dropped if the queue is full.
    pub fn send_event(&self, event: impl Into<Event>) {
        if let Some(event_processor) = &self.event_processor {
            event_processor.send_event(event);
        }
    }

    /// Report `context` to the events service, making its attributes available in analytics.
    pub fn identify(&self, context: Context) {
        self.send_event(IdentifyEvent::new(context));
    }

    /// Record a custom event for `context`, with optional data and a numeric metric value.
    pub fn track(
        &self,
        event_key: impl Into<String>,
        context: Context,
        data: Option<serde_json::Value>,
        metric_value: Option<f64>,
    ) {
        self.send_event(CustomEvent {
            data,
            metric_value,
            ..CustomEvent::new(event_key, context)
        });
    }

    /// Ask for buffered events to be delivered now. Returns immediately.
    pub fn flush(&self) {
        if let Some(event_processor) = &self.event_processor {
            event_processor.flush();
        }
    }

    /// Stop the data source, deliver pending events and stop background threads.
    ///
    /// Blocks for at most [`EventProcessor::CLOSE_TIMEOUT`] waiting for event delivery. Calling it
    /// again does nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!(target: "flagpulse", "closing client");

        let data_source_result = self.data_source.close();
        let events_result = match &self.event_processor {
            Some(event_processor) => event_processor.close(),
            None => Ok(()),
        };
        let dispatcher_result = self.dispatcher.shutdown();

        data_source_result.and(events_result).and(dispatcher_result)
    }
}

fn start_event_processor(config: &ClientConfig) -> Result<EventProcessor> {
    let base_uri = Url::parse(&config.events_base_url)?;

    let sender: Arc<dyn EventSender> = match &config.event_sender {
        Some(sender) => Arc::clone(sender),
        None => Arc::new(HttpEventSender::new(&config.http)?),
    };

    let diagnostics = (!config.diagnostic_opt_out).then(|| {
        Arc::new(DiagnosticAccumulator::new(
            DiagnosticId::new(&config.sdk_key),
            config.diagnostic_configuration(),
        ))
    });

    EventProcessor::start(
        EventProcessorConfig {
            base_uri,
            capacity: config.capacity,
            flush_interval: config.flush_interval,
            context_keys_capacity: config.context_keys_capacity,
            diagnostic_recording_interval: config.diagnostic_recording_interval,
        },
        sender,
        diagnostics,
    )
}
