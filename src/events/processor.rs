//! The event processor: a bounded ingestion queue drained by a single consumer thread, which
//! summarizes and buffers events and hands batches to a pool of flush workers.
use std::{
    collections::{HashSet, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use url::Url;

use super::{
    event::Event,
    output::{format_payload, OutputEvent, Payload},
    sender::{EventDataKind, EventSender, SendResult},
    summary::EventSummary,
};
use crate::{
    diagnostics::{DiagnosticAccumulator, DiagnosticEvent},
    listeners::panic_message,
    Context, Error, Result,
};

/// Configuration for [`EventProcessor`].
#[derive(Debug, Clone)]
pub struct EventProcessorConfig {
    /// Base URI of the events service.
    pub base_uri: Url,
    /// Maximum number of events held in the inbox, and in the output buffer. Zero is treated as
    /// one.
    ///
    /// Defaults to [`EventProcessorConfig::DEFAULT_CAPACITY`].
    pub capacity: usize,
    /// Interval between automatic flushes. Raised to 10 ms if lower.
    ///
    /// Defaults to [`EventProcessorConfig::DEFAULT_FLUSH_INTERVAL`].
    pub flush_interval: Duration,
    /// Number of distinct contexts remembered between flushes for index event deduplication.
    ///
    /// Defaults to [`EventProcessorConfig::DEFAULT_CONTEXT_KEYS_CAPACITY`].
    pub context_keys_capacity: usize,
    /// Interval between periodic diagnostic events. Raised to 10 ms if lower; the 60 s minimum
    /// is applied by [`ClientConfig`](crate::ClientConfig).
    ///
    /// Defaults to [`EventProcessorConfig::DEFAULT_DIAGNOSTIC_RECORDING_INTERVAL`].
    pub diagnostic_recording_interval: Duration,
}

impl EventProcessorConfig {
    /// Default value for [`EventProcessorConfig::capacity`].
    pub const DEFAULT_CAPACITY: usize = 10_000;
    /// Default value for [`EventProcessorConfig::flush_interval`].
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
    /// Default value for [`EventProcessorConfig::context_keys_capacity`].
    pub const DEFAULT_CONTEXT_KEYS_CAPACITY: usize = 1000;
    /// Default value for [`EventProcessorConfig::diagnostic_recording_interval`].
    pub const DEFAULT_DIAGNOSTIC_RECORDING_INTERVAL: Duration = Duration::from_secs(15 * 60);

    /// Create a new `EventProcessorConfig` using default settings.
    pub fn new(base_uri: Url) -> EventProcessorConfig {
        EventProcessorConfig {
            base_uri,
            capacity: EventProcessorConfig::DEFAULT_CAPACITY,
            flush_interval: EventProcessorConfig::DEFAULT_FLUSH_INTERVAL,
            context_keys_capacity: EventProcessorConfig::DEFAULT_CONTEXT_KEYS_CAPACITY,
            diagnostic_recording_interval:
                EventProcessorConfig::DEFAULT_DIAGNOSTIC_RECORDING_INTERVAL,
        }
    }
}

const FLUSH_WORKERS: usize = 5;

/// Lower bound for the flush and diagnostic timers. A zero interval would make the consumer spin.
const MIN_TIMER_INTERVAL: Duration = Duration::from_millis(10);

const CONSUMER_THREAD_NAME: &str = "flagpulse-events";
const DIAGNOSTICS_THREAD_NAME: &str = "flagpulse-diagnostics";

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const CLOSED: u8 = 2;

enum Message {
    Event(Event),
    Flush,
    Diagnostic,
    Shutdown {
        deadline: Instant,
        reply: mpsc::SyncSender<()>,
    },
}

/// Counts deliveries that have been handed off but not completed.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    changed: Condvar,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        self.count
            .lock()
            .expect("thread holding in-flight lock should not panic")
    }

    /// Reserve a slot if fewer than `max` deliveries are in flight.
    fn try_begin(&self, max: usize) -> bool {
        let mut count = self.lock();
        if *count >= max {
            return false;
        }
        *count += 1;
        true
    }

    /// Reserve a slot, waiting until fewer than `max` deliveries are in flight or `deadline`.
    fn begin_before(&self, max: usize, deadline: Instant) -> bool {
        let mut count = self.lock();
        while *count >= max {
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                return false;
            }
            count = self
                .changed
                .wait_timeout(count, timeout)
                .expect("thread holding in-flight lock should not panic")
                .0;
        }
        *count += 1;
        true
    }

    fn begin(&self) {
        *self.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Returns `false` if deliveries are still in flight at `deadline`.
    fn wait_idle(&self, deadline: Instant) -> bool {
        let mut count = self.lock();
        while *count > 0 {
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                return false;
            }
            count = self
                .changed
                .wait_timeout(count, timeout)
                .expect("thread holding in-flight lock should not panic")
                .0;
        }
        true
    }
}

/// State shared between the public handle, the consumer thread and the delivery threads.
struct Shared {
    state: AtomicU8,
    sender: Arc<dyn EventSender>,
    base_uri: Url,
    diagnostics: Option<Arc<DiagnosticAccumulator>>,
    capacity: usize,
    /// Events sent to the inbox but not yet received by the consumer.
    queued: AtomicUsize,
    inbox_dropped: AtomicU64,
    buffer_dropped: AtomicU64,
    overflow_warned: AtomicBool,
    /// Latest server time seen in a response, in milliseconds. Zero if unknown.
    last_known_past_time: AtomicI64,
    /// Analytics payloads handed to flush workers.
    in_flight: InFlight,
    /// Diagnostic sends. Counted apart so they never take a flush worker's slot.
    diagnostics_in_flight: InFlight,
}

impl Shared {
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    fn is_disabled(&self) -> bool {
        self.state() == CLOSED
    }

    fn record_dropped(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record_dropped_event();
        }
        if !self.overflow_warned.swap(true, Ordering::Relaxed) {
            log::warn!(target: "flagpulse",
                       capacity = self.capacity;
                       "exceeded event queue capacity, increase capacity to avoid dropping events");
        }
    }

    fn handle_result(&self, result: &SendResult) {
        if result.must_shut_down {
            if self.state.swap(CLOSED, Ordering::SeqCst) != CLOSED {
                log::error!(target: "flagpulse", "event delivery is permanently disabled");
            }
            return;
        }

        if let Some(time_from_server) = result.time_from_server {
            self.last_known_past_time
                .store(time_from_server.timestamp_millis(), Ordering::Relaxed);
        }
    }

    fn deliver(&self, kind: EventDataKind, payload: &str, event_count: usize) {
        if self.is_disabled() {
            return;
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.sender
                .send_event_data(kind, payload, event_count, &self.base_uri)
        }));
        match result {
            Ok(result) => self.handle_result(&result),
            Err(panic) => {
                log::warn!(target: "flagpulse",
                           "unexpected panic while sending events: {}", panic_message(&*panic));
            }
        }
    }

    /// Send a diagnostic event from a short-lived thread, so it doesn't compete with analytics
    /// flushes for workers.
    fn send_diagnostic(self: &Arc<Self>, event: DiagnosticEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!(target: "flagpulse", "failed to serialize diagnostic event: {err}");
                return;
            }
        };

        self.diagnostics_in_flight.begin();
        let shared = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(DIAGNOSTICS_THREAD_NAME.to_owned())
            .spawn(move || {
                shared.deliver(EventDataKind::Diagnostics, &payload, 1);
                shared.diagnostics_in_flight.finish();
            });
        if let Err(err) = spawned {
            log::warn!(target: "flagpulse", "failed to start diagnostics thread: {err}");
            self.diagnostics_in_flight.finish();
        }
    }
}

/// Buffers analytics events and delivers them to the events service in the background.
///
/// All methods except [`EventProcessor::close`] return immediately. Events are delivered on a
/// best-effort basis: they are dropped when the queue is full, and a batch that fails to deliver
/// after one retry is discarded.
pub struct EventProcessor {
    shared: Arc<Shared>,
    inbox: mpsc::Sender<Message>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventProcessor {
    /// Maximum time [`EventProcessor::close`] waits for pending deliveries.
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Start the consumer thread and flush workers.
    ///
    /// If `diagnostics` is provided, an init diagnostic event is sent immediately and statistics
    /// events are sent every `diagnostic_recording_interval`.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if a background thread cannot be started.
    pub fn start(
        config: EventProcessorConfig,
        sender: Arc<dyn EventSender>,
        diagnostics: Option<Arc<DiagnosticAccumulator>>,
    ) -> Result<EventProcessor> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(RUNNING),
            sender,
            base_uri: config.base_uri.clone(),
            diagnostics,
            capacity: config.capacity.max(1),
            queued: AtomicUsize::new(0),
            inbox_dropped: AtomicU64::new(0),
            buffer_dropped: AtomicU64::new(0),
            overflow_warned: AtomicBool::new(false),
            last_known_past_time: AtomicI64::new(0),
            in_flight: InFlight::default(),
            diagnostics_in_flight: InFlight::default(),
        });

        // At most FLUSH_WORKERS payloads are in flight, so sends never block.
        let (payload_sender, payload_receiver) = mpsc::sync_channel::<Payload>(FLUSH_WORKERS);
        let payload_receiver = Arc::new(Mutex::new(payload_receiver));

        let mut workers = Vec::with_capacity(FLUSH_WORKERS);
        for i in 0..FLUSH_WORKERS {
            let shared = Arc::clone(&shared);
            let payloads = Arc::clone(&payload_receiver);
            let worker = std::thread::Builder::new()
                .name(format!("flagpulse-flush-{i}"))
                .spawn(move || run_flush_worker(&shared, &payloads))?;
            workers.push(worker);
        }

        if let Some(diagnostics) = &shared.diagnostics {
            shared.send_diagnostic(diagnostics.create_init_event());
        }

        let (inbox, inbox_receiver) = mpsc::channel();

        let consumer = {
            let consumer = Consumer {
                shared: Arc::clone(&shared),
                inbox: inbox_receiver,
                payloads: payload_sender,
                buffer: Vec::new(),
                summary: EventSummary::default(),
                context_keys: ContextKeys::new(config.context_keys_capacity),
                flush_interval: config.flush_interval.max(MIN_TIMER_INTERVAL),
                diagnostic_interval: config
                    .diagnostic_recording_interval
                    .max(MIN_TIMER_INTERVAL),
            };
            std::thread::Builder::new()
                .name(CONSUMER_THREAD_NAME.to_owned())
                .spawn(move || consumer.run())?
        };

        Ok(EventProcessor {
            shared,
            inbox,
            consumer: Mutex::new(Some(consumer)),
            workers: Mutex::new(workers),
        })
    }

    /// Submit an event. Never blocks.
    ///
    /// The event is dropped if the processor is shutting down or closed, or if the queue already
    /// holds `capacity` events.
    pub fn send_event(&self, event: impl Into<Event>) {
        if self.shared.state() != RUNNING {
            return;
        }

        if self.shared.queued.fetch_add(1, Ordering::SeqCst) >= self.shared.capacity {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            self.shared.record_dropped(&self.shared.inbox_dropped);
            return;
        }

        if self.inbox.send(Message::Event(event.into())).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Request delivery of all buffered events. Returns immediately.
    pub fn flush(&self) {
        self.send_control(Message::Flush);
    }

    /// Request a statistics diagnostic event now, independent of the periodic schedule. Does
    /// nothing if diagnostics are disabled.
    pub fn post_diagnostic(&self) {
        self.send_control(Message::Diagnostic);
    }

    fn send_control(&self, message: Message) {
        if self.shared.is_disabled() {
            return;
        }
        // Error means that the consumer has exited.
        let _ = self.inbox.send(message);
    }

    /// Numbers of events dropped so far because the inbox, and respectively the output buffer,
    /// was full.
    pub fn dropped_event_counts(&self) -> (u64, u64) {
        (
            self.shared.inbox_dropped.load(Ordering::Relaxed),
            self.shared.buffer_dropped.load(Ordering::Relaxed),
        )
    }

    /// Returns `true` after the events service rejected the SDK key, or after `close`.
    pub fn is_closed(&self) -> bool {
        self.shared.is_disabled()
    }

    /// Flush remaining events and stop all background threads.
    ///
    /// Blocks for at most [`EventProcessor::CLOSE_TIMEOUT`] waiting for deliveries to complete.
    /// Calling `close` again does nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::ThreadPanicked`] if the consumer thread panicked.
    pub fn close(&self) -> Result<()> {
        let consumer = self
            .consumer
            .lock()
            .expect("thread holding consumer lock should not panic")
            .take();
        let Some(consumer) = consumer else {
            return Ok(());
        };

        let _ = self.shared.state.compare_exchange(
            RUNNING,
            SHUTTING_DOWN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        log::debug!(target: "flagpulse", "closing event processor");

        let deadline = Instant::now() + EventProcessor::CLOSE_TIMEOUT;
        let (reply, reply_receiver) = mpsc::sync_channel(1);
        let answered = match self.inbox.send(Message::Shutdown { deadline, reply }) {
            Ok(()) => reply_receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            Err(_) => Err(RecvTimeoutError::Disconnected),
        };

        let flushes_idle = self.shared.in_flight.wait_idle(deadline);
        let diagnostics_idle = self.shared.diagnostics_in_flight.wait_idle(deadline);
        self.shared.state.store(CLOSED, Ordering::SeqCst);

        match answered {
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(target: "flagpulse", "timed out waiting for the event processor to shut down");
                return Ok(());
            }
            // The consumer answered, or exited without answering (it panicked).
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                consumer
                    .join()
                    .map_err(|_| Error::ThreadPanicked(CONSUMER_THREAD_NAME))?;
            }
        }

        if !(flushes_idle && diagnostics_idle) {
            log::warn!(target: "flagpulse", "timed out waiting for pending events to be delivered");
            return Ok(());
        }

        // The consumer owned the payload sender, so the workers see a disconnected channel and
        // exit.
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .expect("thread holding workers lock should not panic"),
        );
        for worker in workers {
            // Worker panics are caught around the delivery.
            let _ = worker.join();
        }

        Ok(())
    }
}

fn run_flush_worker(shared: &Shared, payloads: &Mutex<mpsc::Receiver<Payload>>) {
    loop {
        let payload = payloads
            .lock()
            .expect("thread holding payload lock should not panic")
            .recv();
        let Ok(payload) = payload else {
            return;
        };

        shared.deliver(EventDataKind::Analytics, &payload.json, payload.event_count);
        shared.in_flight.finish();
    }
}

/// Distinct context keys seen since the last flush, bounded by evicting the least recently seen.
struct ContextKeys {
    capacity: usize,
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl ContextKeys {
    fn new(capacity: usize) -> ContextKeys {
        ContextKeys {
            capacity,
            keys: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` if `key` was already present. Either way, `key` becomes the most recently
    /// seen.
    fn notice(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            if let Some(position) = self.order.iter().position(|seen| *seen == key) {
                self.order.remove(position);
            }
            self.order.push_back(key);
            return true;
        }
        if self.capacity == 0 {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        false
    }

    fn clear(&mut self) {
        self.keys.clear();
        self.order.clear();
    }
}

/// Owned by the consumer thread.
struct Consumer {
    shared: Arc<Shared>,
    inbox: mpsc::Receiver<Message>,
    payloads: mpsc::SyncSender<Payload>,
    buffer: Vec<OutputEvent>,
    summary: EventSummary,
    context_keys: ContextKeys,
    flush_interval: Duration,
    diagnostic_interval: Duration,
}

impl Consumer {
    fn run(mut self) {
        let mut next_flush = Instant::now() + self.flush_interval;
        let mut next_diagnostic = self
            .shared
            .diagnostics
            .as_ref()
            .map(|_| Instant::now() + self.diagnostic_interval);

        loop {
            let now = Instant::now();
            if now >= next_flush {
                self.flush();
                next_flush = now + self.flush_interval;
            }
            if next_diagnostic.is_some_and(|next| now >= next) {
                self.post_diagnostic();
                next_diagnostic = Some(now + self.diagnostic_interval);
            }

            // Timers stop once delivery is disabled.
            let deadline = if self.shared.is_disabled() {
                None
            } else {
                Some(next_diagnostic.map_or(next_flush, |next| next.min(next_flush)))
            };
            let message = match deadline {
                Some(deadline) => self
                    .inbox
                    .recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => self
                    .inbox
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match message {
                Ok(Message::Event(event)) => {
                    self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                    self.process_event(event);
                }
                Ok(Message::Flush) => self.flush(),
                Ok(Message::Diagnostic) => self.post_diagnostic(),
                Ok(Message::Shutdown { deadline, reply }) => {
                    self.final_flush(deadline);
                    let _ = reply.send(());
                    log::debug!(target: "flagpulse", "event processor stopped");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Timers are checked at the top of the loop.
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // The processor handle was dropped without closing.
                    self.flush();
                    return;
                }
            }
        }
    }

    fn process_event(&mut self, event: Event) {
        if self.shared.is_disabled() {
            return;
        }

        let context = Arc::clone(event.context());
        let already_seen = self.context_keys.notice(context.canonical_key());

        match event {
            Event::Identify(event) => {
                // Identify events always carry the full context, so no index event is needed.
                self.add_to_buffer(OutputEvent::Identify(event));
            }
            Event::FeatureRequest(event) => {
                self.summary.add(&event);
                self.notice_context(already_seen, event.creation_date, context);

                let debug = event.debug_events_until.is_some_and(|until| {
                    until > Utc::now()
                        && until.timestamp_millis()
                            > self.shared.last_known_past_time.load(Ordering::Relaxed)
                });
                if event.track_events && debug {
                    self.add_to_buffer(OutputEvent::Feature(event.clone()));
                    self.add_to_buffer(OutputEvent::Debug(event));
                } else if event.track_events {
                    self.add_to_buffer(OutputEvent::Feature(event));
                } else if debug {
                    self.add_to_buffer(OutputEvent::Debug(event));
                }
            }
            Event::Custom(event) => {
                self.notice_context(already_seen, event.creation_date, context);
                self.add_to_buffer(OutputEvent::Custom(event));
            }
        }
    }

    fn notice_context(
        &mut self,
        already_seen: bool,
        creation_date: DateTime<Utc>,
        context: Arc<Context>,
    ) {
        if already_seen {
            if let Some(diagnostics) = &self.shared.diagnostics {
                diagnostics.record_deduplicated_user();
            }
        } else {
            self.add_to_buffer(OutputEvent::Index {
                creation_date,
                context,
            });
        }
    }

    fn add_to_buffer(&mut self, event: OutputEvent) {
        if self.buffer.len() >= self.shared.capacity {
            // Flushes at capacity failed because every worker is busy.
            self.shared.record_dropped(&self.shared.buffer_dropped);
            return;
        }

        self.buffer.push(event);
        if self.buffer.len() >= self.shared.capacity {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() && self.summary.is_empty() {
            return;
        }
        if !self.shared.in_flight.try_begin(FLUSH_WORKERS) {
            log::debug!(target: "flagpulse", "all flush workers are busy, keeping events for the next flush");
            return;
        }
        self.hand_off();
    }

    fn final_flush(&mut self, deadline: Instant) {
        if self.shared.is_disabled() || (self.buffer.is_empty() && self.summary.is_empty()) {
            return;
        }
        if !self.shared.in_flight.begin_before(FLUSH_WORKERS, deadline) {
            log::warn!(target: "flagpulse", "timed out waiting for a flush worker, discarding events");
            return;
        }
        self.hand_off();
    }

    /// Hand the buffer to a flush worker. A delivery slot must be reserved.
    fn hand_off(&mut self) {
        if self.shared.is_disabled() {
            self.buffer.clear();
            self.summary = EventSummary::default();
            self.shared.in_flight.finish();
            return;
        }

        let events = std::mem::take(&mut self.buffer);
        let summary = std::mem::take(&mut self.summary);
        self.context_keys.clear();

        if let Some(diagnostics) = &self.shared.diagnostics {
            diagnostics.record_events_in_batch(events.len());
        }

        let payload = match format_payload(&events, &summary) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!(target: "flagpulse", "failed to serialize events: {err}");
                self.shared.in_flight.finish();
                return;
            }
        };
        log::debug!(target: "flagpulse", event_count = payload.event_count; "flushing events");

        if self.payloads.send(payload).is_err() {
            // All workers exited.
            self.shared.in_flight.finish();
        }
    }

    fn post_diagnostic(&mut self) {
        if self.shared.is_disabled() {
            return;
        }
        if let Some(diagnostics) = &self.shared.diagnostics {
            self.shared.send_diagnostic(diagnostics.create_event_and_reset());
        }
    }
}
