//! Analytics events and their delivery pipeline.
mod event;
mod output;
mod processor;
mod sender;
mod summary;

pub use event::{CustomEvent, Event, FeatureRequestEvent, IdentifyEvent};
pub use processor::{EventProcessor, EventProcessorConfig};
pub use sender::{EventDataKind, EventSender, HttpConfig, HttpEventSender, SendResult};
