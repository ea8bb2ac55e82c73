mod hub;
mod types;

pub use hub::{EventHub, EventSink};
pub use types::{AttemptFailedEvent, CaptureLeakedEvent, Event, OperationalEvent};
