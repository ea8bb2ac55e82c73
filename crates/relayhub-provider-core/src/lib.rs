//! Channel routing, failure classification and request-scoped capture for
//! relayhub.
//!
//! This crate does not depend on axum or any concrete HTTP client. Upstream
//! implementations produce an `UpstreamPayload`; a higher layer delivers it.

pub mod capture;
pub mod channel;
pub mod errors;
pub mod events;
pub mod headers;
pub mod provider;
pub mod retry;
pub mod router;

pub use capture::{
    CaptureKind, CaptureScope, CaptureStore, CaptureToken, CaptureValue, CapturedResponse,
};
pub use channel::{
    Channel, ChannelId, ChannelKind, ChannelRegistry, ChannelStatus, ChannelStatusTransition,
    MemoryChannelRegistry, RegistryError, TransitionActor,
};
pub use errors::{ErrorKind, RelayError, RenderedError, RouteError};
pub use events::{
    AttemptFailedEvent, CaptureLeakedEvent, Event, EventHub, EventSink, OperationalEvent,
};
pub use headers::{Headers, header_get, header_remove, header_set, is_hop_by_hop};
pub use provider::{
    CustomPayload, RawResponse, StreamEnd, StreamFinalizer, StreamFraming, StreamHandle,
    StreamSender, UpstreamPayload, UpstreamProvider, UpstreamRequest, stream_channel,
};
pub use retry::{DefaultDisablePolicy, DisablePolicy, PinState, should_retry};
pub use router::{ChannelRouter, RoutingRequest, SelectionPolicy};
