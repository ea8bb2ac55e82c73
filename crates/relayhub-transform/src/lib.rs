//! Rebuilds one non-streaming response object from a captured stream
//! transcript or buffered body, for the audit log.

pub mod normalize;
pub mod stream2nostream;

pub use normalize::{ResponseKind, StreamAggregator, UnifiedResponse, aggregate_transcript};
