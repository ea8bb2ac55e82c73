//! Wire-level types for the three upstream stream shapes and the SSE framing
//! they travel in.
//!
//! Every frame type here is deliberately lenient: fields are optional and
//! unknown keys are kept, because these types are parsed from captured
//! transcripts after the bytes already reached the caller.

pub mod claude;
pub mod frame;
pub mod gemini;
pub mod openai;
pub mod sse;

pub use frame::{FrameShape, StreamFrame};

pub type JsonObject = serde_json::Map<String, serde_json::Value>;
