use serde_json::Value;

use crate::claude::{self, ClaudeStreamEvent};
use crate::gemini::GeminiChunk;
use crate::openai::ChatCompletionChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameShape {
    OpenAI,
    Claude,
    Gemini,
}

/// One parsed stream fragment, tagged by the upstream shape it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    OpenAI(ChatCompletionChunk),
    Claude(ClaudeStreamEvent),
    Gemini(GeminiChunk),
}

impl StreamFrame {
    /// Recognises a fragment by structure, trying OpenAI, then Anthropic, then
    /// Gemini. A value that looks like a shape but does not parse as it is
    /// rejected rather than tried against the next shape.
    pub fn detect(value: &Value) -> Option<StreamFrame> {
        if is_openai_chunk(value) {
            return serde_json::from_value(value.clone())
                .ok()
                .map(StreamFrame::OpenAI);
        }
        if is_claude_event(value) {
            return serde_json::from_value(value.clone())
                .ok()
                .map(StreamFrame::Claude);
        }
        if is_gemini_chunk(value) {
            return serde_json::from_value(value.clone())
                .ok()
                .map(StreamFrame::Gemini);
        }
        None
    }

    pub fn shape(&self) -> FrameShape {
        match self {
            StreamFrame::OpenAI(_) => FrameShape::OpenAI,
            StreamFrame::Claude(_) => FrameShape::Claude,
            StreamFrame::Gemini(_) => FrameShape::Gemini,
        }
    }
}

fn is_openai_chunk(value: &Value) -> bool {
    let Some(choices) = value.get("choices").and_then(Value::as_array) else {
        return false;
    };
    if choices.is_empty() {
        // Usage-only trailer.
        return value.get("usage").is_some_and(Value::is_object);
    }
    choices.iter().any(|choice| {
        choice.get("delta").is_some_and(Value::is_object)
            || choice.get("message").is_some_and(Value::is_object)
    })
}

fn is_claude_event(value: &Value) -> bool {
    value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|kind| claude::EVENT_TYPES.contains(&kind))
}

fn is_gemini_chunk(value: &Value) -> bool {
    let Some(candidates) = value.get("candidates").and_then(Value::as_array) else {
        return false;
    };
    // Trailing chunks may carry only finishReason / usage without parts.
    candidates.iter().any(|candidate| {
        candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .is_some_and(Value::is_array)
            || candidate.get("finishReason").is_some_and(Value::is_string)
    })
}
