use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use relayhub_protocol::sse::{DONE_SENTINEL, SseParser};
use relayhub_protocol::{FrameShape, JsonObject, StreamFrame};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::stream2nostream::claude::ClaudeStreamToMessageState;
use crate::stream2nostream::fold_reasoning;
use crate::stream2nostream::gemini::GeminiStreamToResponseState;
use crate::stream2nostream::openai_chat_completions::OpenAIChatCompletionStreamToResponseState;

/// How the response reached the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Json,
    Stream,
    Custom,
    Multipart,
}

/// The object written under the response marker of a relay log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedResponse {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub content: Value,
}

impl UnifiedResponse {
    pub fn from_json_body(body: &str) -> Self {
        Self {
            kind: ResponseKind::Json,
            content: normalize_json_body(body),
        }
    }

    pub fn from_transcript(transcript: &str) -> Self {
        Self {
            kind: ResponseKind::Stream,
            content: aggregate_transcript(transcript),
        }
    }

    pub fn from_custom(body: &[u8]) -> Self {
        Self {
            kind: ResponseKind::Custom,
            content: Value::String(text_or_base64(body)),
        }
    }

    /// Passthrough responses keep status and headers next to the body.
    pub fn from_raw(status: u16, headers: &[(String, String)], body: &[u8]) -> Self {
        let headers: Map<String, Value> = headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();
        Self {
            kind: ResponseKind::Multipart,
            content: json!({
                "status": status,
                "headers": headers,
                "body": text_or_base64(body),
            }),
        }
    }

    pub fn to_pretty_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.content.to_string())
    }
}

fn text_or_base64(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => BASE64.encode(body),
    }
}

#[derive(Debug)]
enum AggregateState {
    OpenAI(OpenAIChatCompletionStreamToResponseState),
    Claude(ClaudeStreamToMessageState),
    Gemini(GeminiStreamToResponseState),
}

/// Replays a stream transcript fragment by fragment.
///
/// The first recognised fragment locks the shape; fragments of any other
/// shape are dropped afterwards.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    state: Option<AggregateState>,
    unmatched: JsonObject,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shape(&self) -> Option<FrameShape> {
        self.state.as_ref().map(|state| match state {
            AggregateState::OpenAI(_) => FrameShape::OpenAI,
            AggregateState::Claude(_) => FrameShape::Claude,
            AggregateState::Gemini(_) => FrameShape::Gemini,
        })
    }

    /// Accepts one transcript line: `data:` frames, bare JSON lines, or
    /// framing noise, which is ignored.
    pub fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
            return;
        }
        self.push_payload(line.strip_prefix("data:").unwrap_or(line));
    }

    /// Accepts one complete fragment, such as the joined `data` of an SSE
    /// event. Arrays are taken element by element.
    pub fn push_payload(&mut self, payload: &str) {
        let payload = payload.trim();
        if payload.is_empty() || payload == DONE_SENTINEL {
            return;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(Value::Array(items)) => items.iter().for_each(|item| self.push_value(item)),
            Ok(value) => self.push_value(&value),
            Err(_) => {}
        }
    }

    pub fn push_value(&mut self, value: &Value) {
        match StreamFrame::detect(value) {
            Some(frame) => self.push_frame(&frame),
            None if self.state.is_none() => {
                if let Some(object) = value.as_object() {
                    for (key, field) in object {
                        self.unmatched.insert(key.clone(), field.clone());
                    }
                }
            }
            None => {}
        }
    }

    pub fn push_frame(&mut self, frame: &StreamFrame) {
        let state = self.state.get_or_insert_with(|| match frame {
            StreamFrame::OpenAI(_) => {
                AggregateState::OpenAI(OpenAIChatCompletionStreamToResponseState::new())
            }
            StreamFrame::Claude(_) => AggregateState::Claude(ClaudeStreamToMessageState::new()),
            StreamFrame::Gemini(_) => AggregateState::Gemini(GeminiStreamToResponseState::new()),
        });
        match (state, frame) {
            (AggregateState::OpenAI(state), StreamFrame::OpenAI(chunk)) => state.push_chunk(chunk),
            (AggregateState::Claude(state), StreamFrame::Claude(event)) => state.push_event(event),
            (AggregateState::Gemini(state), StreamFrame::Gemini(chunk)) => state.push_chunk(chunk),
            (_, frame) => debug!(
                event = "aggregate_frame_dropped",
                shape = ?frame.shape(),
                "fragment shape differs from the locked transcript shape"
            ),
        }
    }

    pub fn finish(self) -> Value {
        match self.state {
            Some(AggregateState::OpenAI(state)) => state.finalize(),
            Some(AggregateState::Claude(state)) => state.finalize(),
            Some(AggregateState::Gemini(state)) => state.finalize(),
            None => Value::Object(self.unmatched),
        }
    }
}

/// Rebuilds the non-streaming response a captured stream transcript stands for.
///
/// SSE transcripts are replayed event by event, so a payload split over
/// several `data:` lines stays one fragment. Anything else is read as JSON
/// lines.
pub fn aggregate_transcript(transcript: &str) -> Value {
    let mut aggregator = StreamAggregator::new();
    if is_sse_transcript(transcript) {
        let mut parser = SseParser::new();
        let mut events = parser.push_str(transcript);
        events.extend(parser.finish());
        for event in &events {
            aggregator.push_payload(&event.data);
        }
    } else {
        for line in transcript.lines() {
            aggregator.push_line(line);
        }
    }
    aggregator.finish()
}

fn is_sse_transcript(transcript: &str) -> bool {
    transcript.lines().map(str::trim_start).any(|line| {
        line.starts_with("data:") || line.starts_with("event:") || line == "data"
    })
}

/// Parses a buffered body and folds any reasoning into the visible answer.
/// Bodies that are not JSON are kept as a string.
pub fn normalize_json_body(body: &str) -> Value {
    let Ok(mut value) = serde_json::from_str::<Value>(body) else {
        return Value::String(body.to_string());
    };
    fold_choice_reasoning(&mut value);
    fold_thinking_blocks(&mut value);
    fold_thought_parts(&mut value);
    value
}

fn fold_choice_reasoning(value: &mut Value) {
    let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };
    for choice in choices {
        let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut) else {
            continue;
        };
        let reasoning = match message.remove("reasoning_content") {
            Some(Value::String(reasoning)) => reasoning,
            _ => continue,
        };
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let folded = fold_reasoning(&reasoning, content);
        message.insert("content".to_string(), Value::String(folded));
    }
}

fn fold_thinking_blocks(value: &mut Value) {
    if value.get("type").and_then(Value::as_str) != Some("message") {
        return;
    }
    let Some(blocks) = value.get_mut("content").and_then(Value::as_array_mut) else {
        return;
    };
    let mut thinking = String::new();
    blocks.retain(|block| {
        if block.get("type").and_then(Value::as_str) != Some("thinking") {
            return true;
        }
        if let Some(text) = block.get("thinking").and_then(Value::as_str) {
            thinking.push_str(text);
        }
        false
    });
    if thinking.is_empty() {
        return;
    }
    let first_text = blocks
        .iter_mut()
        .find(|block| block.get("type").and_then(Value::as_str) == Some("text"));
    match first_text {
        Some(block) => {
            let folded = fold_reasoning(
                &thinking,
                block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            );
            block["text"] = Value::String(folded);
        }
        None => blocks.insert(
            0,
            json!({"type": "text", "text": fold_reasoning(&thinking, "")}),
        ),
    }
}

fn fold_thought_parts(value: &mut Value) {
    let Some(candidates) = value.get_mut("candidates").and_then(Value::as_array_mut) else {
        return;
    };
    for candidate in candidates {
        let Some(parts) = candidate
            .get_mut("content")
            .and_then(|content| content.get_mut("parts"))
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        let mut thought = String::new();
        parts.retain(|part| {
            if part.get("thought").and_then(Value::as_bool) != Some(true) {
                return true;
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                thought.push_str(text);
            }
            false
        });
        if thought.is_empty() {
            continue;
        }
        match parts.iter_mut().find(|part| part.get("text").is_some()) {
            Some(part) => {
                let folded = fold_reasoning(
                    &thought,
                    part.get("text").and_then(Value::as_str).unwrap_or_default(),
                );
                part["text"] = Value::String(folded);
            }
            None => parts.insert(0, json!({"text": fold_reasoning(&thought, "")})),
        }
    }
}
