use std::collections::BTreeMap;

use relayhub_protocol::JsonObject;
use relayhub_protocol::claude::{
    ClaudeBlockDelta, ClaudeContentBlock, ClaudeMessageDelta, ClaudeStreamEvent,
    ClaudeStreamMessage,
};
use serde_json::{Map, Value, json};

use super::{ToolCallState, fold_reasoning, merge_usage, set_if_nonempty};

#[derive(Debug, Clone, Default)]
struct ToolUseState {
    call: ToolCallState,
    initial_input: Value,
}

/// Folds Anthropic stream events into one `message` object.
#[derive(Debug, Clone, Default)]
pub struct ClaudeStreamToMessageState {
    id: Option<String>,
    model: Option<String>,
    role: Option<String>,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
    usage: Option<JsonObject>,
    text: String,
    thinking: String,
    tool_uses: BTreeMap<u32, ToolUseState>,
}

impl ClaudeStreamToMessageState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: &ClaudeStreamEvent) {
        match event {
            ClaudeStreamEvent::MessageStart { message } => self.handle_message_start(message),
            ClaudeStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.handle_block_start(*index, content_block),
            ClaudeStreamEvent::ContentBlockDelta { index, delta } => {
                self.handle_block_delta(*index, delta)
            }
            ClaudeStreamEvent::MessageDelta { delta, usage } => {
                self.handle_message_delta(delta, usage.as_ref())
            }
            ClaudeStreamEvent::ContentBlockStop { .. }
            | ClaudeStreamEvent::MessageStop
            | ClaudeStreamEvent::Ping
            | ClaudeStreamEvent::Error { .. } => {}
        }
    }

    pub fn finalize(&self) -> Value {
        let mut content = Vec::new();
        let text = fold_reasoning(&self.thinking, &self.text);
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
        for tool_use in self.tool_uses.values() {
            let input = if tool_use.call.arguments.is_empty() {
                tool_use.initial_input.clone()
            } else {
                tool_use.call.parsed_arguments()
            };
            content.push(json!({
                "type": "tool_use",
                "id": tool_use.call.id.clone().unwrap_or_default(),
                "name": tool_use.call.name.clone().unwrap_or_default(),
                "input": input,
            }));
        }

        let mut message = Map::new();
        if let Some(id) = &self.id {
            message.insert("id".to_string(), json!(id));
        }
        message.insert("type".to_string(), json!("message"));
        message.insert(
            "role".to_string(),
            json!(self.role.as_deref().unwrap_or("assistant")),
        );
        if let Some(model) = &self.model {
            message.insert("model".to_string(), json!(model));
        }
        message.insert("content".to_string(), Value::Array(content));
        message.insert("stop_reason".to_string(), json!(self.stop_reason));
        message.insert("stop_sequence".to_string(), json!(self.stop_sequence));
        if let Some(usage) = &self.usage {
            message.insert("usage".to_string(), Value::Object(usage.clone()));
        }
        Value::Object(message)
    }

    fn handle_message_start(&mut self, message: &ClaudeStreamMessage) {
        set_if_nonempty(&mut self.id, message.id.as_deref());
        set_if_nonempty(&mut self.model, message.model.as_deref());
        set_if_nonempty(&mut self.role, message.role.as_deref());
        set_if_nonempty(&mut self.stop_reason, message.stop_reason.as_deref());
        set_if_nonempty(&mut self.stop_sequence, message.stop_sequence.as_deref());
        if let Some(usage) = &message.usage {
            merge_usage(&mut self.usage, usage);
        }
    }

    fn handle_block_start(&mut self, index: u32, block: &ClaudeContentBlock) {
        match block {
            ClaudeContentBlock::Text { text } => self.text.push_str(text),
            ClaudeContentBlock::Thinking { thinking } => self.thinking.push_str(thinking),
            ClaudeContentBlock::ToolUse { id, name, input } => {
                let entry = self.tool_uses.entry(index).or_default();
                entry.call.merge_identity(Some(id.as_str()), Some(name.as_str()));
                if !input.is_null() {
                    entry.initial_input = input.clone();
                }
            }
            ClaudeContentBlock::Other => {}
        }
    }

    fn handle_block_delta(&mut self, index: u32, delta: &ClaudeBlockDelta) {
        match delta {
            ClaudeBlockDelta::TextDelta { text } => self.text.push_str(text),
            ClaudeBlockDelta::ThinkingDelta { thinking } => self.thinking.push_str(thinking),
            ClaudeBlockDelta::InputJsonDelta { partial_json } => {
                self.tool_uses
                    .entry(index)
                    .or_default()
                    .call
                    .push_arguments(partial_json);
            }
            ClaudeBlockDelta::SignatureDelta { .. } | ClaudeBlockDelta::Other => {}
        }
    }

    fn handle_message_delta(&mut self, delta: &ClaudeMessageDelta, usage: Option<&JsonObject>) {
        set_if_nonempty(&mut self.stop_reason, delta.stop_reason.as_deref());
        set_if_nonempty(&mut self.stop_sequence, delta.stop_sequence.as_deref());
        if let Some(usage) = usage {
            merge_usage(&mut self.usage, usage);
        }
    }
}
