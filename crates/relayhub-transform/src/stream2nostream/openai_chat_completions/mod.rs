use std::collections::BTreeMap;

use relayhub_protocol::JsonObject;
use relayhub_protocol::openai::{ChatCompletionChunk, ChunkDelta, ToolCallChunk};
use serde_json::{Map, Value, json};

use super::{ToolCallState, fold_reasoning, merge_scalar, merge_usage, set_if_nonempty};

/// Folds OpenAI chat-completion chunks into one `chat.completion` object.
#[derive(Debug, Clone, Default)]
pub struct OpenAIChatCompletionStreamToResponseState {
    id: Option<String>,
    model: Option<String>,
    created: Option<i64>,
    system_fingerprint: Option<String>,
    service_tier: Option<String>,
    usage: Option<JsonObject>,
    role: Option<String>,
    content: String,
    reasoning: String,
    refusal: String,
    tool_calls: BTreeMap<i64, ToolCallState>,
    finish_reason: Option<String>,
    message_extra: JsonObject,
}

impl OpenAIChatCompletionStreamToResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &ChatCompletionChunk) {
        self.update_from_chunk(chunk);

        let Some(choice) = chunk.first_choice() else {
            return;
        };
        if let Some(body) = choice.body() {
            self.merge_delta(body);
        }
        set_if_nonempty(&mut self.finish_reason, choice.finish_reason.as_deref());
    }

    pub fn finalize(&self) -> Value {
        let mut message = Map::new();
        message.insert(
            "role".to_string(),
            Value::String(self.role.clone().unwrap_or_else(|| "assistant".to_string())),
        );
        message.insert(
            "content".to_string(),
            Value::String(fold_reasoning(&self.reasoning, &self.content)),
        );
        if !self.refusal.is_empty() {
            message.insert("refusal".to_string(), Value::String(self.refusal.clone()));
        }
        if !self.tool_calls.is_empty() {
            let calls = self.tool_calls.values().map(build_tool_call).collect();
            message.insert("tool_calls".to_string(), Value::Array(calls));
        }
        for (key, value) in &self.message_extra {
            message.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let mut response = Map::new();
        insert_opt(&mut response, "id", self.id.clone().map(Value::String));
        response.insert("object".to_string(), json!("chat.completion"));
        insert_opt(&mut response, "created", self.created.map(Value::from));
        insert_opt(&mut response, "model", self.model.clone().map(Value::String));
        insert_opt(
            &mut response,
            "system_fingerprint",
            self.system_fingerprint.clone().map(Value::String),
        );
        insert_opt(
            &mut response,
            "service_tier",
            self.service_tier.clone().map(Value::String),
        );
        response.insert(
            "choices".to_string(),
            json!([{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": self.finish_reason,
            }]),
        );
        insert_opt(&mut response, "usage", self.usage.clone().map(Value::Object));
        Value::Object(response)
    }

    fn update_from_chunk(&mut self, chunk: &ChatCompletionChunk) {
        set_if_nonempty(&mut self.id, chunk.id.as_deref());
        set_if_nonempty(&mut self.model, chunk.model.as_deref());
        set_if_nonempty(
            &mut self.system_fingerprint,
            chunk.system_fingerprint.as_deref(),
        );
        set_if_nonempty(&mut self.service_tier, chunk.service_tier.as_deref());
        if chunk.created.is_some() {
            self.created = chunk.created;
        }
        if let Some(usage) = &chunk.usage {
            merge_usage(&mut self.usage, usage);
        }
    }

    fn merge_delta(&mut self, delta: &ChunkDelta) {
        set_if_nonempty(&mut self.role, delta.role.as_deref());
        if let Some(content) = &delta.content {
            self.content.push_str(content);
        }
        if let Some(reasoning) = &delta.reasoning_content {
            self.reasoning.push_str(reasoning);
        }
        if let Some(refusal) = &delta.refusal {
            self.refusal.push_str(refusal);
        }
        if let Some(tool_calls) = &delta.tool_calls {
            for tool_call in tool_calls {
                self.merge_tool_call(tool_call);
            }
        }
        set_if_nonempty(&mut self.finish_reason, delta.finish_reason.as_deref());
        for (key, value) in &delta.extra {
            merge_scalar(&mut self.message_extra, key, value);
        }
    }

    fn merge_tool_call(&mut self, tool_call: &ToolCallChunk) {
        let entry = self
            .tool_calls
            .entry(tool_call.index.unwrap_or(0))
            .or_default();
        let function = tool_call.function.as_ref();
        entry.merge_identity(
            tool_call.id.as_deref(),
            function.and_then(|function| function.name.as_deref()),
        );
        entry.merge_extra(&tool_call.extra);
        if let Some(arguments) = function.and_then(|function| function.arguments.as_deref()) {
            entry.push_arguments(arguments);
        }
    }
}

fn build_tool_call(state: &ToolCallState) -> Value {
    let mut call = Map::new();
    call.insert(
        "id".to_string(),
        Value::String(state.id.clone().unwrap_or_default()),
    );
    call.insert(
        "type".to_string(),
        state
            .extra
            .get("type")
            .cloned()
            .unwrap_or_else(|| json!("function")),
    );
    call.insert(
        "function".to_string(),
        json!({
            "name": state.name.clone().unwrap_or_default(),
            "arguments": state.arguments,
        }),
    );
    for (key, value) in &state.extra {
        call.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(call)
}

fn insert_opt(target: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        target.insert(key.to_string(), value);
    }
}
