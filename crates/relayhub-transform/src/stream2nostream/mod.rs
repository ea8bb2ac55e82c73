use serde_json::{Map, Value};

use relayhub_protocol::JsonObject;

pub mod claude;
pub mod gemini;
pub mod openai_chat_completions;

/// Opening and closing delimiters around folded reasoning text.
pub const THINKING_OPEN: &str = "<thinking>";
pub const THINKING_CLOSE: &str = "</thinking>";

/// Prefixes the answer with its reasoning, if any.
pub fn fold_reasoning(reasoning: &str, text: &str) -> String {
    if reasoning.is_empty() {
        return text.to_string();
    }
    format!("{THINKING_OPEN}{reasoning}{THINKING_CLOSE}\n\n{text}")
}

/// New keys are added and existing keys overwritten.
pub fn merge_usage(target: &mut Option<JsonObject>, incoming: &JsonObject) {
    let entry = target.get_or_insert_with(Map::new);
    for (key, value) in incoming {
        entry.insert(key.clone(), value.clone());
    }
}

/// A new non-empty string wins; any non-string value always overwrites.
pub fn merge_scalar(target: &mut JsonObject, key: &str, value: &Value) {
    match value {
        Value::String(text) if text.is_empty() => {}
        _ => {
            target.insert(key.to_string(), value.clone());
        }
    }
}

pub(crate) fn set_if_nonempty(slot: &mut Option<String>, value: Option<&str>) {
    if let Some(value) = value.filter(|value| !value.is_empty()) {
        *slot = Some(value.to_string());
    }
}

/// A tool call under construction, keyed by its stream index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallState {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
    pub extra: JsonObject,
}

impl ToolCallState {
    pub fn merge_identity(&mut self, id: Option<&str>, name: Option<&str>) {
        if self.id.is_none() {
            set_if_nonempty(&mut self.id, id);
        }
        if self.name.is_none() {
            set_if_nonempty(&mut self.name, name);
        }
    }

    pub fn push_arguments(&mut self, fragment: &str) {
        self.arguments.push_str(fragment);
    }

    pub fn merge_extra(&mut self, extra: &JsonObject) {
        for (key, value) in extra {
            merge_scalar(&mut self.extra, key, value);
        }
    }

    /// Arguments as JSON when they parse, the raw string otherwise.
    pub fn parsed_arguments(&self) -> Value {
        if self.arguments.trim().is_empty() {
            return Value::Object(Map::new());
        }
        serde_json::from_str(&self.arguments)
            .unwrap_or_else(|_| Value::String(self.arguments.clone()))
    }
}
