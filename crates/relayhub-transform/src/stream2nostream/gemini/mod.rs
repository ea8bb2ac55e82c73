use relayhub_protocol::JsonObject;
use relayhub_protocol::gemini::{GeminiCandidate, GeminiChunk};
use serde_json::{Map, Value, json};

use super::{fold_reasoning, merge_usage, set_if_nonempty};

/// Folds `streamGenerateContent` chunks into one `GenerateContentResponse`.
#[derive(Debug, Clone, Default)]
pub struct GeminiStreamToResponseState {
    response_id: Option<String>,
    model_version: Option<String>,
    usage_metadata: Option<JsonObject>,
    role: Option<String>,
    text: String,
    thought: String,
    function_calls: Vec<Value>,
    finish_reason: Option<String>,
    safety_ratings: Option<Vec<Value>>,
}

impl GeminiStreamToResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &GeminiChunk) {
        self.merge_metadata(chunk);
        if let Some(candidate) = chunk.first_candidate() {
            self.merge_candidate(candidate);
        }
    }

    pub fn finalize(&self) -> Value {
        let mut parts = Vec::new();
        let text = fold_reasoning(&self.thought, &self.text);
        if !text.is_empty() {
            parts.push(json!({"text": text}));
        }
        parts.extend(
            self.function_calls
                .iter()
                .map(|call| json!({"functionCall": call})),
        );

        let mut candidate = Map::new();
        candidate.insert("index".to_string(), json!(0));
        candidate.insert(
            "content".to_string(),
            json!({
                "role": self.role.as_deref().unwrap_or("model"),
                "parts": parts,
            }),
        );
        if let Some(reason) = &self.finish_reason {
            candidate.insert("finishReason".to_string(), json!(reason));
        }
        if let Some(ratings) = &self.safety_ratings {
            candidate.insert("safetyRatings".to_string(), json!(ratings));
        }

        let mut response = Map::new();
        response.insert(
            "candidates".to_string(),
            Value::Array(vec![Value::Object(candidate)]),
        );
        if let Some(usage) = &self.usage_metadata {
            response.insert("usageMetadata".to_string(), Value::Object(usage.clone()));
        }
        if let Some(model_version) = &self.model_version {
            response.insert("modelVersion".to_string(), json!(model_version));
        }
        if let Some(response_id) = &self.response_id {
            response.insert("responseId".to_string(), json!(response_id));
        }
        Value::Object(response)
    }

    fn merge_metadata(&mut self, chunk: &GeminiChunk) {
        set_if_nonempty(&mut self.response_id, chunk.response_id.as_deref());
        set_if_nonempty(&mut self.model_version, chunk.model_version.as_deref());
        if let Some(usage) = &chunk.usage_metadata {
            merge_usage(&mut self.usage_metadata, usage);
        }
    }

    fn merge_candidate(&mut self, candidate: &GeminiCandidate) {
        if let Some(content) = &candidate.content {
            set_if_nonempty(&mut self.role, content.role.as_deref());
            for part in &content.parts {
                if let Some(call) = &part.function_call {
                    self.function_calls.push(call.clone());
                    continue;
                }
                let Some(text) = &part.text else {
                    continue;
                };
                if part.is_thought() {
                    self.thought.push_str(text);
                } else {
                    self.text.push_str(text);
                }
            }
        }
        set_if_nonempty(&mut self.finish_reason, candidate.finish_reason.as_deref());
        if candidate.safety_ratings.is_some() {
            self.safety_ratings = candidate.safety_ratings.clone();
        }
    }
}
