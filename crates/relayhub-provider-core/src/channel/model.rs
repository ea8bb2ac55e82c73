use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub type ChannelId = i64;

/// Upstream wire family of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
    Gemini,
    Azure,
    Custom,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::OpenAI => "openai",
            ChannelKind::Anthropic => "anthropic",
            ChannelKind::Gemini => "gemini",
            ChannelKind::Azure => "azure",
            ChannelKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, ChannelStatus::Enabled)
    }
}

fn default_weight() -> u32 {
    1
}

fn default_status() -> ChannelStatus {
    ChannelStatus::Enabled
}

/// One configured upstream endpoint and credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default = "default_status")]
    pub status: ChannelStatus,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Requested model name to upstream model name. An empty upstream name
    /// means the model is forwarded unchanged.
    #[serde(default)]
    pub models: BTreeMap<String, String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
}

impl Channel {
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    /// The model name to send upstream for a requested model.
    pub fn upstream_model<'a>(&'a self, model: &'a str) -> &'a str {
        match self.models.get(model) {
            Some(mapped) if !mapped.is_empty() => mapped,
            _ => model,
        }
    }

    /// Enabled, in `group`, and declaring `model`.
    pub fn is_eligible(&self, group: &str, model: &str) -> bool {
        self.status.is_enabled() && self.in_group(group) && self.supports_model(model)
    }

    pub fn label(&self) -> String {
        format!("#{}({})", self.id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_channel_with_defaults() {
        let channel: Channel = serde_json::from_str(
            r#"{"id":7,"kind":"anthropic","groups":["default"],"models":{"claude":"claude-3-7","haiku":""}}"#,
        )
        .unwrap();
        assert_eq!(channel.status, ChannelStatus::Enabled);
        assert_eq!(channel.weight, 1);
        assert!(channel.is_eligible("default", "claude"));
        assert!(!channel.is_eligible("vip", "claude"));
        assert_eq!(channel.upstream_model("claude"), "claude-3-7");
        assert_eq!(channel.upstream_model("haiku"), "haiku");
    }

    #[test]
    fn api_key_is_never_serialised() {
        let channel = Channel {
            id: 1,
            name: "main".to_string(),
            kind: ChannelKind::OpenAI,
            status: ChannelStatus::AutoDisabled,
            groups: BTreeSet::new(),
            models: BTreeMap::new(),
            weight: 1,
            base_url: String::new(),
            api_key: "sk-secret".to_string(),
        };
        let rendered = serde_json::to_string(&channel).unwrap();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("\"auto_disabled\""));
    }
}
