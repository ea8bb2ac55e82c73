use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// How the channel router picks among eligible channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    WeightedRandom,
    RoundRobin,
}

impl SelectionMode {
    pub fn parse(value: &str) -> Result<Self, GlobalConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "weighted" | "weighted_random" | "random" => Ok(SelectionMode::WeightedRandom),
            "round_robin" | "rr" => Ok(SelectionMode::RoundRobin),
            _ => Err(GlobalConfigError::InvalidValue {
                field: "selection",
                value: value.to_string(),
            }),
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > config file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Required on `/admin/*` routes via the `x-admin-key` header.
    pub admin_key: String,
    /// Routing group used when a request does not name one.
    pub default_group: String,
    /// Path of the JSON channel list.
    pub channels_path: String,
    pub selection: SelectionMode,
    /// Fixed seed for the weighted-random policy. `None` seeds from entropy.
    pub selection_seed: Option<u64>,
    /// Capture slots older than this are evicted as leaks.
    pub capture_ttl_secs: u64,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub connect_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key: Option<String>,
    pub default_group: Option<String>,
    pub channels_path: Option<String>,
    pub selection: Option<SelectionMode>,
    pub selection_seed: Option<u64>,
    pub capture_ttl_secs: Option<u64>,
    pub proxy: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
}

impl GlobalConfigPatch {
    /// Fields set in `other` win over fields set in `self`.
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key.is_some() {
            self.admin_key = other.admin_key;
        }
        if other.default_group.is_some() {
            self.default_group = other.default_group;
        }
        if other.channels_path.is_some() {
            self.channels_path = other.channels_path;
        }
        if other.selection.is_some() {
            self.selection = other.selection;
        }
        if other.selection_seed.is_some() {
            self.selection_seed = other.selection_seed;
        }
        if other.capture_ttl_secs.is_some() {
            self.capture_ttl_secs = other.capture_ttl_secs;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.connect_timeout_secs.is_some() {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
        if other.stream_idle_timeout_secs.is_some() {
            self.stream_idle_timeout_secs = other.stream_idle_timeout_secs;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let admin_key = self
            .admin_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(GlobalConfigError::MissingField("admin_key"))?;
        let capture_ttl_secs = self.capture_ttl_secs.unwrap_or(600);
        if capture_ttl_secs == 0 {
            return Err(GlobalConfigError::InvalidValue {
                field: "capture_ttl_secs",
                value: "0".to_string(),
            });
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8788),
            admin_key,
            default_group: self.default_group.unwrap_or_else(|| "default".to_string()),
            channels_path: self
                .channels_path
                .unwrap_or_else(|| "channels.json".to_string()),
            selection: self.selection.unwrap_or(SelectionMode::WeightedRandom),
            selection_seed: self.selection_seed,
            capture_ttl_secs,
            proxy: self.proxy.filter(|proxy| !proxy.trim().is_empty()),
            connect_timeout_secs: self.connect_timeout_secs.unwrap_or(5),
            stream_idle_timeout_secs: self.stream_idle_timeout_secs.unwrap_or(300),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key: Some(value.admin_key),
            default_group: Some(value.default_group),
            channels_path: Some(value.channels_path),
            selection: Some(value.selection),
            selection_seed: value.selection_seed,
            capture_ttl_secs: Some(value.capture_ttl_secs),
            proxy: value.proxy,
            connect_timeout_secs: Some(value.connect_timeout_secs),
            stream_idle_timeout_secs: Some(value.stream_idle_timeout_secs),
        }
    }
}
