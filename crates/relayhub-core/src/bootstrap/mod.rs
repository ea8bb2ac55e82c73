use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relayhub_common::{GlobalConfig, GlobalConfigPatch, SelectionMode};
use relayhub_provider_core::{
    CaptureStore, Channel, ChannelRegistry, ChannelRouter, EventHub, MemoryChannelRegistry,
    RegistryError, SelectionPolicy,
};
use serde::Deserialize;
use tracing::info;

use crate::core::Core;
use crate::engine::RelayEngine;
use crate::upstream_client::{HttpUpstreamProvider, UpstreamClientConfig};

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "relayhub",
    version,
    about = "Channel-routing LLM relay gateway"
)]
pub struct CliArgs {
    /// Optional JSON file with global settings (lowest precedence).
    #[arg(long, env = "RELAYHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind host.
    #[arg(long, env = "RELAYHUB_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "RELAYHUB_PORT")]
    pub port: Option<String>,

    /// Admin key for `/admin/*`.
    #[arg(long, env = "RELAYHUB_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Routing group used when a request names none.
    #[arg(long, env = "RELAYHUB_DEFAULT_GROUP")]
    pub default_group: Option<String>,

    /// JSON channel list.
    #[arg(long, env = "RELAYHUB_CHANNELS")]
    pub channels: Option<String>,

    /// `weighted_random` or `round_robin`.
    #[arg(long, env = "RELAYHUB_SELECTION")]
    pub selection: Option<String>,

    /// Fixed seed for weighted-random selection.
    #[arg(long, env = "RELAYHUB_SELECTION_SEED")]
    pub selection_seed: Option<String>,

    /// Seconds before an unreleased capture slot is evicted.
    #[arg(long, env = "RELAYHUB_CAPTURE_TTL_SECS")]
    pub capture_ttl_secs: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "RELAYHUB_PROXY")]
    pub proxy: Option<String>,

    #[arg(long, env = "RELAYHUB_CONNECT_TIMEOUT_SECS")]
    pub connect_timeout_secs: Option<String>,

    #[arg(long, env = "RELAYHUB_STREAM_IDLE_TIMEOUT_SECS")]
    pub stream_idle_timeout_secs: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelFileError {
    #[error("read channel file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse channel file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("channel file {path}: {source}")]
    Registry {
        path: String,
        source: RegistryError,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelFile {
    List(Vec<Channel>),
    Wrapped { channels: Vec<Channel> },
}

/// Reads a channel list, either a bare array or `{"channels": [...]}`.
pub async fn load_channels(path: impl AsRef<Path>) -> Result<Vec<Channel>, ChannelFileError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| ChannelFileError::Read {
            path: display.clone(),
            source,
        })?;
    parse_channels(&raw).map_err(|source| ChannelFileError::Parse {
        path: display,
        source,
    })
}

pub fn parse_channels(raw: &[u8]) -> Result<Vec<Channel>, serde_json::Error> {
    Ok(match serde_json::from_slice::<ChannelFile>(raw)? {
        ChannelFile::List(channels) => channels,
        ChannelFile::Wrapped { channels } => channels,
    })
}

pub struct Bootstrap {
    pub config: GlobalConfig,
    pub core: Core,
    pub capture: Arc<CaptureStore>,
    pub events: EventHub,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    // clap already applies CLI > ENV per field; that layer overlays the file.
    let mut merged = match args.config.as_deref() {
        Some(path) => load_config_file(path).await?,
        None => GlobalConfigPatch::default(),
    };
    merged.overlay(cli_patch(&args)?);
    let config = merged
        .into_config()
        .context("finalize merged global config")?;
    info!(
        host = %config.host,
        port = config.port,
        default_group = %config.default_group,
        channels = %config.channels_path,
        selection = ?config.selection,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        "config loaded"
    );

    let events = EventHub::new(1024);

    let channel_path = config.channels_path.clone();
    let channels = load_channels(&channel_path).await?;
    let registry = MemoryChannelRegistry::new(channels)
        .map_err(|source| ChannelFileError::Registry {
            path: channel_path,
            source,
        })?
        .with_events(events.clone());
    info!(channels = registry.channels().len(), "channel registry ready");
    let registry: Arc<dyn ChannelRegistry> = Arc::new(registry);

    let router = ChannelRouter::new(
        registry,
        SelectionPolicy::from_mode(config.selection, config.selection_seed),
    );
    let provider = HttpUpstreamProvider::new(UpstreamClientConfig::from_global(&config))
        .context("build upstream client")?;
    let engine = RelayEngine::new(router, Arc::new(provider)).with_events(events.clone());

    let capture = Arc::new(CaptureStore::new().with_events(events.clone()));
    let core = Core::new(
        engine,
        capture.clone(),
        None,
        config.default_group.clone(),
        config.admin_key.clone(),
    );

    Ok(Bootstrap {
        config,
        core,
        capture,
        events,
    })
}

impl Bootstrap {
    /// Starts the capture sweeper: slots older than the TTL are evicted
    /// every TTL/4.
    pub fn spawn_capture_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let ttl = Duration::from_secs(self.config.capture_ttl_secs);
        let interval = (ttl / 4).max(Duration::from_secs(1));
        self.capture.spawn_sweeper(ttl, interval)
    }
}

async fn load_config_file(path: &Path) -> anyhow::Result<GlobalConfigPatch> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read config file {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse config file {}", path.display()))
}

fn cli_patch(args: &CliArgs) -> anyhow::Result<GlobalConfigPatch> {
    let selection = sanitize_optional_env_value(args.selection.clone())
        .map(|raw| SelectionMode::parse(&raw))
        .transpose()?;
    Ok(GlobalConfigPatch {
        host: sanitize_optional_env_value(args.host.clone()),
        port: parse_env_value(args.port.clone(), "RELAYHUB_PORT")?,
        admin_key: sanitize_optional_env_value(args.admin_key.clone()),
        default_group: sanitize_optional_env_value(args.default_group.clone()),
        channels_path: sanitize_optional_env_value(args.channels.clone()),
        selection,
        selection_seed: parse_env_value(args.selection_seed.clone(), "RELAYHUB_SELECTION_SEED")?,
        capture_ttl_secs: parse_env_value(
            args.capture_ttl_secs.clone(),
            "RELAYHUB_CAPTURE_TTL_SECS",
        )?,
        proxy: sanitize_optional_env_value(args.proxy.clone()),
        connect_timeout_secs: parse_env_value(
            args.connect_timeout_secs.clone(),
            "RELAYHUB_CONNECT_TIMEOUT_SECS",
        )?,
        stream_idle_timeout_secs: parse_env_value(
            args.stream_idle_timeout_secs.clone(),
            "RELAYHUB_STREAM_IDLE_TIMEOUT_SECS",
        )?,
    })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Unresolved `${VAR}` placeholders count as unset.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_env_value<T>(value: Option<String>, env_name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<T>()
        .map_err(|err| anyhow::anyhow!("invalid {env_name} value: {raw} ({err})"))?;
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_count_as_unset() {
        assert_eq!(sanitize_optional_env_value(Some("${PORT}".to_string())), None);
        assert_eq!(sanitize_optional_env_value(Some("  ".to_string())), None);
        assert_eq!(
            sanitize_optional_env_value(Some(" 8080 ".to_string())).as_deref(),
            Some("8080")
        );
    }

    #[test]
    fn cli_layer_parses_numbers_and_selection() {
        let args = CliArgs {
            port: Some("9000".to_string()),
            selection: Some("rr".to_string()),
            selection_seed: Some("42".to_string()),
            ..Default::default()
        };
        let patch = cli_patch(&args).unwrap();
        assert_eq!(patch.port, Some(9000));
        assert_eq!(patch.selection, Some(SelectionMode::RoundRobin));
        assert_eq!(patch.selection_seed, Some(42));

        let bad = CliArgs {
            port: Some("http".to_string()),
            ..Default::default()
        };
        assert!(cli_patch(&bad).is_err());
    }

    #[test]
    fn cli_overrides_file_layer() {
        let mut merged: GlobalConfigPatch =
            serde_json::from_str(r#"{"port":1000,"admin_key":"from-file","default_group":"g"}"#)
                .unwrap();
        merged.overlay(
            cli_patch(&CliArgs {
                port: Some("2000".to_string()),
                ..Default::default()
            })
            .unwrap(),
        );
        let config = merged.into_config().unwrap();
        assert_eq!(config.port, 2000);
        assert_eq!(config.admin_key, "from-file");
        assert_eq!(config.default_group, "g");
    }

    #[test]
    fn channel_file_accepts_both_layouts() {
        let bare = parse_channels(
            br#"[{"id":1,"kind":"openai","groups":["default"],"models":{"gpt-4o":""}}]"#,
        )
        .unwrap();
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0].weight, 1);

        let wrapped = parse_channels(
            br#"{"channels":[{"id":2,"name":"claude","kind":"anthropic","api_key":"k"}]}"#,
        )
        .unwrap();
        assert_eq!(wrapped[0].api_key, "k");
        assert!(parse_channels(b"{\"channels\": 3}").is_err());
    }
}
