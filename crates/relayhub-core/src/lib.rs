pub mod admin;
pub mod bootstrap;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod handler;
pub mod log;
pub mod upstream_client;

pub use bootstrap::{Bootstrap, ChannelFileError, CliArgs, bootstrap, bootstrap_from_env};
pub use crate::core::{Core, CoreState};
pub use engine::{RelayCall, RelayEngine, RelayOutcome};
pub use log::{LogSink, RelayLog, RelayLogEntry, TracingLogSink};
pub use upstream_client::{HttpUpstreamProvider, UpstreamClientConfig};
