use std::sync::Arc;

use axum::Router;
use axum::routing::post;
use relayhub_provider_core::CaptureStore;

use crate::admin::admin_router;
use crate::engine::RelayEngine;
use crate::handler::relay_handler;
use crate::log::{LogSink, TracingLogSink};

pub struct CoreState {
    pub engine: RelayEngine,
    pub capture: Arc<CaptureStore>,
    pub log_sink: Arc<dyn LogSink>,
    /// Routing group for requests without `x-relay-group`.
    pub default_group: String,
    pub admin_key: String,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(
        engine: RelayEngine,
        capture: Arc<CaptureStore>,
        log_sink: Option<Arc<dyn LogSink>>,
        default_group: impl Into<String>,
        admin_key: impl Into<String>,
    ) -> Self {
        Self {
            state: Arc::new(CoreState {
                engine,
                capture,
                log_sink: log_sink.unwrap_or_else(|| Arc::new(TracingLogSink::new())),
                default_group: default_group.into(),
                admin_key: admin_key.into(),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(relay_handler))
            .route("/v1/completions", post(relay_handler))
            .with_state(self.state.clone())
            .merge(admin_router(self.state.clone()))
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}
