//! The relay loop: route, call, classify, and fail over.

use std::sync::Arc;
use std::time::SystemTime;

use relayhub_provider_core::{
    AttemptFailedEvent, Channel, ChannelRouter, ChannelStatus, DefaultDisablePolicy,
    DisablePolicy, Event, EventHub, PinState, RelayError, RoutingRequest, TransitionActor,
    UpstreamPayload, UpstreamProvider, UpstreamRequest, should_retry,
};
use serde_json::Value;
use tracing::{error, info, warn};

/// A successful attempt and the channel that served it.
#[derive(Debug)]
pub struct RelayOutcome {
    pub channel: Arc<Channel>,
    pub payload: UpstreamPayload,
    /// 1 when the first channel answered.
    pub attempts: u32,
}

/// What one inbound request asks of the engine.
#[derive(Debug, Clone)]
pub struct RelayCall {
    /// The caller-facing request id, reused as the trace id.
    pub trace_id: String,
    pub path: String,
    pub body: Value,
    pub stream: bool,
}

pub struct RelayEngine {
    router: ChannelRouter,
    provider: Arc<dyn UpstreamProvider>,
    disable: Arc<dyn DisablePolicy>,
    events: Option<EventHub>,
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("router", &self.router)
            .finish()
    }
}

impl RelayEngine {
    pub fn new(router: ChannelRouter, provider: Arc<dyn UpstreamProvider>) -> Self {
        Self {
            router,
            provider,
            disable: Arc::new(DefaultDisablePolicy),
            events: None,
        }
    }

    pub fn with_disable_policy(mut self, disable: Arc<dyn DisablePolicy>) -> Self {
        self.disable = disable;
        self
    }

    pub fn with_events(mut self, events: EventHub) -> Self {
        self.events = Some(events);
        self
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.router
    }

    /// Runs attempts until one succeeds or the classifier stops the loop.
    ///
    /// Every failed channel is excluded from later selections. Once an
    /// attempt has failed, a routing error no longer reaches the caller: the
    /// last upstream error does.
    pub async fn relay(
        &self,
        call: &RelayCall,
        routing: &mut RoutingRequest,
    ) -> Result<RelayOutcome, RelayError> {
        let mut last_err: Option<RelayError> = None;
        let mut attempt_no = 0u32;

        loop {
            let channel = match self.router.select_channel(routing) {
                Ok(channel) => channel,
                Err(route_err) => {
                    if let Some(err) = last_err {
                        warn!(
                            event = "relay_exhausted",
                            trace_id = %call.trace_id,
                            attempts = attempt_no,
                            reason = %route_err,
                        );
                        return Err(err);
                    }
                    return Err(route_err.into());
                }
            };
            attempt_no += 1;

            let request = UpstreamRequest {
                trace_id: call.trace_id.clone(),
                channel: channel.clone(),
                path: call.path.clone(),
                body: map_model(&call.body, channel.upstream_model(&routing.model)),
                stream: call.stream,
            };
            info!(
                event = "upstream_attempt",
                trace_id = %call.trace_id,
                attempt_no,
                channel_id = channel.id,
                kind = channel.kind.as_str(),
                model = %routing.model,
            );

            let err = match self.provider.call(request).await {
                Ok(payload) => {
                    return Ok(RelayOutcome {
                        channel,
                        payload,
                        attempts: attempt_no,
                    });
                }
                Err(err) => err,
            };

            error!(
                event = "relay_attempt_failed",
                trace_id = %call.trace_id,
                channel_id = channel.id,
                status = err.status,
                "relay error (channel {}): {}",
                channel.label(),
                err.message
            );
            self.maybe_disable(&channel, &err).await;

            let will_retry = should_retry(&err, channel.kind, PinState::from(&*routing));
            self.emit_attempt_failed(call, routing, &channel, &err, attempt_no, will_retry)
                .await;
            if !will_retry {
                return Err(err);
            }
            routing.exclude(channel.id);
            last_err = Some(err);
        }
    }

    async fn maybe_disable(&self, channel: &Channel, err: &RelayError) {
        let Some(reason) = self.disable.should_disable(channel.kind, err) else {
            return;
        };
        if let Err(registry_err) = self
            .router
            .registry()
            .set_status(
                channel.id,
                ChannelStatus::AutoDisabled,
                reason,
                TransitionActor::System,
            )
            .await
        {
            warn!(
                event = "channel_disable_failed",
                channel_id = channel.id,
                error = %registry_err,
            );
        }
    }

    async fn emit_attempt_failed(
        &self,
        call: &RelayCall,
        routing: &RoutingRequest,
        channel: &Channel,
        err: &RelayError,
        attempt_no: u32,
        will_retry: bool,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        events
            .emit(Event::Upstream(AttemptFailedEvent {
                trace_id: call.trace_id.clone(),
                at: SystemTime::now(),
                attempt_no,
                channel_id: channel.id,
                channel_name: channel.name.clone(),
                channel_kind: channel.kind,
                model: routing.model.clone(),
                status: err.status,
                message: err.message.clone(),
                local: err.is_local(),
                will_retry,
            }))
            .await;
    }
}

/// Rewrites the body's `model` for one channel. Non-object bodies pass as-is.
fn map_model(body: &Value, upstream_model: &str) -> Value {
    let mut body = body.clone();
    if let Value::Object(map) = &mut body {
        map.insert("model".to_string(), Value::String(upstream_model.to_string()));
    }
    body
}
