use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use relayhub_provider_core::{
    Channel, ChannelId, ChannelKind, ChannelRegistry, ChannelRouter, ChannelStatus,
    DefaultDisablePolicy, DisablePolicy, Event, EventHub, MemoryChannelRegistry,
    OperationalEvent, RelayError, RouteError, RoutingRequest, SelectionPolicy, TransitionActor,
};
use tokio::time::timeout;

fn channel(id: ChannelId, kind: ChannelKind) -> Channel {
    Channel {
        id,
        name: format!("channel-{id}"),
        kind,
        status: ChannelStatus::Enabled,
        groups: BTreeSet::from(["default".to_string()]),
        models: BTreeMap::from([("gpt-4o".to_string(), String::new())]),
        weight: 1,
        base_url: "https://upstream.invalid".to_string(),
        api_key: "sk-test".to_string(),
    }
}

#[tokio::test]
async fn disable_is_visible_to_the_next_selection() {
    let hub = EventHub::new(8);
    let mut rx = hub.subscribe();
    let registry = Arc::new(
        MemoryChannelRegistry::new(vec![channel(1, ChannelKind::OpenAI), channel(2, ChannelKind::OpenAI)])
            .unwrap()
            .with_events(hub),
    );
    let router = ChannelRouter::new(registry.clone(), SelectionPolicy::round_robin());

    let mut request = RoutingRequest::new("gpt-4o", "default");
    let first = router.select_channel(&mut request).unwrap();
    assert_eq!(first.id, 1);

    let failure = RelayError::upstream(401, "Incorrect API key provided");
    let reason = DefaultDisablePolicy
        .should_disable(first.kind, &failure)
        .expect("401 disables");
    registry
        .set_status(first.id, ChannelStatus::AutoDisabled, reason, TransitionActor::System)
        .await
        .unwrap();

    for _ in 0..4 {
        let mut next = RoutingRequest::new("gpt-4o", "default");
        assert_eq!(router.select_channel(&mut next).unwrap().id, 2);
    }

    let event = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let Event::Operational(OperationalEvent::ChannelStatusChanged(transition)) = event else {
        panic!("expected a status transition event");
    };
    assert_eq!(transition.channel_id, 1);
    assert_eq!(transition.from, ChannelStatus::Enabled);
    assert_eq!(transition.to, ChannelStatus::AutoDisabled);
    assert_eq!(transition.actor, TransitionActor::System);
    assert!(transition.reason.contains("401"));
}

#[tokio::test]
async fn filtered_to_nothing_is_an_operator_error() {
    let registry = MemoryChannelRegistry::new(vec![
        channel(1, ChannelKind::OpenAI),
        channel(2, ChannelKind::Anthropic),
    ])
    .unwrap();
    let router = ChannelRouter::new(Arc::new(registry), SelectionPolicy::weighted_random(Some(1)));

    let mut request = RoutingRequest::new("gpt-4o", "default");
    request.exclude(1);
    request.exclude(2);
    let err = router.select_channel(&mut request).unwrap_err();
    assert!(matches!(err, RouteError::Inconsistent { .. }));
    assert_ne!(
        err,
        RouteError::NoAvailableChannel {
            group: "default".to_string(),
            model: "gpt-4o".to_string(),
        }
    );

    let mut unknown = RoutingRequest::new("gpt-4o", "vip");
    assert!(matches!(
        router.select_channel(&mut unknown).unwrap_err(),
        RouteError::NoAvailableChannel { .. }
    ));
}
