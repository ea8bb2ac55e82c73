use std::sync::Arc;
use std::time::Duration;

use relayhub_provider_core::{
    CaptureKind, CaptureStore, CaptureToken, CaptureValue, CapturedResponse, Event, EventHub,
    OperationalEvent,
};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_see_each_other() {
    let store = Arc::new(CaptureStore::new());
    let mut tasks = Vec::new();

    for request in 0..64 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let scope = store.open_scope();
            scope.put(CaptureValue::RequestBody(format!("body-{request}")));
            scope.put(CaptureValue::ClientIp(format!("10.0.0.{request}")));
            for frame in 0..20 {
                store.append_stream(scope.token(), &format!("data: {request}-{frame}\n\n"));
                tokio::task::yield_now().await;
            }

            assert_eq!(scope.take_request_body(), Some(format!("body-{request}")));
            assert_eq!(scope.take_client_ip(), Some(format!("10.0.0.{request}")));
            let Some(CapturedResponse::Stream { transcript, no_cache }) = scope.take_response()
            else {
                panic!("missing transcript for request {request}");
            };
            assert!(!no_cache);
            let expected: String = (0..20)
                .map(|frame| format!("data: {request}-{frame}\n\n"))
                .collect();
            assert_eq!(transcript, expected);
            assert_eq!(scope.take(CaptureKind::FullResponse), None);
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert!(store.is_empty());
}

#[tokio::test]
async fn unknown_and_cleared_tokens_are_not_found() {
    let store = Arc::new(CaptureStore::new());
    assert_eq!(
        store.take_and_clear(CaptureToken::new(), CaptureKind::RequestBody),
        None
    );

    let scope = store.open_scope();
    let token = scope.token();
    scope.put(CaptureValue::FullResponse(CapturedResponse::Json("{}".to_string())));
    assert!(store.take_and_clear(token, CaptureKind::FullResponse).is_some());
    assert_eq!(store.take_and_clear(token, CaptureKind::FullResponse), None);
    drop(scope);
    assert_eq!(store.take_and_clear(token, CaptureKind::FullResponse), None);
}

#[tokio::test]
async fn sweeper_reports_leaked_slots() {
    let hub = EventHub::new(8);
    let mut rx = hub.subscribe();
    let store = Arc::new(CaptureStore::new().with_events(hub));
    let leaked = CaptureToken::new();
    store.store(leaked, CaptureValue::RequestBody("orphan".to_string()));

    let sweeper = store.spawn_sweeper(Duration::from_millis(10), Duration::from_millis(20));
    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let Event::Operational(OperationalEvent::CaptureLeaked(leak)) = event else {
        panic!("expected a capture leak event");
    };
    assert_eq!(leak.token, leaked.to_string());
    assert_eq!(leak.fields, vec!["RequestBody".to_string()]);
    assert!(store.is_empty());
    sweeper.abort();
}
