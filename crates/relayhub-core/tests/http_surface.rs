mod support;

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use relayhub_core::{Core, LogSink, RelayEngine};
use relayhub_provider_core::{
    CaptureStore, ChannelKind, ChannelRegistry, ChannelRouter, MemoryChannelRegistry, RelayError,
    SelectionPolicy, StreamEnd, StreamFraming,
};
use serde_json::{Value, json};
use tower::ServiceExt;

use support::{MemoryLogSink, Reply, ScriptedProvider, channel, send_report};

const ADMIN_KEY: &str = "admin-secret";

struct Harness {
    core: Core,
    capture: Arc<CaptureStore>,
    logs: Arc<MemoryLogSink>,
    provider: Arc<ScriptedProvider>,
}

fn harness(provider: ScriptedProvider) -> Harness {
    let registry: Arc<dyn ChannelRegistry> = Arc::new(
        MemoryChannelRegistry::new(vec![
            channel(1, ChannelKind::OpenAI, 1),
            channel(2, ChannelKind::OpenAI, 1),
        ])
        .unwrap(),
    );
    let provider = Arc::new(provider);
    let engine = RelayEngine::new(
        ChannelRouter::new(registry, SelectionPolicy::round_robin()),
        provider.clone(),
    );
    let capture = Arc::new(CaptureStore::new());
    let logs = Arc::new(MemoryLogSink::default());
    let sink: Arc<dyn LogSink> = logs.clone();
    let core = Core::new(engine, capture.clone(), Some(sink), "default", ADMIN_KEY);
    Harness {
        core,
        capture,
        logs,
        provider,
    }
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-request-id", "req-1")
        .header("x-forwarded-for", "198.51.100.7")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

#[tokio::test]
async fn buffered_json_is_returned_and_logged() {
    let h = harness(ScriptedProvider::new().reply(
        1,
        Reply::Json(json!({
            "id": "c1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi", "reasoning_content": "think"}}]
        })),
    ));

    let response = h
        .core
        .router()
        .oneshot(chat_request(json!({"model": "gpt-4o", "messages": []})))
        .await
        .expect("router call");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.headers()["x-request-id"], "req-1");
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["choices"][0]["message"]["reasoning_content"], "think");

    let entries = h.logs.wait_for(1).await;
    let entry = &entries[0];
    assert_eq!(entry.request_id, "req-1");
    assert_eq!(entry.channel_id, 1);
    assert_eq!(entry.client_ip.as_deref(), Some("198.51.100.7"));
    assert!(!entry.no_cache);
    assert!(entry.content.contains("【Request Body】:\n{\"messages\":[],\"model\":\"gpt-4o\"}")
        || entry.content.contains("【Request Body】:\n{\"model\":\"gpt-4o\",\"messages\":[]}"));
    assert!(entry.content.contains("\"type\": \"json\""));
    assert!(entry.content.contains("<thinking>think</thinking>\\n\\nhi"));
    assert!(h.capture.is_empty());
    assert_eq!(h.provider.trace_ids(), vec!["req-1".to_string()]);
}

#[tokio::test]
async fn stream_frames_are_forwarded_in_order_then_done() {
    let frames = vec![
        r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#.to_string(),
        r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"lo"}}]}"#.to_string(),
        r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#.to_string(),
    ];
    let h = harness(
        ScriptedProvider::new().reply(1, Reply::Stream(frames.clone(), StreamEnd::Done)),
    );

    let response = h
        .core
        .router()
        .oneshot(chat_request(
            json!({"model": "gpt-4o", "messages": [], "stream": true}),
        ))
        .await
        .expect("router call");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert_eq!(response.headers()["x-accel-buffering"], "no");

    let text = body_text(response).await;
    let expected: String = frames
        .iter()
        .map(|frame| format!("data: {frame}\n\n"))
        .chain(std::iter::once("data: [DONE]\n\n".to_string()))
        .collect();
    assert_eq!(text, expected);

    let entries = h.logs.wait_for(1).await;
    assert!(!entries[0].no_cache);
    assert!(entries[0].content.contains("\"type\": \"stream\""));
    assert!(entries[0].content.contains("\"content\": \"Hello\""));
    assert!(entries[0].content.contains("\"finish_reason\": \"stop\""));
}

#[tokio::test]
async fn stream_error_sends_an_error_frame_and_marks_no_cache() {
    let h = harness(ScriptedProvider::new().reply(
        1,
        Reply::Stream(
            vec![r#"{"choices":[{"index":0,"delta":{"content":"par"}}]}"#.to_string()],
            StreamEnd::Error(RelayError::upstream(502, "upstream reset")),
        ),
    ));

    let response = h
        .core
        .router()
        .oneshot(chat_request(
            json!({"model": "gpt-4o", "messages": [], "stream": true}),
        ))
        .await
        .expect("router call");
    let text = body_text(response).await;

    let mut events = text.split("\n\n").filter(|event| !event.is_empty());
    assert_eq!(
        events.next(),
        Some(r#"data: {"choices":[{"index":0,"delta":{"content":"par"}}]}"#)
    );
    let error_frame = events.next().expect("error frame");
    let error: Value = serde_json::from_str(error_frame.trim_start_matches("data: ")).unwrap();
    assert_eq!(error["error"]["message"], "upstream reset (request id: req-1)");
    assert_eq!(events.next(), Some("data: [DONE]"));
    assert_eq!(events.next(), None);

    let entries = h.logs.wait_for(1).await;
    assert!(entries[0].no_cache);
}

#[tokio::test]
async fn finalizer_trailer_precedes_done() {
    let frame = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":"stop"}]}"#;
    let trailer = r#"{"id":"c1","choices":[],"usage":{"total_tokens":3}}"#;
    let h = harness(ScriptedProvider::new().reply(
        1,
        Reply::Framed {
            frames: vec![frame.to_string()],
            framing: StreamFraming::Sse,
            content_type: None,
            trailer: Some(trailer.to_string()),
        },
    ));

    let response = h
        .core
        .router()
        .oneshot(chat_request(
            json!({"model": "gpt-4o", "messages": [], "stream": true}),
        ))
        .await
        .expect("router call");
    assert_eq!(
        body_text(response).await,
        format!("data: {frame}\n\ndata: {trailer}\n\ndata: [DONE]\n\n")
    );

    let entries = h.logs.wait_for(1).await;
    assert!(!entries[0].no_cache);
    assert!(entries[0].content.contains("\"content\": \"Hi\""));
    assert!(entries[0].content.contains("\"total_tokens\": 3"));
}

#[tokio::test]
async fn raw_framed_streams_keep_event_lines_and_skip_done() {
    let frames = vec![
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"role\":\"assistant\",\"model\":\"claude\"}}\n\n".to_string(),
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n".to_string(),
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".to_string(),
    ];
    let h = harness(ScriptedProvider::new().reply(
        1,
        Reply::Framed {
            frames: frames.clone(),
            framing: StreamFraming::Raw,
            content_type: Some("text/event-stream; charset=utf-8".to_string()),
            trailer: None,
        },
    ));

    let response = h
        .core
        .router()
        .oneshot(chat_request(
            json!({"model": "gpt-4o", "messages": [], "stream": true}),
        ))
        .await
        .expect("router call");
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream; charset=utf-8"
    );
    let text = body_text(response).await;
    assert_eq!(text, frames.concat());
    assert!(!text.contains("[DONE]"));

    let entries = h.logs.wait_for(1).await;
    assert!(entries[0].content.contains("\"type\": \"message\""));
    assert!(entries[0].content.contains("\"text\": \"Hi\""));
}

#[tokio::test]
async fn caller_disconnect_stops_the_producer_and_marks_no_cache() {
    let (report, sent) = send_report();
    let h = harness(ScriptedProvider::new().reply(
        1,
        Reply::Endless(
            r#"{"choices":[{"index":0,"delta":{"content":"tick"}}]}"#.to_string(),
            report,
        ),
    ));

    let response = h
        .core
        .router()
        .oneshot(chat_request(
            json!({"model": "gpt-4o", "messages": [], "stream": true}),
        ))
        .await
        .expect("router call");
    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.expect("first chunk").expect("chunk bytes");
    assert!(first.starts_with(b"data: "));
    drop(body);

    let sent = tokio::time::timeout(std::time::Duration::from_secs(5), sent)
        .await
        .expect("producer noticed the disconnect")
        .expect("report delivered");
    assert!(!sent);

    let entries = h.logs.wait_for(1).await;
    assert!(entries[0].no_cache);
    assert!(entries[0].content.contains("tick"));
}

#[tokio::test]
async fn errors_are_rendered_with_the_request_id() {
    let h = harness(
        ScriptedProvider::new()
            .reply(1, Reply::Fail(RelayError::upstream(400, "bad input (request id: upstream-9)"))),
    );

    let response = h
        .core
        .router()
        .oneshot(chat_request(json!({"model": "gpt-4o", "messages": []})))
        .await
        .expect("router call");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["error"]["message"], "bad input (request id: req-1)");
    assert!(h.logs.entries().is_empty());
    assert!(h.capture.is_empty());
}

#[tokio::test]
async fn missing_model_is_rejected_locally() {
    let h = harness(ScriptedProvider::new());
    let response = h
        .core
        .router()
        .oneshot(chat_request(json!({"messages": []})))
        .await
        .expect("router call");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["error"]["type"], "system_error");
}

#[tokio::test]
async fn admin_routes_require_the_key_and_record_the_actor() {
    let h = harness(ScriptedProvider::new());

    let unauthorized = h
        .core
        .router()
        .oneshot(
            Request::builder()
                .uri("/admin/channels")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

    let disabled = h
        .core
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/channels/2/status")
                .header("x-admin-key", ADMIN_KEY)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"status": "manually_disabled", "reason": "maintenance", "operator": "ops"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(disabled.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(disabled).await).unwrap();
    assert_eq!(body["transition"]["to"], "manually_disabled");
    assert_eq!(body["transition"]["actor"]["admin"], "ops");

    let listing = h
        .core
        .router()
        .oneshot(
            Request::builder()
                .uri("/admin/channels")
                .header("authorization", format!("Bearer {ADMIN_KEY}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(listing.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_text(listing).await).unwrap();
    assert_eq!(body["channels"][1]["status"], "manually_disabled");
    assert!(body["channels"][1].get("api_key").is_none());
    assert_eq!(body["transitions"][0]["reason"], "maintenance");

    let missing = h
        .core
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/channels/99/status")
                .header("x-admin-key", ADMIN_KEY)
                .header("content-type", "application/json")
                .body(Body::from(json!({"status": "enabled"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
