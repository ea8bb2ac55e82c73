//! Delivers a successful upstream payload to the caller and mirrors what was
//! delivered into the capture scope.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use relayhub_protocol::sse::{DONE_FRAME, encode_data_frame};
use relayhub_provider_core::headers::end_to_end;
use relayhub_provider_core::{
    CaptureScope, CaptureValue, CapturedResponse, CustomPayload, Headers, RawResponse, RelayError,
    StreamEnd, StreamFraming, StreamHandle, UpstreamPayload, header_get,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::log::RelayLog;

const BODY_BUFFER: usize = 32;

/// Turns `payload` into the caller's response.
///
/// Buffered modes log before returning. Streams log from the pump task once
/// the last frame went out or the caller left.
pub async fn dispatch(
    payload: UpstreamPayload,
    scope: CaptureScope,
    log: RelayLog,
) -> Result<Response, RelayError> {
    match payload {
        UpstreamPayload::Json(value) => {
            let response = dispatch_json(&value, &scope)?;
            log.complete(scope, response.status().as_u16()).await;
            Ok(response)
        }
        UpstreamPayload::Stream(handle) => Ok(dispatch_stream(handle, scope, log)),
        UpstreamPayload::Custom(custom) => {
            let response = dispatch_custom(custom, &scope);
            log.complete(scope, response.status().as_u16()).await;
            Ok(response)
        }
        UpstreamPayload::Raw(raw) => {
            let response = dispatch_raw(raw, &scope);
            log.complete(scope, response.status().as_u16()).await;
            Ok(response)
        }
    }
}

pub fn dispatch_json(value: &serde_json::Value, scope: &CaptureScope) -> Result<Response, RelayError> {
    let body = serde_json::to_vec(value)
        .map_err(|err| RelayError::local(500, format!("serialize response: {err}")))?;
    scope.put(CaptureValue::FullResponse(CapturedResponse::Json(
        String::from_utf8_lossy(&body).into_owned(),
    )));

    let mut resp = Response::new(Body::from(body));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(resp)
}

pub fn dispatch_custom(custom: CustomPayload, scope: &CaptureScope) -> Response {
    scope.put(CaptureValue::FullResponse(CapturedResponse::Custom {
        content_type: header_get(&custom.headers, "content-type").map(str::to_string),
        body: custom.body.clone(),
    }));

    let mut resp = Response::new(Body::from(custom.body));
    apply_headers(resp.headers_mut(), &custom.headers);
    resp
}

pub fn dispatch_raw(raw: RawResponse, scope: &CaptureScope) -> Response {
    let headers = end_to_end(&raw.headers);
    scope.put(CaptureValue::FullResponse(CapturedResponse::Raw {
        status: raw.status,
        headers: headers.clone(),
        body: raw.body.clone(),
    }));

    let mut resp = Response::new(Body::from(raw.body));
    *resp.status_mut() = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY);
    apply_headers(resp.headers_mut(), &headers);
    resp
}

pub fn dispatch_stream(handle: StreamHandle, scope: CaptureScope, log: RelayLog) -> Response {
    let framing = handle.framing;
    let content_type = handle.content_type.clone();
    scope.put(CaptureValue::FullResponse(CapturedResponse::Stream {
        transcript: String::new(),
        no_cache: false,
    }));

    let (tx, rx) = mpsc::channel::<Bytes>(BODY_BUFFER);
    tokio::spawn(async move {
        let outcome = pump_stream(handle, &scope, &tx, &log.request_id).await;
        debug!(
            event = "stream_pump_finished",
            request_id = %log.request_id,
            outcome = ?outcome,
        );
        if outcome != PumpOutcome::Completed {
            scope.store().mark_no_cache(scope.token());
        }
        drop(tx);
        log.complete(scope, StatusCode::OK.as_u16()).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut resp = Response::new(Body::from_stream(stream));
    let headers = resp.headers_mut();
    let content_type = match (framing, content_type) {
        (StreamFraming::Raw, Some(content_type)) => HeaderValue::from_str(&content_type)
            .unwrap_or(HeaderValue::from_static("text/event-stream")),
        _ => HeaderValue::from_static("text/event-stream"),
    };
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    resp
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpOutcome {
    Completed,
    UpstreamFailed,
    CallerGone,
}

/// Forwards frames in arrival order, then the terminal frames.
///
/// The end signal is only polled once the data channel is drained, so a
/// frame sent before `finish` is never overtaken by the end.
async fn pump_stream(
    mut handle: StreamHandle,
    scope: &CaptureScope,
    tx: &mpsc::Sender<Bytes>,
    request_id: &str,
) -> PumpOutcome {
    let framing = handle.framing;
    let mut data_open = true;

    let end = loop {
        tokio::select! {
            biased;
            _ = tx.closed() => return PumpOutcome::CallerGone,
            frame = handle.data.recv(), if data_open => match frame {
                Some(frame) => {
                    let text = frame_text(framing, &frame);
                    if !forward(scope, tx, text).await {
                        return PumpOutcome::CallerGone;
                    }
                }
                None => data_open = false,
            },
            end = &mut handle.end, if !data_open => {
                break end.unwrap_or_else(|_| {
                    StreamEnd::Error(RelayError::upstream(502, "upstream stream ended without a terminal signal"))
                });
            }
        }
    };

    let outcome = match end {
        StreamEnd::Error(err) => {
            warn!(
                event = "stream_upstream_failed",
                status = err.status,
                message = %err.message,
            );
            if framing == StreamFraming::Sse {
                let message = err.render_for_caller(request_id).body.to_string();
                if tx.send(Bytes::from(encode_data_frame(&message))).await.is_err() {
                    return PumpOutcome::CallerGone;
                }
            }
            PumpOutcome::UpstreamFailed
        }
        StreamEnd::Done => {
            if let Some(trailer) = handle.finalizer.take().and_then(|finalizer| finalizer())
                && !trailer.is_empty()
                && !forward(scope, tx, frame_text(framing, &trailer)).await
            {
                return PumpOutcome::CallerGone;
            }
            PumpOutcome::Completed
        }
    };

    if framing == StreamFraming::Sse && !forward(scope, tx, DONE_FRAME.to_string()).await {
        return PumpOutcome::CallerGone;
    }
    outcome
}

fn frame_text(framing: StreamFraming, frame: &str) -> String {
    match framing {
        StreamFraming::Sse => encode_data_frame(frame),
        StreamFraming::Raw => frame.to_string(),
    }
}

/// Writes one chunk to the caller, then mirrors it. False once the caller
/// is gone.
async fn forward(scope: &CaptureScope, tx: &mpsc::Sender<Bytes>, text: String) -> bool {
    let sent = tx.send(Bytes::from(text.clone())).await.is_ok();
    if sent {
        scope.store().append_stream(scope.token(), &text);
    }
    sent
}

fn apply_headers(target: &mut HeaderMap, headers: &Headers) {
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        target.append(name, value);
    }
}
