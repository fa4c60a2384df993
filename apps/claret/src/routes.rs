use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use claret_common::ProxyError;
use claret_core::PipelineOutput;
use claret_protocol::messages::MessagesRequest;

use crate::state::AppState;

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";
const REQUEST_ID_HEADER: &str = "x-claret-request-id";

pub fn public_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/models", get(models))
        .with_state(state)
}

async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    if let Err(err) = authorize_client(&state, &headers) {
        state.stats.record(false, true);
        return error_response(&err, &trace_id);
    }
    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            state.stats.record(false, true);
            return error_response(
                &ProxyError::InvalidRequest(format!("malformed body: {err}")),
                &trace_id,
            );
        }
    };
    let wants_stream = request.wants_stream();
    info!(
        event = "request_received",
        trace_id = %trace_id,
        model = %request.model,
        is_stream = wants_stream,
        messages = request.messages.len()
    );

    match state.pipeline.run(request).await {
        Ok(PipelineOutput::Json(response)) => {
            state.stats.record(false, false);
            json_response(StatusCode::OK, &response, &trace_id)
        }
        Ok(PipelineOutput::Stream(frames)) => {
            state.stats.record(true, false);
            sse_response(frames, &trace_id)
        }
        Err(err) => {
            state.stats.record(wants_stream, true);
            info!(
                event = "request_failed",
                trace_id = %trace_id,
                code = err.code(),
                status = err.status()
            );
            error_response(&err, &trace_id)
        }
    }
}

async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    if let Err(err) = authorize_client(&state, &headers) {
        return error_response(&err, &trace_id);
    }
    let request: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                &ProxyError::InvalidRequest(format!("malformed body: {err}")),
                &trace_id,
            );
        }
    };
    match state.services.counter.count_request(&request) {
        Ok(input_tokens) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "input_tokens": input_tokens }),
            &trace_id,
        ),
        Err(err) => error_response(&err, &trace_id),
    }
}

async fn models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    if let Err(err) = authorize_client(&state, &headers) {
        return error_response(&err, &trace_id);
    }
    let settings = state.services.settings.load();
    let web_enabled = state.services.transport.web_enabled();
    let data: Vec<serde_json::Value> = served_models()
        .iter()
        .map(|model| {
            serde_json::json!({
                "id": model,
                "type": "model",
                "web_available": web_enabled && settings.web_model_enabled(model),
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        &serde_json::json!({ "data": data, "has_more": false }),
        &trace_id,
    )
}

fn served_models() -> &'static [&'static str] {
    &[
        "claude-3-opus-20240229",
        "claude-3-5-sonnet-20241022",
        "claude-3-7-sonnet-20250219",
        "claude-3-5-haiku-20241022",
    ]
}

/// The key must arrive as `x-api-key` or a bearer token and be present in
/// the configured client key set.
pub fn authorize_client(state: &AppState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let settings = state.services.settings.load();
    let presented = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::to_string)
        });
    match presented {
        Some(key) if settings.client_keys.iter().any(|k| *k == key) => Ok(()),
        _ => Err(ProxyError::Unauthorized),
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T, trace_id: &str) -> Response {
    let mut response = (status, axum::Json(serde_json::to_value(body).unwrap_or_default()))
        .into_response();
    attach_trace_id(&mut response, trace_id);
    response
}

fn error_response(err: &ProxyError, trace_id: &str) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, axum::Json(err.body())).into_response();
    if let Some(seconds) = err.retry_after()
        && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    attach_trace_id(&mut response, trace_id);
    response
}

fn sse_response(frames: tokio::sync::mpsc::Receiver<Bytes>, trace_id: &str) -> Response {
    let frames = wrap_with_heartbeat(frames);
    let stream = ReceiverStream::new(frames).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    // Hint common reverse proxies to avoid buffering SSE responses.
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    attach_trace_id(&mut response, trace_id);
    response
}

fn attach_trace_id(response: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}

/// Interleave keepalive comments whenever the event stream goes quiet.
fn wrap_with_heartbeat(
    mut upstream: tokio::sync::mpsc::Receiver<Bytes>,
) -> tokio::sync::mpsc::Receiver<Bytes> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate tick; the first heartbeat comes after a full
        // quiet interval.
        ticker.tick().await;
        loop {
            tokio::select! {
                maybe_frame = upstream.recv() => {
                    let Some(frame) = maybe_frame else {
                        break;
                    };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}
