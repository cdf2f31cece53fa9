use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::adapter;
use crate::config::RelayConfig;
use crate::fingerprint::Fingerprint;
use crate::translate::{self, ChunkContext, StreamOutcome};
use crate::types::ChatCompletionRequest;
use crate::upstream::UpstreamClient;
use crate::RelayError;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct RelayState {
    config: Arc<RelayConfig>,
    upstream: UpstreamClient,
    json_logs: bool,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let config = Arc::new(config);
        let upstream = UpstreamClient::new(config.clone());
        Self {
            config,
            upstream,
            json_logs: false,
        }
    }

    pub fn with_json_logs(mut self) -> Self {
        self.json_logs = true;
        self
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(ready))
        .route("/health", get(health))
        .route("/v1/models", get(list_models).options(preflight))
        .route("/v1/chat/completions", post(chat_completions).options(preflight))
        .fallback(not_found)
        .with_state(state)
}

async fn ready() -> impl IntoResponse {
    (cors_headers(), "free2gpt relay ready")
}

async fn health() -> impl IntoResponse {
    (cors_headers(), Json(json!({ "status": "ok" })))
}

async fn preflight() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, cors_headers())
}

async fn not_found() -> Response {
    openai_error(
        StatusCode::NOT_FOUND,
        "invalid_request_error",
        "unknown_route",
        "unknown route",
        "",
    )
}

async fn list_models(State(state): State<RelayState>) -> impl IntoResponse {
    let data = state
        .config
        .models
        .iter()
        .map(|id| json!({ "id": id, "object": "model", "owned_by": "free2gpt" }))
        .collect::<Vec<_>>();
    (cors_headers(), Json(json!({ "object": "list", "data": data })))
}

async fn chat_completions(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = generate_request_id();

    if !authorized(&state, &headers) {
        emit_json_log(
            state.json_logs,
            "relay.unauthorized",
            json!({ "request_id": &request_id }),
        );
        return openai_error(
            StatusCode::UNAUTHORIZED,
            "invalid_request_error",
            "invalid_api_key",
            "missing or invalid API key",
            &request_id,
        );
    }

    let request = match serde_json::from_slice::<ChatCompletionRequest>(&body) {
        Ok(request) => request,
        Err(err) => {
            return openai_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
                format!("request body is not a valid chat completion request: {err}"),
                &request_id,
            );
        }
    };

    let stream_requested = request.stream.unwrap_or(false);

    emit_json_log(
        state.json_logs,
        "relay.request",
        json!({
            "request_id": &request_id,
            "model": request.model.as_deref().unwrap_or_default(),
            "messages": request.messages.len(),
            "stream": stream_requested,
        }),
    );

    let adapted = match adapter::adapt(&request, &state.config) {
        Ok(adapted) => adapted,
        Err(err) => {
            emit_json_log(
                state.json_logs,
                "relay.error",
                json!({ "request_id": &request_id, "stage": "adapt", "error": err.to_string() }),
            );
            return error_from(&err, &request_id);
        }
    };

    let fingerprint = Fingerprint::random(&state.config);
    let response = match state.upstream.generate(&adapted.payload, &fingerprint).await {
        Ok(response) => response,
        Err(err) => {
            emit_json_log(
                state.json_logs,
                "relay.error",
                json!({ "request_id": &request_id, "stage": "upstream", "error": err.to_string() }),
            );
            return error_from(&err, &request_id);
        }
    };

    emit_json_log(
        state.json_logs,
        "relay.upstream",
        json!({ "request_id": &request_id, "status": response.status().as_u16() }),
    );

    let ctx = ChunkContext {
        request_id: request_id.clone(),
        model: adapted.model.clone(),
        created: epoch_seconds(),
    };
    let body_stream = translate::upstream_byte_stream(response);

    if stream_requested {
        let (events, pump) = translate::chat_completions_sse(body_stream, ctx);

        let json_logs = state.json_logs;
        tokio::spawn(async move {
            match pump.await {
                Ok(StreamOutcome::Completed { chunks }) => emit_json_log(
                    json_logs,
                    "relay.stream_closed",
                    json!({ "request_id": &request_id, "chunks": chunks }),
                ),
                Ok(StreamOutcome::Interrupted { reason }) => emit_json_log(
                    json_logs,
                    "relay.stream_broken",
                    json!({ "request_id": &request_id, "reason": reason }),
                ),
                Ok(StreamOutcome::Disconnected) => emit_json_log(
                    json_logs,
                    "relay.client_gone",
                    json!({ "request_id": &request_id }),
                ),
                Err(err) => emit_json_log(
                    json_logs,
                    "relay.stream_panic",
                    json!({ "request_id": &request_id, "error": err.to_string() }),
                ),
            }
        });

        let mut headers = cors_headers();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        let mut response = Response::new(Body::from_stream(events));
        *response.headers_mut() = headers;
        response
    } else {
        match translate::collect_text(body_stream).await {
            Ok(text) => {
                emit_json_log(
                    state.json_logs,
                    "relay.response",
                    json!({ "request_id": &request_id, "chars": text.chars().count() }),
                );
                let payload = translate::chat_completion_json(&ctx, &text, adapted.prompt_chars);
                (cors_headers(), Json(payload)).into_response()
            }
            Err(err) => {
                emit_json_log(
                    state.json_logs,
                    "relay.error",
                    json!({ "request_id": &request_id, "stage": "collect", "error": err.to_string() }),
                );
                error_from(&err, &request_id)
            }
        }
    }
}

fn authorized(state: &RelayState, headers: &HeaderMap) -> bool {
    let key = state.config.api_key.trim();
    if key.is_empty() {
        return true;
    }
    extract_bearer(headers).is_some_and(|token| token == key)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

fn error_from(err: &RelayError, request_id: &str) -> Response {
    let (status, kind, code, message) = translate::map_relay_error(err);
    openai_error(status, kind, code, message, request_id)
}

fn openai_error(
    status: StatusCode,
    kind: &'static str,
    code: &'static str,
    message: impl std::fmt::Display,
    request_id: &str,
) -> Response {
    let body = json!({
        "error": {
            "message": message.to_string(),
            "type": kind,
            "code": code,
            "param": request_id,
        }
    });
    (status, cors_headers(), Json(body)).into_response()
}

fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("chatcmpl-{ts_ms}-{seq}")
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn emit_json_log(enabled: bool, event: &str, payload: Value) {
    if !enabled {
        return;
    }
    let record = json!({
        "ts_ms": SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0),
        "event": event,
        "payload": payload,
    });
    eprintln!("{record}");
}
