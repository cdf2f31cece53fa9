//! Stream translator: re-frames the upstream raw text stream as
//! OpenAI-compatible output, either live SSE chunks or one buffered
//! `chat.completion` object.

use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::RelayError;
use crate::Result;
use crate::decode::Utf8Decoder;

type IoResult<T> = std::result::Result<T, std::io::Error>;

/// Hand-off depth between the upstream pump and the HTTP writer. One slot:
/// at most one decoded fragment sits between read and write.
const HANDOFF_CAPACITY: usize = 1;

/// Per-request identity stamped onto every emitted chunk.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub request_id: String,
    pub model: String,
    pub created: u64,
}

/// Terminal state of the streaming pump, observable via its join handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Upstream drained cleanly; the stop chunk and end-marker were emitted.
    Completed { chunks: u64 },
    /// Upstream failed mid-stream; the error chunk was emitted in-band.
    Interrupted { reason: String },
    /// The client went away; emission stopped early.
    Disconnected,
}

pub fn upstream_byte_stream(response: reqwest::Response) -> BoxStream<'static, IoResult<Bytes>> {
    response
        .bytes_stream()
        .map_err(std::io::Error::other)
        .boxed()
}

/// Translate the upstream byte stream into SSE chunk events. The producer
/// task and the returned stream are connected by a bounded channel, so the
/// pump is flow-controlled by the client and stops promptly when the client
/// disconnects. The channel closes on every producer exit path.
pub fn chat_completions_sse(
    body: BoxStream<'static, IoResult<Bytes>>,
    ctx: ChunkContext,
) -> (BoxStream<'static, IoResult<Bytes>>, JoinHandle<StreamOutcome>) {
    let (tx, rx) = mpsc::channel::<IoResult<Bytes>>(HANDOFF_CAPACITY);
    let handle = tokio::spawn(pump(body, ctx, tx));
    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    (events, handle)
}

async fn pump(
    mut body: BoxStream<'static, IoResult<Bytes>>,
    ctx: ChunkContext,
    tx: mpsc::Sender<IoResult<Bytes>>,
) -> StreamOutcome {
    let mut decoder = Utf8Decoder::new();
    let mut chunks = 0u64;

    while let Some(next) = body.next().await {
        let fragment = match next {
            Ok(fragment) => fragment,
            Err(err) => {
                // Headers are already committed; the failure can only be
                // reported in-band.
                let annotation = format!("\n[relay error: {err}]");
                let event = chunk_event(&ctx, delta_content(&annotation), Some("error"));
                let _ = tx.send(Ok(event)).await;
                return StreamOutcome::Interrupted {
                    reason: err.to_string(),
                };
            }
        };

        let text = decoder.push(&fragment);
        if text.is_empty() {
            // fragment ended mid-character; nothing emittable yet
            continue;
        }
        chunks += 1;
        let event = chunk_event(&ctx, delta_content(&text), None);
        if tx.send(Ok(event)).await.is_err() {
            return StreamOutcome::Disconnected;
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        chunks += 1;
        let event = chunk_event(&ctx, delta_content(&tail), None);
        if tx.send(Ok(event)).await.is_err() {
            return StreamOutcome::Disconnected;
        }
    }

    let stop = chunk_event(&ctx, Value::Object(Map::new()), Some("stop"));
    if tx.send(Ok(stop)).await.is_err() {
        return StreamOutcome::Disconnected;
    }
    if tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await.is_err() {
        return StreamOutcome::Disconnected;
    }
    StreamOutcome::Completed { chunks }
}

/// Drain the upstream body into one string, applying the same incremental
/// decoder the streaming path uses. Fails atomically: a mid-body read error
/// discards everything collected so far.
pub async fn collect_text(mut body: BoxStream<'static, IoResult<Bytes>>) -> Result<String> {
    let mut decoder = Utf8Decoder::new();
    let mut out = String::new();
    while let Some(next) = body.next().await {
        let fragment = next.map_err(|err| RelayError::StreamInterrupted(err.to_string()))?;
        out.push_str(&decoder.push(&fragment));
    }
    out.push_str(&decoder.finish());
    Ok(out)
}

/// Build the buffered `chat.completion` object. Usage counts are character
/// counts, a cheap proxy rather than real tokenization.
pub fn chat_completion_json(ctx: &ChunkContext, content: &str, prompt_chars: usize) -> Value {
    let completion_chars = content.chars().count();

    let mut message = Map::<String, Value>::new();
    message.insert("role".to_string(), Value::String("assistant".to_string()));
    message.insert("content".to_string(), Value::String(content.to_string()));

    let mut choice = Map::<String, Value>::new();
    choice.insert("index".to_string(), Value::Number(0.into()));
    choice.insert("message".to_string(), Value::Object(message));
    choice.insert(
        "finish_reason".to_string(),
        Value::String("stop".to_string()),
    );

    let mut out = Map::<String, Value>::new();
    out.insert("id".to_string(), Value::String(ctx.request_id.clone()));
    out.insert(
        "object".to_string(),
        Value::String("chat.completion".to_string()),
    );
    out.insert(
        "created".to_string(),
        Value::Number((ctx.created as i64).into()),
    );
    out.insert("model".to_string(), Value::String(ctx.model.clone()));
    out.insert(
        "choices".to_string(),
        Value::Array(vec![Value::Object(choice)]),
    );
    out.insert(
        "usage".to_string(),
        serde_json::json!({
            "prompt_tokens": prompt_chars,
            "completion_tokens": completion_chars,
            "total_tokens": prompt_chars + completion_chars,
        }),
    );
    Value::Object(out)
}

/// Map a relay error to the OpenAI error surface: HTTP status, error type,
/// machine code, message. Only valid before any output has been committed.
pub fn map_relay_error(err: &RelayError) -> (StatusCode, &'static str, &'static str, String) {
    match err {
        RelayError::InvalidRequest(reason) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "invalid_request",
            reason.clone(),
        ),
        RelayError::UpstreamRejected { status, body } => match status.as_u16() {
            403 => (
                StatusCode::FORBIDDEN,
                "api_error",
                "upstream_access_denied",
                format!("upstream access denied (403): {body}"),
            ),
            429 => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "upstream_rate_limited",
                format!("upstream rate limit (429): {body}"),
            ),
            _ => (
                StatusCode::BAD_GATEWAY,
                "api_error",
                "upstream_error",
                format!("upstream error ({status}): {body}"),
            ),
        },
        RelayError::StreamInterrupted(reason) => (
            StatusCode::BAD_GATEWAY,
            "api_error",
            "upstream_interrupted",
            format!("upstream stream interrupted: {reason}"),
        ),
        RelayError::Http(err) => (
            StatusCode::BAD_GATEWAY,
            "api_error",
            "upstream_unreachable",
            format!("upstream request failed: {err}"),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            "internal_error",
            other.to_string(),
        ),
    }
}

fn delta_content(text: &str) -> Value {
    serde_json::json!({ "content": text })
}

fn chunk_event(ctx: &ChunkContext, delta: Value, finish_reason: Option<&str>) -> Bytes {
    let mut choice = Map::<String, Value>::new();
    choice.insert("index".to_string(), Value::Number(0.into()));
    choice.insert("delta".to_string(), delta);
    choice.insert(
        "finish_reason".to_string(),
        finish_reason
            .map(|reason| Value::String(reason.to_string()))
            .unwrap_or(Value::Null),
    );

    let mut out = Map::<String, Value>::new();
    out.insert("id".to_string(), Value::String(ctx.request_id.clone()));
    out.insert(
        "object".to_string(),
        Value::String("chat.completion.chunk".to_string()),
    );
    out.insert(
        "created".to_string(),
        Value::Number((ctx.created as i64).into()),
    );
    out.insert("model".to_string(), Value::String(ctx.model.clone()));
    out.insert(
        "choices".to_string(),
        Value::Array(vec![Value::Object(choice)]),
    );

    let json = Value::Object(out).to_string();
    Bytes::from(format!("data: {json}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn ctx() -> ChunkContext {
        ChunkContext {
            request_id: "chatcmpl-test-0".to_string(),
            model: "free2gpt-general".to_string(),
            created: 1_700_000_000,
        }
    }

    fn fragments(parts: Vec<IoResult<&'static [u8]>>) -> BoxStream<'static, IoResult<Bytes>> {
        stream::iter(
            parts
                .into_iter()
                .map(|part| part.map(Bytes::from_static))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    async fn collect_events(
        mut events: BoxStream<'static, IoResult<Bytes>>,
    ) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(event) = events.next().await {
            let bytes = event.expect("event should be ok");
            let text = String::from_utf8(bytes.to_vec()).expect("event should be utf-8");
            let data = text
                .strip_prefix("data: ")
                .and_then(|rest| rest.strip_suffix("\n\n"))
                .expect("event should be SSE framed");
            out.push(data.to_string());
        }
        out
    }

    fn delta_of(event: &str) -> Value {
        let parsed: Value = serde_json::from_str(event).expect("event should be json");
        parsed["choices"][0]["delta"].clone()
    }

    fn finish_reason_of(event: &str) -> Value {
        let parsed: Value = serde_json::from_str(event).expect("event should be json");
        parsed["choices"][0]["finish_reason"].clone()
    }

    #[tokio::test]
    async fn emits_one_chunk_per_fragment_then_stop_and_done() {
        let body = fragments(vec![Ok(b"hi ".as_slice()), Ok(b"there".as_slice())]);
        let (events, handle) = chat_completions_sse(body, ctx());
        let events = collect_events(events).await;

        assert_eq!(events.len(), 4);
        assert_eq!(delta_of(&events[0])["content"], "hi ");
        assert_eq!(delta_of(&events[1])["content"], "there");
        assert_eq!(finish_reason_of(&events[0]), Value::Null);
        assert_eq!(finish_reason_of(&events[2]), "stop");
        assert_eq!(delta_of(&events[2]), serde_json::json!({}));
        assert_eq!(events[3], "[DONE]");

        let outcome = handle.await.expect("pump should not panic");
        assert_eq!(outcome, StreamOutcome::Completed { chunks: 2 });
    }

    #[tokio::test]
    async fn chunks_carry_request_identity() {
        let body = fragments(vec![Ok(b"x".as_slice())]);
        let (events, _handle) = chat_completions_sse(body, ctx());
        let events = collect_events(events).await;

        let parsed: Value = serde_json::from_str(&events[0]).expect("json");
        assert_eq!(parsed["id"], "chatcmpl-test-0");
        assert_eq!(parsed["object"], "chat.completion.chunk");
        assert_eq!(parsed["model"], "free2gpt-general");
        assert_eq!(parsed["created"], 1_700_000_000);
    }

    #[tokio::test]
    async fn character_straddling_a_fragment_boundary_is_not_split() {
        let euro = "€".as_bytes();
        let body = fragments(vec![Ok(&euro[..2]), Ok(&euro[2..])]);
        let (events, handle) = chat_completions_sse(body, ctx());
        let events = collect_events(events).await;

        // the first fragment holds no complete character, so only one
        // content chunk is emitted
        assert_eq!(events.len(), 3);
        assert_eq!(delta_of(&events[0])["content"], "€");

        let outcome = handle.await.expect("pump should not panic");
        assert_eq!(outcome, StreamOutcome::Completed { chunks: 1 });
    }

    #[tokio::test]
    async fn delta_concatenation_matches_the_full_decoded_body() {
        let text = "héllo wörld 😀";
        let bytes = text.as_bytes().to_vec();
        for split in [1usize, 3, 7, bytes.len() - 1] {
            let (head, tail) = bytes.split_at(split);
            let body = stream::iter(vec![
                Ok(Bytes::copy_from_slice(head)),
                Ok(Bytes::copy_from_slice(tail)),
            ])
            .boxed();
            let (events, _handle) = chat_completions_sse(body, ctx());
            let events = collect_events(events).await;

            let mut assembled = String::new();
            for event in &events[..events.len() - 2] {
                if let Some(content) = delta_of(event)["content"].as_str() {
                    assembled.push_str(content);
                }
            }
            assert_eq!(assembled, text, "split at byte {split}");
        }
    }

    #[tokio::test]
    async fn dangling_partial_character_at_end_of_stream_is_flushed() {
        let euro = "€".as_bytes();
        let body = fragments(vec![Ok(b"ok".as_slice()), Ok(&euro[..2])]);
        let (events, handle) = chat_completions_sse(body, ctx());
        let events = collect_events(events).await;

        assert_eq!(delta_of(&events[0])["content"], "ok");
        assert_eq!(delta_of(&events[1])["content"], "\u{FFFD}");
        assert_eq!(finish_reason_of(&events[2]), "stop");

        let outcome = handle.await.expect("pump should not panic");
        assert_eq!(outcome, StreamOutcome::Completed { chunks: 2 });
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_terminal_error_chunk_without_done() {
        let body = fragments(vec![
            Ok(b"partial".as_slice()),
            Err(std::io::Error::other("connection reset")),
        ]);
        let (events, handle) = chat_completions_sse(body, ctx());
        let events = collect_events(events).await;

        assert_eq!(events.len(), 2);
        assert_eq!(delta_of(&events[0])["content"], "partial");

        let last = &events[1];
        assert_eq!(finish_reason_of(last), "error");
        let content = delta_of(last)["content"]
            .as_str()
            .expect("error chunk should carry an annotation")
            .to_string();
        assert!(content.contains("connection reset"));
        assert_ne!(events.last().map(String::as_str), Some("[DONE]"));

        let outcome = handle.await.expect("pump should not panic");
        assert!(matches!(outcome, StreamOutcome::Interrupted { reason } if reason.contains("connection reset")));
    }

    #[tokio::test]
    async fn client_disconnect_stops_the_pump() {
        let body = stream::iter(
            std::iter::repeat_with(|| Ok(Bytes::from_static(b"spam"))).take(64),
        )
        .boxed();
        let (mut events, handle) = chat_completions_sse(body, ctx());

        let first = events.next().await.expect("first event");
        assert!(first.is_ok());
        drop(events);

        let outcome = handle.await.expect("pump should not panic");
        assert_eq!(outcome, StreamOutcome::Disconnected);
    }

    #[tokio::test]
    async fn collect_text_drains_the_full_body() {
        let body = fragments(vec![Ok(b"hi ".as_slice()), Ok(b"there".as_slice())]);
        let text = collect_text(body).await.expect("collect should succeed");
        assert_eq!(text, "hi there");
    }

    #[tokio::test]
    async fn collect_text_decodes_across_fragment_boundaries() {
        let bytes = "déjà vu".as_bytes();
        let body = stream::iter(vec![
            Ok(Bytes::copy_from_slice(&bytes[..2])),
            Ok(Bytes::copy_from_slice(&bytes[2..])),
        ])
        .boxed();
        let text = collect_text(body).await.expect("collect should succeed");
        assert_eq!(text, "déjà vu");
    }

    #[tokio::test]
    async fn collect_text_fails_atomically_on_mid_body_errors() {
        let body = fragments(vec![
            Ok(b"partial".as_slice()),
            Err(std::io::Error::other("connection reset")),
        ]);
        let err = collect_text(body).await.expect_err("collect should fail");
        assert!(matches!(err, RelayError::StreamInterrupted(_)));
    }

    #[test]
    fn buffered_response_usage_is_a_consistent_char_count_proxy() {
        let payload = chat_completion_json(&ctx(), "hi there", 5);

        assert_eq!(payload["object"], "chat.completion");
        assert_eq!(payload["choices"][0]["message"]["role"], "assistant");
        assert_eq!(payload["choices"][0]["message"]["content"], "hi there");
        assert_eq!(payload["choices"][0]["finish_reason"], "stop");
        assert_eq!(payload["usage"]["prompt_tokens"], 5);
        assert_eq!(payload["usage"]["completion_tokens"], 8);
        assert_eq!(payload["usage"]["total_tokens"], 13);
    }

    #[test]
    fn upstream_statuses_map_to_distinct_error_classes() {
        let rejected = |status: u16| RelayError::UpstreamRejected {
            status: reqwest::StatusCode::from_u16(status).expect("status"),
            body: "nope".to_string(),
        };

        let (status, kind, code, _) = map_relay_error(&rejected(429));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(kind, "rate_limit_error");
        assert_eq!(code, "upstream_rate_limited");

        let (status, _, code, _) = map_relay_error(&rejected(403));
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(code, "upstream_access_denied");

        let (status, _, code, _) = map_relay_error(&rejected(500));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(code, "upstream_error");

        let (status, _, code, message) =
            map_relay_error(&RelayError::InvalidRequest("bad".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "invalid_request");
        assert_eq!(message, "bad");
    }
}
