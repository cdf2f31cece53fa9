use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound OpenAI-style chat completion request. Only the fields this
/// gateway acts on are modeled; everything else is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// Message content arrives either as a plain string or as an ordered list of
/// typed parts. Anything else is carried as raw JSON and stringified as a
/// last resort during normalization.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentItem>),
    Other(Value),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Other(Value::Null)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Flatten to the plain string the upstream expects: text parts joined
    /// by newline in arrival order, non-text parts dropped.
    pub fn normalize(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|part| part.kind == "text")
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
            MessageContent::Other(Value::Null) => String::new(),
            MessageContent::Other(Value::String(text)) => text.clone(),
            MessageContent::Other(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub content: String,
}

/// The signed request shape the upstream accepts. `pass` is always null on
/// the wire; `sign` is a pure function of `(time, last message content)`.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamPayload {
    pub messages: Vec<UpstreamMessage>,
    pub time: u64,
    pub pass: Option<String>,
    pub sign: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content_from(value: Value) -> MessageContent {
        serde_json::from_value(value).expect("content should deserialize")
    }

    #[test]
    fn plain_string_content_is_used_verbatim() {
        let content = content_from(json!("hello there"));
        assert_eq!(content.normalize(), "hello there");
    }

    #[test]
    fn parts_content_keeps_only_text_parts_in_order() {
        let content = content_from(json!([
            { "type": "text", "text": "first" },
            { "type": "image_url", "image_url": { "url": "https://example.com/a.png" } },
            { "type": "text", "text": "second" },
        ]));
        assert_eq!(content.normalize(), "first\nsecond");
    }

    #[test]
    fn empty_parts_list_normalizes_to_empty() {
        let content = content_from(json!([]));
        assert_eq!(content.normalize(), "");
    }

    #[test]
    fn null_content_normalizes_to_empty() {
        let content = content_from(json!(null));
        assert_eq!(content.normalize(), "");
    }

    #[test]
    fn unexpected_shapes_are_stringified() {
        let content = content_from(json!(42));
        assert_eq!(content.normalize(), "42");

        let content = content_from(json!({ "nested": true }));
        assert_eq!(content.normalize(), r#"{"nested":true}"#);
    }

    #[test]
    fn payload_serializes_pass_as_null() {
        let payload = UpstreamPayload {
            messages: vec![UpstreamMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            time: 1_700_000_000_000,
            pass: None,
            sign: "ab".repeat(32),
        };

        let raw = serde_json::to_value(&payload).expect("payload should serialize");
        assert_eq!(raw["pass"], Value::Null);
        assert_eq!(raw["messages"][0]["content"], "hi");
        assert_eq!(raw["time"], 1_700_000_000_000u64);
    }

    #[test]
    fn request_defaults_stream_to_false() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{ "role": "user", "content": "hi" }]
        }))
        .expect("request should deserialize");

        assert!(request.stream.is_none());
        assert!(request.model.is_none());
        assert_eq!(request.messages.len(), 1);
    }
}
