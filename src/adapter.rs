//! Request adapter: turns an inbound chat completion request into the signed
//! payload the upstream expects. No network side effects.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::config::RelayConfig;
use crate::types::{ChatCompletionRequest, UpstreamMessage, UpstreamPayload};
use crate::{RelayError, Result};

/// The upstream signs with a permanently empty secret component. Protocol
/// constant, not configuration.
const UPSTREAM_SIGN_SECRET: &str = "";

#[derive(Debug, Clone)]
pub struct AdaptedRequest {
    pub payload: UpstreamPayload,
    /// Model name echoed back to the client. The upstream runs a single
    /// model and ignores this entirely, so unknown names pass through.
    pub model: String,
    /// Character count of the normalized last message, used as the prompt
    /// side of the usage estimate.
    pub prompt_chars: usize,
}

pub fn adapt(request: &ChatCompletionRequest, config: &RelayConfig) -> Result<AdaptedRequest> {
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest(
            "messages must be a non-empty array".to_string(),
        ));
    }

    let mut messages = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        messages.push(UpstreamMessage {
            role: message.role.clone(),
            content: message.content.normalize(),
        });
    }

    let last_content = messages
        .last()
        .map(|message| message.content.clone())
        .unwrap_or_default();
    if last_content.is_empty() {
        return Err(RelayError::InvalidRequest(
            "last message content is empty".to_string(),
        ));
    }

    let time = epoch_millis()?;
    let sign = sign_payload(time, &last_content);
    let prompt_chars = last_content.chars().count();

    let model = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .unwrap_or(config.default_model.as_str())
        .to_string();

    Ok(AdaptedRequest {
        payload: UpstreamPayload {
            messages,
            time,
            pass: None,
            sign,
        },
        model,
        prompt_chars,
    })
}

/// SHA-256 over `"{time}:{content}:{secret}"`, lowercase hex.
pub fn sign_payload(time: u64, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{time}:{content}:{UPSTREAM_SIGN_SECRET}").as_bytes());
    hex_encode(&hasher.finalize())
}

fn epoch_millis() -> Result<u64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| RelayError::Internal(format!("system clock before epoch: {err}")))?;
    Ok(now.as_millis() as u64)
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}
