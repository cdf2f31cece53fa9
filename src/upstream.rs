use std::sync::Arc;

use futures_util::StreamExt;

use crate::config::RelayConfig;
use crate::fingerprint::Fingerprint;
use crate::types::UpstreamPayload;
use crate::{RelayError, Result};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Client for the single upstream generate endpoint. Holds the shared
/// reqwest client and the immutable configuration.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: Arc<RelayConfig>,
}

impl UpstreamClient {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        // no overall timeout: the response body is an open-ended stream
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client build should not fail");

        Self { http, config }
    }

    /// Issue the upstream call. A non-success status is classified here and
    /// never reaches the stream translator.
    pub async fn generate(
        &self,
        payload: &UpstreamPayload,
        fingerprint: &Fingerprint,
    ) -> Result<reqwest::Response> {
        let origin = self.config.origin.trim_end_matches('/');

        let mut req = self
            .http
            .post(&self.config.upstream_url)
            .header("Accept", "*/*")
            .header("Accept-Language", "en-US,en;q=0.9")
            // the upstream expects the JSON payload under a text/plain
            // content type
            .header("Content-Type", "text/plain;charset=UTF-8")
            .header("Origin", origin)
            .header("Referer", format!("{origin}/"))
            .header("X-Forwarded-For", &fingerprint.source_ip)
            .header("X-Real-IP", &fingerprint.source_ip)
            .header("Client-IP", &fingerprint.source_ip)
            .header(
                "Sec-Ch-Ua",
                "\"Chromium\";v=\"124\", \"Google Chrome\";v=\"124\", \"Not-A.Brand\";v=\"99\"",
            )
            .header("Sec-Ch-Ua-Mobile", "?0")
            .header("Sec-Ch-Ua-Platform", "\"Windows\"")
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "same-origin")
            .header("Priority", "u=1, i");
        if !fingerprint.user_agent.is_empty() {
            req = req.header("User-Agent", &fingerprint.user_agent);
        }

        let body = serde_json::to_string(payload)?;
        let response = req.body(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(RelayError::UpstreamRejected { status, body });
        }
        Ok(response)
    }
}

async fn response_text_truncated(response: reqwest::Response, max_bytes: usize) -> String {
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if remaining == 0 {
            truncated = true;
            break;
        }
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }

    let mut body = String::from_utf8_lossy(&out).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}
