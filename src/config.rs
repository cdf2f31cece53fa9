use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Immutable gateway configuration. Built once at startup and passed into the
/// adapter, upstream client, and server explicitly; nothing mutates it after
/// load.
#[derive(Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Master key checked as `Authorization: Bearer <key>` on chat
    /// completions. Empty disables the check.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("listen", &self.listen)
            .field("api_key", &"<redacted>")
            .field("upstream_url", &self.upstream_url)
            .field("origin", &self.origin)
            .field("models", &self.models)
            .field("default_model", &self.default_model)
            .field("user_agents", &self.user_agents.len())
            .finish()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key: default_api_key(),
            upstream_url: default_upstream_url(),
            origin: default_origin(),
            models: default_models(),
            default_model: default_model(),
            user_agents: default_user_agents(),
        }
    }
}

impl RelayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// `PORT` and `API_KEY` environment overrides for container deployments.
    pub fn apply_env(mut self) -> Self {
        if let Ok(port) = std::env::var("PORT") {
            let port = port.trim().to_string();
            if !port.is_empty() {
                self.listen = format!("0.0.0.0:{port}");
            }
        }
        if let Ok(api_key) = std::env::var("API_KEY") {
            if !api_key.trim().is_empty() {
                self.api_key = api_key;
            }
        }
        self
    }
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_api_key() -> String {
    "sk-free2gpt-dev".to_string()
}

fn default_upstream_url() -> String {
    "https://chat3.free2gpt.com/api/generate".to_string()
}

fn default_origin() -> String {
    "https://chat3.free2gpt.com".to_string()
}

fn default_models() -> Vec<String> {
    vec![
        "free2gpt-general".to_string(),
        "gpt-3.5-turbo".to_string(),
        "gpt-4o-mini".to_string(),
    ]
}

fn default_model() -> String {
    "free2gpt-general".to_string()
}

fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
    ]
}
