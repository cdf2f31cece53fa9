use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream rejected ({status}): {body}")]
    UpstreamRejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
