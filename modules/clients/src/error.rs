use signance_core::LocatorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error("not authenticated or session expired")]
    Unauthorized,
    #[error("not allowed: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend returned {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("cannot reach backend: {0}")]
    Transport(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("http client setup failed: {0}")]
    Client(String),
}

impl ApiError {
    /// Map a non-2xx response. FastAPI puts the human-readable reason in `detail`.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let detail = detail_of(body).unwrap_or_else(|| "server error".to_string());
        match status {
            401 => ApiError::Unauthorized,
            403 => ApiError::Forbidden(detail),
            404 => ApiError::NotFound(detail),
            _ => ApiError::Status { status, detail },
        }
    }

    /// Whether retrying after re-resolving the backend could help.
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Locator(_))
    }
}

fn detail_of(body: &[u8]) -> Option<String> {
    let v: serde_json::Value = serde_json::from_slice(body).ok()?;
    match v.get("detail")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}
