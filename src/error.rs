use thiserror::Error;

/// Longest API response body kept in an [`AppError::Api`].
const MAX_BODY_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not configured: {0}")]
    NotConfigured(String),
    #[error("Authentication failed: {0}. Run `cloudvm login` or re-authenticate the provider CLI.")]
    Auth(String),
    #[error("Compute API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Tunnel error: {0}")]
    TunnelProcess(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl AppError {
    pub fn api(status: u16, body: &str) -> Self {
        let body = body.trim();
        let body = match body.char_indices().nth(MAX_BODY_CHARS) {
            Some((idx, _)) => format!("{}…", &body[..idx]),
            None => body.to_string(),
        };
        Self::Api { status, body }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_truncates_long_bodies() {
        let body = "x".repeat(1000);
        match AppError::api(500, &body) {
            AppError::Api { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body.chars().count(), MAX_BODY_CHARS + 1);
                assert!(body.ends_with('…'));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn api_error_keeps_short_bodies() {
        let err = AppError::api(404, "  not found\n");
        assert_eq!(err.to_string(), "Compute API returned HTTP 404: not found");
    }
}
