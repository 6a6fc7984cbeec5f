use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failure taxonomy for the proxying engine. Every variant resolves to an
/// HTTP status; nothing in this subsystem is allowed to take the process down.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Bad scheme or unparseable URL, rejected before any network I/O.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Both the media cache and the direct-fetch fallback are switched off.
    #[error("media proxying is disabled in settings")]
    ProxyDisabled,

    /// Network-level failure talking to the remote origin.
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    /// The remote origin answered with a non-success status.
    #[error("upstream returned status {0}")]
    UpstreamStatus(StatusCode),

    /// Malformed base64 token in `url_b64`/`referer_b64`.
    #[error("malformed encoded parameter: {0}")]
    Decode(String),

    /// Disk I/O failure while persisting or reading a cache entry.
    #[error("cache i/o failed: {0}")]
    CacheWrite(#[from] std::io::Error),

    /// The streaming HTML rewriter gave up on the document.
    #[error("html rewrite failed: {0}")]
    Rewrite(String),
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::UpstreamFetch(err.to_string())
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidUrl(_) | ProxyError::Decode(_) => StatusCode::BAD_REQUEST,
            ProxyError::ProxyDisabled => StatusCode::FORBIDDEN,
            // Upstream statuses are passed through so the viewer sees what
            // the origin actually said (404 page, 410 gone media, ...).
            ProxyError::UpstreamStatus(status) => *status,
            ProxyError::UpstreamFetch(_)
            | ProxyError::CacheWrite(_)
            | ProxyError::Rewrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "proxy request failed");
        } else {
            tracing::debug!(error = %self, "proxy request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(
            ProxyError::InvalidUrl("ftp://x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::Decode("not base64".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyError::ProxyDisabled.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn upstream_status_passes_through() {
        assert_eq!(
            ProxyError::UpstreamStatus(StatusCode::NOT_FOUND).status(),
            StatusCode::NOT_FOUND
        );
    }
}
