use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::server::mirror::RewriteError;

/// Errors surfaced by the proxy handler.
///
/// Everything that goes wrong inside the auth or hook pipeline is contained
/// and logged where it happens; only failures that leave the proxy without
/// an upstream response end up here.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No registry route for {method} {path}")]
    Unroutable { method: String, path: String },

    #[error("Failed to read request body: {0}")]
    Body(#[source] axum::Error),

    #[error("Upstream request to {url} failed")]
    Upstream {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to build upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Unroutable { .. } => StatusCode::NOT_FOUND,
            ProxyError::Body(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidUrl(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<RewriteError> for ProxyError {
    fn from(err: RewriteError) -> Self {
        match err {
            RewriteError::Unroutable { method, path } => ProxyError::Unroutable {
                method: method.to_string(),
                path,
            },
            RewriteError::InvalidUrl(e) => ProxyError::InvalidUrl(e),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Structured fields keep request paths out of the message itself
        match &self {
            ProxyError::Unroutable { method, path } => {
                tracing::error!(method = %method, path = %path, "Unroutable registry request");
            }
            ProxyError::Upstream { url, source } => {
                tracing::error!(
                    status = status.as_u16(),
                    url = %url,
                    error = ?source,
                    "Upstream request failed"
                );
            }
            other => {
                tracing::error!(status = status.as_u16(), error = %other, "Proxy error");
            }
        }

        // Registry-style error body
        let body = Json(json!({
            "errors": [{
                "code": status.canonical_reason().unwrap_or("ERROR").to_uppercase().replace(' ', "_"),
                "message": self.to_string(),
            }]
        }));

        (status, body).into_response()
    }
}
