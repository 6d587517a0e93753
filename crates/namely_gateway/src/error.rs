use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use bytes::Bytes;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failures surfaced by the token manager, the API proxy and the handlers.
#[derive(Error, Debug)]
pub enum GatewayError {
    // ── Request Errors ──────────────────────────────────────────────────
    #[error("the \"{0}\" parameter is required")]
    MissingParameter(&'static str),

    #[error("the \"state\" parameter does not match this session")]
    InvalidState,

    #[error("invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("invalid resource path: {0}")]
    InvalidPath(String),

    // ── Session Errors ──────────────────────────────────────────────────
    /// No usable tokens. Rendered as a redirect to the login page.
    #[error("authentication required")]
    Unauthenticated,

    // ── Upstream Errors ─────────────────────────────────────────────────
    #[error("token exchange failed: {status}")]
    UpstreamExchange { status: StatusCode, body: Bytes },

    #[error("token refresh failed: {status}")]
    UpstreamRefresh { status: StatusCode, body: Bytes },

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),

    #[error("upstream request failed: {0}")]
    Transport(reqwest::Error),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::UpstreamTimeout
        } else {
            GatewayError::Transport(e)
        }
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MissingParameter(_)
            | GatewayError::InvalidState
            | GatewayError::InvalidSubdomain(_)
            | GatewayError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::SEE_OTHER,
            GatewayError::UpstreamExchange { status, .. }
            | GatewayError::UpstreamRefresh { status, .. } => *status,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidTokenResponse(_) | GatewayError::Transport(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            GatewayError::Unauthenticated => Redirect::to("/").into_response(),
            // Upstream failures are relayed verbatim, not wrapped.
            GatewayError::UpstreamExchange { body, .. }
            | GatewayError::UpstreamRefresh { body, .. } => (
                status,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response(),
            GatewayError::Transport(e) => {
                tracing::error!("Upstream transport error: {e}");
                (status, format!("upstream request failed: {e}")).into_response()
            }
            other => (status, other.to_string()).into_response(),
        }
    }
}
