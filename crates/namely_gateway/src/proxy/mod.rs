//! Authenticated passthrough to a tenant's resource API.
//!
//! Each proxied GET refreshes the access token at most once, either because
//! the stored token has expired or because the upstream answered 403. That
//! bounds a single inbound request to two resource calls plus one refresh.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;

use crate::auth::{Session, TokenManager, TokenSet};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};

/// Upstream answer relayed to the browser unchanged.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: HeaderValue,
    pub body: Bytes,
}

impl IntoResponse for UpstreamResponse {
    fn into_response(self) -> Response {
        (self.status, [(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

pub struct ApiProxy {
    config: Arc<GatewayConfig>,
    tokens: Arc<TokenManager>,
    http_client: reqwest::Client,
}

impl ApiProxy {
    pub fn new(
        config: Arc<GatewayConfig>,
        tokens: Arc<TokenManager>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            tokens,
            http_client,
        }
    }

    /// GET `resource_path` on the session's tenant, refreshing tokens as needed.
    ///
    /// Refreshed tokens are written back into `session`. A failed refresh on
    /// an expired token drops the tokens and returns `Unauthenticated`.
    pub async fn forward(
        &self,
        session: &mut Session,
        resource_path: &str,
        query: Option<&str>,
    ) -> Result<UpstreamResponse> {
        let subdomain = session
            .subdomain
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(GatewayError::Unauthenticated)?;
        let mut tokens = session.tokens.clone().ok_or(GatewayError::Unauthenticated)?;
        let url = self.resource_url(&subdomain, resource_path, query)?;
        let mut refreshed = false;

        if tokens.is_expired_at(Utc::now(), self.config.expiry_margin) {
            tracing::info!(%subdomain, "Access token expired, refreshing");
            refreshed = true;
            match self.tokens.refresh(&subdomain, &tokens.refresh_token).await {
                Ok(new_tokens) => {
                    session.apply_tokens(&subdomain, new_tokens.clone());
                    tokens = new_tokens;
                }
                Err(e) => {
                    tracing::warn!(%subdomain, error = %e, "Refresh of expired token failed");
                    session.clear_tokens();
                    return Err(GatewayError::Unauthenticated);
                }
            }
        }

        loop {
            let response = self.get(&url, &tokens).await?;

            if response.status != StatusCode::FORBIDDEN || refreshed {
                return Ok(response);
            }

            refreshed = true;
            tracing::info!(%subdomain, path = %resource_path, "Upstream returned 403, refreshing");
            match self.tokens.refresh(&subdomain, &tokens.refresh_token).await {
                Ok(new_tokens) => {
                    session.apply_tokens(&subdomain, new_tokens.clone());
                    tokens = new_tokens;
                }
                Err(e) => {
                    tracing::warn!(%subdomain, error = %e, "Refresh after 403 failed");
                    return Ok(response);
                }
            }
        }
    }

    /// Tenant URL for `resource_path`, one encoded segment at a time.
    ///
    /// Dot segments are refused so a request cannot climb out of the API base path.
    fn resource_url(
        &self,
        subdomain: &str,
        resource_path: &str,
        query: Option<&str>,
    ) -> Result<url::Url> {
        let segments: Vec<&str> = resource_path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.iter().any(|s| *s == "." || *s == "..") {
            return Err(GatewayError::InvalidPath(resource_path.to_string()));
        }

        let mut url = url::Url::parse(&self.config.tenant_base_url(subdomain))
            .map_err(|e| GatewayError::InvalidPath(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::InvalidPath(resource_path.to_string()))?
            .pop_if_empty()
            .extend(segments);
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    async fn get(&self, url: &url::Url, tokens: &TokenSet) -> Result<UpstreamResponse> {
        tracing::debug!(%url, "Proxying GET");

        let response = self
            .http_client
            .get(url.clone())
            .bearer_auth(&tokens.access_token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}
