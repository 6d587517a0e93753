use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};

/// Separator between the subdomain and the timestamp inside a nonce.
pub const NONCE_DELIMITER: &str = "-_-";

/// Access token, refresh token and computed expiry from an exchange or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    /// Whether the access token expires within `margin` of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now.checked_add_signed(margin)
            .map_or(true, |deadline| deadline >= self.expires_at)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

async fn decode_token_response(response: reqwest::Response) -> Result<TokenResponse> {
    response.json().await.map_err(|e| {
        if e.is_timeout() {
            GatewayError::UpstreamTimeout
        } else {
            GatewayError::InvalidTokenResponse(e.to_string())
        }
    })
}

/// `now + expires_in` seconds, rejecting values chrono cannot represent.
fn expires_at_from(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>> {
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| GatewayError::InvalidTokenResponse("expires_in out of range".to_string()))
}

/// Build the `state` value for a login attempt against `subdomain`.
pub fn make_nonce(subdomain: &str, now: DateTime<Utc>) -> String {
    format!("{}{}{}", subdomain, NONCE_DELIMITER, now.timestamp_millis())
}

/// Recover the subdomain embedded in a nonce.
pub fn nonce_subdomain(nonce: &str) -> Option<&str> {
    nonce
        .split_once(NONCE_DELIMITER)
        .map(|(subdomain, _)| subdomain)
        .filter(|s| !s.is_empty())
}

/// Client for the tenant's OAuth2 authorization server
pub struct TokenManager {
    config: Arc<GatewayConfig>,
    http_client: reqwest::Client,
}

impl TokenManager {
    pub fn new(config: Arc<GatewayConfig>, http_client: reqwest::Client) -> Self {
        Self { config, http_client }
    }

    fn token_url(&self, subdomain: &str) -> String {
        format!("{}/oauth2/token", self.config.tenant_base_url(subdomain))
    }

    /// Upstream authorize URL the browser is sent to on login.
    pub fn authorize_url(&self, subdomain: &str, nonce: &str, redirect_uri: &str) -> String {
        let base = format!("{}/oauth2/authorize", self.config.tenant_base_url(subdomain));
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", nonce)
            .finish();
        format!("{base}?{query}")
    }

    /// Exchange an authorization code for tokens.
    ///
    /// `received_state` must match the nonce issued at login and must name the
    /// same tenant as `subdomain`.
    pub async fn exchange(
        &self,
        subdomain: &str,
        authorization_code: Option<&str>,
        expected_nonce: Option<&str>,
        received_state: Option<&str>,
    ) -> Result<TokenSet> {
        let received_state = received_state.ok_or(GatewayError::MissingParameter("state"))?;
        match expected_nonce {
            Some(expected) if expected == received_state => {}
            _ => return Err(GatewayError::InvalidState),
        }
        if nonce_subdomain(received_state) != Some(subdomain) {
            return Err(GatewayError::InvalidState);
        }

        let code = authorization_code
            .filter(|c| !c.is_empty())
            .ok_or(GatewayError::MissingParameter("code"))?;

        let form_params = [
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", code),
        ];

        let url = self.token_url(subdomain);
        tracing::debug!(%url, "Exchanging authorization code");

        let response = self.http_client.post(&url).form(&form_params).send().await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.bytes().await.unwrap_or_default();
            tracing::warn!(%subdomain, %status, "Token exchange rejected");
            return Err(GatewayError::UpstreamExchange { status, body });
        }

        let token_response = decode_token_response(response).await?;

        let refresh_token = token_response.refresh_token.ok_or_else(|| {
            GatewayError::InvalidTokenResponse("missing refresh_token".to_string())
        })?;

        let expires_at = expires_at_from(Utc::now(), token_response.expires_in)?;
        tracing::info!(%subdomain, expires_in = token_response.expires_in, "Token exchange succeeded");

        Ok(TokenSet {
            access_token: token_response.access_token,
            refresh_token,
            expires_at,
        })
    }

    /// Mint a new access token from a refresh token.
    ///
    /// The previous refresh token is kept when the response does not rotate it.
    pub async fn refresh(&self, subdomain: &str, refresh_token: &str) -> Result<TokenSet> {
        let form_params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .http_client
            .post(self.token_url(subdomain))
            .form(&form_params)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.bytes().await.unwrap_or_default();
            return Err(GatewayError::UpstreamRefresh { status, body });
        }

        let token_response = decode_token_response(response).await?;

        let expires_at = expires_at_from(Utc::now(), token_response.expires_in)?;
        tracing::info!(%subdomain, expires_in = token_response.expires_in, "Token refreshed");

        Ok(TokenSet {
            access_token: token_response.access_token,
            refresh_token: token_response
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at,
        })
    }
}
