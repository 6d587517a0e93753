//! HTTP handlers for the login flow and the authenticated API passthrough.

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::{new_session_id, nonce_subdomain, Session};
use crate::error::{GatewayError, Result};
use crate::proxy::UpstreamResponse;

use super::cookies;
use super::AppState;

/// Load the caller's session, or start a fresh one with a new cookie.
async fn load_session(state: &AppState, jar: CookieJar) -> (CookieJar, String, Session) {
    if let Some(id) = cookies::session_id(&jar) {
        if let Some(session) = state.sessions.load(&id).await {
            return (jar, id, session);
        }
    }
    let id = new_session_id();
    let jar = jar.add(cookies::session_cookie(&id, state.config.secure_cookies));
    (jar, id, Session::default())
}

/// Normalise and check a tenant subdomain before it is placed in a hostname.
pub fn validate_subdomain(raw: Option<&str>) -> Result<String> {
    let subdomain = raw
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .ok_or(GatewayError::MissingParameter("subdomain"))?;

    let valid = subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');

    if valid {
        Ok(subdomain)
    } else {
        Err(GatewayError::InvalidSubdomain(subdomain))
    }
}

/// Landing page: login form, or links once signed in
pub async fn index(State(state): State<Arc<AppState>>, jar: CookieJar) -> Html<String> {
    let session = match cookies::session_id(&jar) {
        Some(id) => state.sessions.load(&id).await,
        None => None,
    };

    match session {
        Some(session) if session.is_authenticated() => {
            let subdomain = escape_html(session.subdomain.as_deref().unwrap_or_default());
            Html(page(
                "Namely Gateway",
                &format!(
                    r#"<p>Signed in to <strong>{subdomain}</strong>.</p>
        <ul>
            <li><a href="/me">My profile</a></li>
            <li><a href="/company">Company info</a></li>
            <li><a href="/logout">Sign out</a></li>
        </ul>"#
                ),
            ))
        }
        _ => Html(page(
            "Namely Gateway",
            r#"<form action="/login" method="get">
            <label for="subdomain">Company subdomain</label>
            <input id="subdomain" name="subdomain" placeholder="acme" required>
            <button type="submit">Sign in with Namely</button>
        </form>"#,
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub subdomain: Option<String>,
}

/// Start the authorization-code flow against the chosen tenant.
pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<LoginQuery>,
) -> Result<(CookieJar, Redirect)> {
    let subdomain = validate_subdomain(params.subdomain.as_deref())?;

    let (jar, session_id, mut session) = load_session(&state, jar).await;
    let nonce = session.begin_login(&subdomain, Utc::now());
    state.sessions.save(&session_id, session).await;

    let url = state
        .tokens
        .authorize_url(&subdomain, &nonce, &state.config.redirect_uri());

    tracing::info!(%subdomain, "Redirecting to authorization server");
    Ok((jar, Redirect::to(&url)))
}

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Validate `state`, exchange the code and store the tokens in the session.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<CallbackQuery>,
) -> Result<Response> {
    let (jar, session_id, mut session) = load_session(&state, jar).await;

    // The nonce is single-use, whatever the outcome.
    let expected_nonce = session.take_nonce();
    state.sessions.save(&session_id, session.clone()).await;

    if let Some(error) = params.error {
        let description = params
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        tracing::warn!(%error, %description, "Authorization server returned an error");
        return Ok((
            StatusCode::BAD_REQUEST,
            jar,
            Html(error_page(&error, &description)),
        )
            .into_response());
    }

    let received_state = params
        .state
        .as_deref()
        .ok_or(GatewayError::MissingParameter("state"))?;
    let subdomain = nonce_subdomain(received_state).ok_or_else(|| {
        tracing::warn!("Callback state carries no subdomain");
        GatewayError::InvalidState
    })?;

    let tokens = state
        .tokens
        .exchange(
            subdomain,
            params.code.as_deref(),
            expected_nonce.as_deref(),
            Some(received_state),
        )
        .await
        .inspect_err(|e| tracing::warn!(%subdomain, error = %e, "Callback rejected"))?;

    session.apply_tokens(subdomain, tokens);
    state.sessions.save(&session_id, session).await;

    tracing::info!(%subdomain, "Login complete");
    Ok((jar, Redirect::to("/me")).into_response())
}

async fn forward(
    state: &AppState,
    jar: CookieJar,
    resource_path: &str,
    query: Option<&str>,
) -> Result<(CookieJar, UpstreamResponse)> {
    let session_id = cookies::session_id(&jar).ok_or(GatewayError::Unauthenticated)?;
    let mut session = state
        .sessions
        .load(&session_id)
        .await
        .ok_or(GatewayError::Unauthenticated)?;
    let result = state.proxy.forward(&mut session, resource_path, query).await;
    state.sessions.save(&session_id, session).await;
    result.map(|response| (jar, response))
}

/// Wildcard passthrough: `/proxy/{path}` -> `{tenant}/{path}`
pub async fn proxy_get(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<(CookieJar, UpstreamResponse)> {
    forward(&state, jar, &path, query.as_deref()).await
}

pub async fn me(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<(CookieJar, UpstreamResponse)> {
    forward(&state, jar, "/profiles/me", None).await
}

pub async fn company(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<(CookieJar, UpstreamResponse)> {
    forward(&state, jar, "/companies/info", None).await
}

pub async fn logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(id) = cookies::session_id(&jar) {
        state.sessions.remove(&id).await;
        tracing::info!("Session cleared");
    }
    (jar.remove(cookies::clear_session_cookie()), Redirect::to("/"))
}

pub async fn healthz() -> impl IntoResponse {
    "ok"
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn error_page(error: &str, description: &str) -> String {
    page(
        "Authorization Failed",
        &format!(
            r#"<h1>Authorization Failed</h1>
        <p><strong>Error:</strong> {}</p>
        <div class="error-message">{}</div>
        <p><a href="/">Try again</a></p>"#,
            escape_html(error),
            escape_html(description)
        ),
    )
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            margin: 4rem 0;
        }}
        .container {{
            padding: 2rem 3rem;
            border: 1px solid #e2e8f0;
            border-radius: 0.5rem;
            max-width: 500px;
        }}
        .error-message {{
            background: #fff5f5;
            border: 1px solid #feb2b2;
            color: #c53030;
            padding: 1rem;
            border-radius: 0.5rem;
        }}
    </style>
</head>
<body>
    <div class="container">
        {body}
    </div>
</body>
</html>
"#
    )
}
