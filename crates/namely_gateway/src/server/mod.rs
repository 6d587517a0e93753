//! Namely Gateway HTTP Server
//!
//! Routes browser requests to the login flow and the authenticated API
//! passthrough.

pub mod cookies;
pub mod handlers;

use crate::auth::{MemorySessionStore, SessionStore, TokenManager};
use crate::config::{GatewayConfig, CALLBACK_PATH};
use crate::proxy::ApiProxy;
use axum::{routing::get, Router as AxumRouter};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub tokens: Arc<TokenManager>,
    pub proxy: ApiProxy,
    pub sessions: Arc<dyn SessionStore>,
}

impl AppState {
    pub fn new(
        config: Arc<GatewayConfig>,
        http_client: reqwest::Client,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let tokens = Arc::new(TokenManager::new(config.clone(), http_client.clone()));
        let proxy = ApiProxy::new(config.clone(), tokens.clone(), http_client);
        Self {
            config,
            tokens,
            proxy,
            sessions,
        }
    }
}

/// Build the router:
/// - GET /                              - Login form or signed-in links
/// - GET /login?subdomain=              - Start OAuth authorization
/// - GET /api/clients/redirect_success  - OAuth callback
/// - GET /proxy/*path                   - Authenticated passthrough
/// - GET /me, /company                  - Profile and company shortcuts
/// - GET /logout                        - Clear the session
pub fn build_router(state: Arc<AppState>) -> AxumRouter {
    AxumRouter::new()
        .route("/", get(handlers::index))
        .route("/login", get(handlers::login))
        .route(CALLBACK_PATH, get(handlers::oauth_callback))
        .route("/proxy/*path", get(handlers::proxy_get))
        .route("/me", get(handlers::me))
        .route("/company", get(handlers::company))
        .route("/logout", get(handlers::logout))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server
///
/// # Errors
/// Returns error if the HTTP client cannot be built or the listener fails to bind
pub async fn start_server(config: GatewayConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let http_client = reqwest::Client::builder()
        .timeout(config.upstream_timeout)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

    let sessions = MemorySessionStore::new(config.session_ttl);
    sessions.spawn_sweeper(std::time::Duration::from_secs(60));

    let state = Arc::new(AppState::new(config.clone(), http_client, Arc::new(sessions)));
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Namely Gateway listening on {}", addr);
    info!("Upstream API: {}", config.tenant_base_url("{subdomain}"));
    info!("OAuth redirect URI: {}", config.redirect_uri());

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth::tests::test_manager;
    use crate::auth::Session;
    use axum::body::Body;
    use axum::http::{header, Request, Response, StatusCode};
    use chrono::Duration;
    use http_body_util::BodyExt;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    struct Harness {
        app: AxumRouter,
        sessions: MemorySessionStore,
    }

    fn harness(server: &mockito::ServerGuard) -> Harness {
        let (config, client) = test_manager(server);
        let sessions = MemorySessionStore::new(Duration::hours(1));
        let state = Arc::new(AppState::new(config, client, Arc::new(sessions.clone())));
        Harness {
            app: build_router(state),
            sessions,
        }
    }

    async fn get(app: &AxumRouter, uri: &str, cookie: Option<&str>) -> Response<Body> {
        let mut request = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        app.clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn location(response: &Response<Body>) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    fn session_cookie(response: &Response<Body>) -> String {
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Run login and return (session cookie, state issued to the upstream).
    async fn start_login(app: &AxumRouter) -> (String, String) {
        let response = get(app, "/login?subdomain=acme", None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let cookie = session_cookie(&response);
        let authorize = url::Url::parse(&location(&response)).unwrap();
        assert_eq!(authorize.path(), "/api/v1/oauth2/authorize");
        let state = authorize
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        (cookie, state)
    }

    async fn stored(harness: &Harness, cookie: &str) -> Session {
        let id = cookie.trim_start_matches("namely_session=");
        harness.sessions.load(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_full_login_and_proxy_flow() {
        let mut server = mockito::Server::new_async().await;
        let exchange = server
            .mock("POST", "/api/v1/oauth2/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "abc".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"AT","refresh_token":"RT","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let profile = server
            .mock("GET", "/api/v1/profiles/me")
            .match_header("authorization", "Bearer AT")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"profiles":[{"first_name":"Ada"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let harness = harness(&server);
        let (cookie, state) = start_login(&harness.app).await;
        assert!(state.starts_with("acme-_-"));

        let callback = get(
            &harness.app,
            &format!("/api/clients/redirect_success?code=abc&state={state}"),
            Some(&cookie),
        )
        .await;
        assert_eq!(callback.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&callback), "/me");
        exchange.assert_async().await;

        let session = stored(&harness, &cookie).await;
        assert_eq!(session.subdomain.as_deref(), Some("acme"));
        assert_eq!(session.nonce, None);
        let tokens = session.tokens.unwrap();
        assert_eq!(tokens.access_token, "AT");
        assert_eq!(tokens.refresh_token, "RT");

        let me = get(&harness.app, "/me", Some(&cookie)).await;
        assert_eq!(me.status(), StatusCode::OK);
        assert_eq!(body_string(me).await, r#"{"profiles":[{"first_name":"Ada"}]}"#);
        profile.assert_async().await;
    }

    #[tokio::test]
    async fn test_callback_with_bad_state_leaves_tokens_alone() {
        let mut server = mockito::Server::new_async().await;
        let exchange = server
            .mock("POST", "/api/v1/oauth2/token")
            .expect(0)
            .create_async()
            .await;

        let harness = harness(&server);
        let (cookie, _state) = start_login(&harness.app).await;

        let forged = get(
            &harness.app,
            "/api/clients/redirect_success?code=abc&state=acme-_-1",
            Some(&cookie),
        )
        .await;
        assert_eq!(forged.status(), StatusCode::BAD_REQUEST);

        let missing = get(
            &harness.app,
            "/api/clients/redirect_success?code=abc",
            Some(&cookie),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_string(missing).await,
            "the \"state\" parameter is required"
        );

        let session = stored(&harness, &cookie).await;
        assert_eq!(session.tokens, None);
        assert_eq!(session.nonce, None);
        exchange.assert_async().await;
    }

    #[tokio::test]
    async fn test_nonce_is_single_use() {
        let mut server = mockito::Server::new_async().await;
        let exchange = server
            .mock("POST", "/api/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"AT","refresh_token":"RT","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let harness = harness(&server);
        let (cookie, state) = start_login(&harness.app).await;
        let uri = format!("/api/clients/redirect_success?code=abc&state={state}");

        let first = get(&harness.app, &uri, Some(&cookie)).await;
        assert_eq!(first.status(), StatusCode::SEE_OTHER);

        let replay = get(&harness.app, &uri, Some(&cookie)).await;
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
        exchange.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_error_is_relayed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/oauth2/token")
            .with_status(401)
            .with_body(r#"{"error":"invalid_client"}"#)
            .create_async()
            .await;

        let harness = harness(&server);
        let (cookie, state) = start_login(&harness.app).await;

        let response = get(
            &harness.app,
            &format!("/api/clients/redirect_success?code=abc&state={state}"),
            Some(&cookie),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_string(response).await, r#"{"error":"invalid_client"}"#);
    }

    #[tokio::test]
    async fn test_upstream_error_param_renders_error_page() {
        let server = mockito::Server::new_async().await;
        let harness = harness(&server);

        let response = get(
            &harness.app,
            "/api/clients/redirect_success?error=access_denied&error_description=denied",
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("access_denied"));
    }

    #[tokio::test]
    async fn test_login_requires_valid_subdomain() {
        let server = mockito::Server::new_async().await;
        let harness = harness(&server);

        let missing = get(&harness.app, "/login", None).await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let invalid = get(&harness.app, "/login?subdomain=evil.com%2F", None).await;
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unauthenticated_proxy_redirects_to_login() {
        let server = mockito::Server::new_async().await;
        let harness = harness(&server);

        let response = get(&harness.app, "/proxy/profiles/me", None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/");
        assert!(harness.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_proxy_and_logout() {
        let mut server = mockito::Server::new_async().await;
        let resource = server
            .mock("GET", "/api/v1/groups")
            .match_query(Matcher::UrlEncoded("limit".into(), "5".into()))
            .match_header("authorization", "Bearer AT")
            .with_status(200)
            .with_body(r#"{"groups":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let harness = harness(&server);
        let mut session = Session::default();
        session.apply_tokens(
            "acme",
            crate::auth::TokenSet {
                access_token: "AT".to_string(),
                refresh_token: "RT".to_string(),
                expires_at: chrono::Utc::now() + Duration::hours(1),
            },
        );
        harness.sessions.save("sid", session).await;
        let cookie = "namely_session=sid";

        let index = get(&harness.app, "/", Some(cookie)).await;
        assert!(body_string(index).await.contains("Signed in to <strong>acme</strong>"));

        let response = get(&harness.app, "/proxy/groups?limit=5", Some(cookie)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"groups":[]}"#);
        resource.assert_async().await;

        let logout = get(&harness.app, "/logout", Some(cookie)).await;
        assert_eq!(logout.status(), StatusCode::SEE_OTHER);
        assert!(harness.sessions.load("sid").await.is_none());

        let after = get(&harness.app, "/me", Some(cookie)).await;
        assert_eq!(location(&after), "/");
    }

    #[tokio::test]
    async fn test_encoded_traversal_is_bad_request() {
        let mut server = mockito::Server::new_async().await;
        let escaped = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let harness = harness(&server);
        let mut session = Session::default();
        session.apply_tokens(
            "acme",
            crate::auth::TokenSet {
                access_token: "AT".to_string(),
                refresh_token: "RT".to_string(),
                expires_at: chrono::Utc::now() + Duration::hours(1),
            },
        );
        harness.sessions.save("sid", session).await;

        let response = get(
            &harness.app,
            "/proxy/..%2F..%2Foauth2%2Fsecret",
            Some("namely_session=sid"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        escaped.assert_async().await;
    }

    #[tokio::test]
    async fn test_healthz() {
        let server = mockito::Server::new_async().await;
        let harness = harness(&server);
        let response = get(&harness.app, "/healthz", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok");
    }
}
