use anyhow::{Context, Result};
use chrono::Duration;

/// Path the upstream authorization server redirects back to.
pub const CALLBACK_PATH: &str = "/api/clients/redirect_success";

/// Gateway configuration, loaded once from environment variables at start-up.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,
    /// Externally visible base URL, used to build the OAuth redirect URI
    pub public_url: String,

    // ── OAuth Client Credentials ────────────────────────────────────────
    pub client_id: String,
    pub client_secret: String,

    // ── Upstream ────────────────────────────────────────────────────────
    /// Domain and path prefix that follows the tenant subdomain,
    /// e.g. `namely.com/api/v1`.
    pub api_base: String,
    pub api_scheme: String,
    pub upstream_timeout: std::time::Duration,

    // ── Sessions ────────────────────────────────────────────────────────
    /// Tokens expiring within this margin are refreshed before use.
    pub expiry_margin: Duration,
    pub session_ttl: Duration,
    pub secure_cookies: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port: u16 = lookup("PORT")
            .unwrap_or_else(|| "8080".into())
            .parse()
            .context("Invalid PORT")?;

        let client_id = lookup("OAUTH_CLIENT_ID")
            .filter(|v| !v.is_empty())
            .context("OAUTH_CLIENT_ID is required")?;
        let client_secret = lookup("OAUTH_CLIENT_SECRET")
            .filter(|v| !v.is_empty())
            .context("OAUTH_CLIENT_SECRET is required")?;

        let public_url = lookup("PUBLIC_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();
        url::Url::parse(&public_url).context("Invalid PUBLIC_URL")?;

        Ok(GatewayConfig {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            public_url,
            client_id,
            client_secret,
            api_base: lookup("API_BASE")
                .unwrap_or_else(|| "namely.com/api/v1".into())
                .trim_matches('/')
                .to_string(),
            api_scheme: lookup("API_SCHEME").unwrap_or_else(|| "https".into()),
            upstream_timeout: std::time::Duration::from_secs(
                parse_secs(&lookup, "UPSTREAM_TIMEOUT_SECS", 30)?,
            ),
            expiry_margin: parse_duration(&lookup, "TOKEN_EXPIRY_MARGIN_SECS", 30)?,
            session_ttl: parse_duration(&lookup, "SESSION_TTL_SECS", 86_400)?,
            secure_cookies: lookup("SECURE_COOKIES")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }

    /// Base URL of a tenant's API, e.g. `https://acme.namely.com/api/v1`.
    pub fn tenant_base_url(&self, subdomain: &str) -> String {
        format!("{}://{}.{}", self.api_scheme, subdomain, self.api_base)
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}{}", self.public_url, CALLBACK_PATH)
    }
}

fn parse_secs<F>(lookup: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => v.parse().with_context(|| format!("Invalid {key}")),
        None => Ok(default),
    }
}

/// Non-negative whole seconds as a `chrono::Duration`.
fn parse_duration<F>(lookup: &F, key: &str, default: i64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: i64 = match lookup(key) {
        Some(v) => v.parse().with_context(|| format!("Invalid {key}"))?,
        None => default,
    };
    if secs < 0 {
        anyhow::bail!("Invalid {key}: must not be negative");
    }
    Duration::try_seconds(secs).with_context(|| format!("Invalid {key}: {secs} seconds is out of range"))
}
