use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;

use super::oauth::{make_nonce, TokenSet};

/// Per-browser state kept on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Tenant the tokens belong to
    pub subdomain: Option<String>,
    /// Access token, refresh token and expiry travel together
    pub tokens: Option<TokenSet>,
    /// Outstanding login `state`, consumed by the callback
    pub nonce: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            subdomain: None,
            tokens: None,
            nonce: None,
            last_seen: Utc::now(),
        }
    }
}

impl Session {
    /// Start a login attempt, replacing any outstanding nonce.
    pub fn begin_login(&mut self, subdomain: &str, now: DateTime<Utc>) -> String {
        let nonce = make_nonce(subdomain, now);
        self.nonce = Some(nonce.clone());
        nonce
    }

    /// Take the outstanding nonce; it is never valid twice.
    pub fn take_nonce(&mut self) -> Option<String> {
        self.nonce.take()
    }

    /// Fold a successful exchange or refresh into the session.
    pub fn apply_tokens(&mut self, subdomain: &str, tokens: TokenSet) {
        self.subdomain = Some(subdomain.to_string());
        self.tokens = Some(tokens);
    }

    pub fn clear_tokens(&mut self) {
        self.tokens = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some() && self.subdomain.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Generate an opaque session id (32 random bytes, URL-safe base64).
pub fn new_session_id() -> String {
    let random_bytes: [u8; 32] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Server-side session persistence keyed by session id.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn load(&self, session_id: &str) -> Option<Session>;
    async fn save(&self, session_id: &str, session: Session);
    async fn remove(&self, session_id: &str);
}

/// In-process session store with idle expiry.
#[derive(Clone)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<String, Session>>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle longer than the TTL. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.signed_duration_since(session.last_seen) < self.ttl);
        before.saturating_sub(self.sessions.len())
    }

    /// Periodically sweep idle sessions on the current runtime.
    pub fn spawn_sweeper(&self, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = store.sweep(Utc::now());
                if removed > 0 {
                    tracing::debug!(removed, "Expired idle sessions");
                }
            }
        })
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Option<Session> {
        let session = self.sessions.get(session_id).map(|s| s.clone())?;
        if Utc::now().signed_duration_since(session.last_seen) >= self.ttl {
            self.sessions.remove(session_id);
            return None;
        }
        Some(session)
    }

    async fn save(&self, session_id: &str, mut session: Session) {
        session.last_seen = Utc::now();
        self.sessions.insert(session_id.to_string(), session);
    }

    async fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}
