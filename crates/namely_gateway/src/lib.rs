//! Namely Gateway
//!
//! Signs a browser into a Namely tenant with the OAuth2 authorization-code
//! flow and proxies authenticated GET requests to that tenant's API.
//!
//! # Features
//! - Tenant-bound `state` nonce, validated and consumed on callback
//! - Server-side sessions holding access/refresh tokens
//! - Transparent refresh on expiry or on a 403, at most once per request
//! - Upstream status and body relayed verbatim

pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;
pub mod server;

pub use auth::{MemorySessionStore, Session, SessionStore, TokenManager, TokenSet};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use proxy::{ApiProxy, UpstreamResponse};
pub use server::{build_router, start_server, AppState};
