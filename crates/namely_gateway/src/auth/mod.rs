//! OAuth2 client and session state.

pub mod oauth;
pub mod session;

pub use oauth::{make_nonce, nonce_subdomain, TokenManager, TokenSet, NONCE_DELIMITER};
pub use session::{new_session_id, MemorySessionStore, Session, SessionStore};
