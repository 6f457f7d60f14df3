//! Bearer-token supply for HTTP calls and socket handshakes.

use std::sync::Arc;

/// Returns the current bearer token, or `None` when logged out.
///
/// Invoked on every request and every socket (re)connection attempt, so a
/// refreshed token is picked up without rebuilding clients.
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// A provider that always returns the same token.
pub fn static_token(token: impl Into<String>) -> TokenProvider {
    let token = token.into();
    Arc::new(move || Some(token.clone()))
}
