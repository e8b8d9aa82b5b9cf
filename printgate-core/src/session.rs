//! Upstream session state
//!
//! One instance per process, shared by every dispatcher call. The token is
//! opaque: the gateway never expires it, it is only replaced after the
//! upstream server rejects it and a fresh login succeeds.

use std::sync::Arc;

use tokio::sync::RwLock;

/// Handle to the current upstream session token.
///
/// Clones share the same cell.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    token: Arc<RwLock<Option<String>>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token, if a login has succeeded.
    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// Replace the token. Only the authenticator writes; last writer wins.
    pub(crate) async fn store(&self, token: String) {
        *self.token.write().await = Some(token);
    }
}
