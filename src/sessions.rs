use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::models::SandboxKey;

/// Continuation tokens of assistant conversations, in memory only.
#[derive(Clone, Default)]
pub struct SessionStore {
    tokens: Arc<RwLock<HashMap<SandboxKey, String>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &SandboxKey) -> Option<String> {
        self.tokens.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: &SandboxKey, token: impl Into<String>) {
        self.tokens.write().await.insert(key.clone(), token.into());
    }

    /// Returns whether a token was stored.
    pub async fn clear(&self, key: &SandboxKey) -> bool {
        self.tokens.write().await.remove(key).is_some()
    }
}
