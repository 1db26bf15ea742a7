// ABOUTME: In-process token store guarded by a mutex
// ABOUTME: Hands out clones so callers can never corrupt the stored value

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::TokenStore;
use crate::{error::AuthResult, oauth::types::TokenInfo};

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<TokenInfo>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the store, e.g. with a token obtained out of band
    pub fn with_token(token: TokenInfo) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get_cached_token(&self) -> AuthResult<Option<TokenInfo>> {
        Ok(self.token.lock().await.clone())
    }

    async fn save_token_to_cache(&self, token: &TokenInfo) -> AuthResult<()> {
        debug!("Caching token in memory");
        *self.token.lock().await = Some(token.clone());
        Ok(())
    }

    async fn clear(&self) -> AuthResult<()> {
        *self.token.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn token(access: &str) -> TokenInfo {
        TokenInfo {
            access_token: access.to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            expires_at: 1_700_003_600,
            refresh_token: None,
            scope: String::new(),
            additional_fields: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_store_returns_none() {
        let store = MemoryTokenStore::new();
        assert!(store.get_cached_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_returned_token_is_a_copy() {
        let store = MemoryTokenStore::with_token(token("original"));

        let mut first = store.get_cached_token().await.unwrap().unwrap();
        first.access_token = "mutated".to_string();

        let second = store.get_cached_token().await.unwrap().unwrap();
        assert_eq!(second.access_token, "original");
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryTokenStore::with_token(token("a"));
        store.clear().await.unwrap();
        assert!(store.get_cached_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let store = Arc::new(MemoryTokenStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save_token_to_cache(&token(&format!("t{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let stored = store.get_cached_token().await.unwrap().unwrap();
        assert!(stored.access_token.starts_with('t'));
    }
}
