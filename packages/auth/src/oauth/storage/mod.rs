// ABOUTME: Token persistence abstraction shared by every grant flow
// ABOUTME: Provides an in-memory store and an atomic, lock-protected JSON file store

mod file;
mod memory;

use async_trait::async_trait;

use crate::{error::AuthResult, oauth::types::TokenInfo};

pub use file::{sanitize_username, FileTokenStore};
pub use memory::MemoryTokenStore;

/// Where the most recently issued token lives between calls and processes.
///
/// Reads always return a copy; mutating it never affects the store.
/// A store with nothing in it yields `Ok(None)`.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_cached_token(&self) -> AuthResult<Option<TokenInfo>>;

    async fn save_token_to_cache(&self, token: &TokenInfo) -> AuthResult<()>;

    /// Forget the stored token; clearing an empty store is not an error
    async fn clear(&self) -> AuthResult<()>;
}
