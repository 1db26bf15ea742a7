// ABOUTME: Sonata authentication library providing the OAuth2 grant flows
// ABOUTME: Client credentials, authorization code, PKCE, and implicit grant with cached, lock-protected tokens

pub mod error;
pub mod oauth;

// Re-export main types
pub use error::{is_transient_network_error, AuthError, AuthResult};
pub use oauth::{
    AuthManager, AuthorizationCodeFlow, CallbackServer, ClientCredentialsFlow, Endpoints,
    FileTokenStore, ImplicitGrantFlow, MemoryTokenStore, OAuthConfig, PkceChallenge, PkceFlow,
    TokenInfo, TokenStore,
};
