// ABOUTME: OAuth module providing the grant flows and their building blocks
// ABOUTME: Includes token types, scope and PKCE helpers, token stores, and the loopback callback server

pub mod flows;
pub mod manager;
pub mod pkce;
pub mod scope;
pub mod server;
pub mod storage;
pub mod types;

pub use flows::{
    parse_token_fragment, parse_token_from_url, AuthorizationCodeFlow, ClientCredentialsFlow,
    ImplicitGrantFlow, PkceFlow,
};
pub use manager::{basic_auth_header, parse_response_code, AuthManager, OAuthBase};
pub use pkce::{
    generate_code_challenge, generate_code_verifier, generate_state, verify_code_challenge,
    PkceChallenge,
};
pub use scope::{normalize_scope, scope_satisfied, scope_set};
pub use server::{redirect_port, BoundCallbackServer, CallbackServer};
pub use storage::{sanitize_username, FileTokenStore, MemoryTokenStore, TokenStore};
pub use types::{Endpoints, OAuthConfig, TokenInfo, TokenResponse};
