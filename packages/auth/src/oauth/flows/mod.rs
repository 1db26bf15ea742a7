// ABOUTME: The four OAuth2 grant flows implementing AuthManager
// ABOUTME: Client credentials, authorization code, PKCE, and implicit grant

mod authorization_code;
mod client_credentials;
mod implicit;
mod pkce;

pub use authorization_code::AuthorizationCodeFlow;
pub use client_credentials::ClientCredentialsFlow;
pub use implicit::{parse_token_fragment, parse_token_from_url, ImplicitGrantFlow};
pub use pkce::PkceFlow;
