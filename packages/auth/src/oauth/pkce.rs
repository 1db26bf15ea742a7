// ABOUTME: PKCE (Proof Key for Code Exchange) implementation for OAuth 2.0
// ABOUTME: Generates code verifiers, SHA256 challenges, and CSRF state values

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes behind a verifier; 64 bytes encode to 86 characters (RFC 7636 allows 43-128)
const VERIFIER_BYTES: usize = 64;

pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// PKCE verifier/challenge pair for one manager instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge {
    pub code_verifier: String,
    pub code_challenge: String,
}

impl PkceChallenge {
    /// Generate a fresh pair
    pub fn generate() -> Self {
        Self::from_verifier(generate_code_verifier())
    }

    /// Derive the challenge for an existing verifier
    pub fn from_verifier(code_verifier: impl Into<String>) -> Self {
        let code_verifier = code_verifier.into();
        let code_challenge = generate_code_challenge(&code_verifier);
        Self {
            code_verifier,
            code_challenge,
        }
    }

    pub fn method(&self) -> &'static str {
        CODE_CHALLENGE_METHOD
    }
}

/// Generate a random code verifier: URL-safe base64 without padding
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate SHA256 code challenge from verifier
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Verify that a code verifier matches a code challenge
///
/// This is done by the authorization server, but is useful for tests.
pub fn verify_code_challenge(verifier: &str, challenge: &str) -> bool {
    generate_code_challenge(verifier) == challenge
}

/// Opaque random value round-tripped through the provider for CSRF protection
pub fn generate_state() -> String {
    nanoid::nanoid!(32)
}
