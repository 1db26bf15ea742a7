// ABOUTME: Environment variable name constants and fixed provider endpoints
// ABOUTME: Centralized definitions of every environment variable and URL default used across Sonata

// Credential Configuration
pub const SONATA_CLIENT_ID: &str = "SONATA_CLIENT_ID";
pub const SONATA_CLIENT_SECRET: &str = "SONATA_CLIENT_SECRET";
pub const SONATA_REDIRECT_URI: &str = "SONATA_REDIRECT_URI";

// Token Cache Configuration
pub const SONATA_USERNAME: &str = "SONATA_USERNAME";

// Provider Endpoints
pub const DEFAULT_AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1/";

// HTTP Defaults
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
