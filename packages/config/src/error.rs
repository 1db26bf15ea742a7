// ABOUTME: Error types for configuration resolution
// ABOUTME: Reports which explicit argument and environment variable were consulted

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing {field}: pass it explicitly or set {env_var}")]
    Missing {
        field: &'static str,
        env_var: &'static str,
    },
}
