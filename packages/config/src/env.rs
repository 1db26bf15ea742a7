// ABOUTME: Explicit-argument-first lookup with environment variable fallback
// ABOUTME: Blank values are treated as absent so an empty export never shadows a real setting

use std::env;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Resolve a setting: explicit value wins, then the environment variable.
pub fn env_fallback(explicit: Option<&str>, env_var: &str) -> Option<String> {
    if let Some(value) = explicit.map(str::trim).filter(|v| !v.is_empty()) {
        return Some(value.to_string());
    }

    match env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => {
            debug!("Using {} from environment", env_var);
            Some(value.trim().to_string())
        }
        _ => None,
    }
}

/// Like [`env_fallback`] but a missing value is a configuration error.
pub fn require(
    explicit: Option<&str>,
    field: &'static str,
    env_var: &'static str,
) -> ConfigResult<String> {
    env_fallback(explicit, env_var).ok_or(ConfigError::Missing { field, env_var })
}
