// ABOUTME: Sonata configuration package
// ABOUTME: Environment variable names, provider endpoint defaults, and explicit-over-env resolution

pub mod constants;
pub mod env;
pub mod error;

pub use env::{env_fallback, require};
pub use error::{ConfigError, ConfigResult};
