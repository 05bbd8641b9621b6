//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_direct_url: Option<String>,

    // Admin surface
    pub admin_api_token: String,

    // Feature flags
    pub enable_billing: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_direct_url: env::var("DATABASE_DIRECT_URL").ok(),

            admin_api_token: env::var("ADMIN_API_TOKEN")
                .map_err(|_| ConfigError::Missing("ADMIN_API_TOKEN"))?,

            enable_billing: env::var("ENABLE_BILLING")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_database_url_is_reported() {
        // Only assert the error formatting; env-dependent loading is
        // covered by deployment smoke tests.
        let err = ConfigError::Missing("DATABASE_URL");
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
