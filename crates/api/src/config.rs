//! API server configuration

use shopsub_billing::{BillingConfig, ConfigError};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    /// Apply embedded migrations on startup
    pub run_migrations: bool,
    pub billing: BillingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port: u16 = match lookup("HTTP_PORT") {
            Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid("HTTP_PORT"))?,
            None => 8080,
        };
        let run_migrations = match lookup("RUN_MIGRATIONS") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("RUN_MIGRATIONS"))?,
            None => true,
        };

        Ok(Self {
            bind_address: format!("0.0.0.0:{}", port),
            database_url: lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            run_migrations,
            billing: BillingConfig::from_lookup(&lookup)?,
        })
    }
}
