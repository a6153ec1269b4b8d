/// Collector configuration
/// Worker counts, poll intervals and backoff bounds from environment
/// variables; the cluster layout itself comes from the shared YAML config.

use std::env;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub cluster_config_path: String,

    pub capacity_workers: usize,
    pub usage_workers: usize,
    pub capacity_scrape_interval_secs: u64,
    pub usage_scrape_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub mail_poll_interval_secs: u64,

    pub backoff_base_interval_secs: u64,
    pub backoff_max_interval_secs: u64,
    /// None means retry forever; the failure counter still grows.
    pub mail_max_retries: Option<i64>,
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidConfig(format!("{}={:?}: {}", key, raw, e))),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize, ConfigError> {
    Ok(env_u64(key, default as u64)? as usize)
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnv("DATABASE_URL".into()))?;
        let cluster_config_path =
            env::var("QUOTAD_CONFIG").unwrap_or_else(|_| "./quotad.yaml".to_string());

        let config = CollectorConfig {
            database_url,
            max_connections: env_u64("COLLECTOR_DB_MAX_CONNECTIONS", 10)? as u32,
            cluster_config_path,
            capacity_workers: env_usize("COLLECTOR_CAPACITY_WORKERS", 2)?,
            usage_workers: env_usize("COLLECTOR_USAGE_WORKERS", 4)?,
            capacity_scrape_interval_secs: env_u64("COLLECTOR_CAPACITY_SCRAPE_INTERVAL_SECS", 900)?,
            usage_scrape_interval_secs: env_u64("COLLECTOR_USAGE_SCRAPE_INTERVAL_SECS", 300)?,
            sweep_interval_secs: env_u64("COLLECTOR_SWEEP_INTERVAL_SECS", 60)?,
            mail_poll_interval_secs: env_u64("COLLECTOR_MAIL_POLL_INTERVAL_SECS", 10)?,
            backoff_base_interval_secs: env_u64("COLLECTOR_BACKOFF_BASE_SECS", 60)?,
            backoff_max_interval_secs: env_u64("COLLECTOR_BACKOFF_MAX_SECS", 1800)?,
            mail_max_retries: match env::var("COLLECTOR_MAIL_MAX_RETRIES") {
                Err(_) => None,
                Ok(raw) => Some(raw.parse().map_err(|e| {
                    ConfigError::InvalidConfig(format!("COLLECTOR_MAIL_MAX_RETRIES={:?}: {}", raw, e))
                })?),
            },
        };
        config.validate()?;

        info!(
            capacity_workers = config.capacity_workers,
            usage_workers = config.usage_workers,
            capacity_interval = config.capacity_scrape_interval_secs,
            usage_interval = config.usage_scrape_interval_secs,
            "Collector configuration loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity_workers == 0 || self.usage_workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "worker counts must be positive".into(),
            ));
        }
        if self.capacity_scrape_interval_secs < 10 || self.usage_scrape_interval_secs < 10 {
            return Err(ConfigError::InvalidConfig(
                "scrape intervals must be at least 10 seconds".into(),
            ));
        }
        if self.backoff_base_interval_secs == 0
            || self.backoff_max_interval_secs < self.backoff_base_interval_secs
        {
            return Err(ConfigError::InvalidConfig(
                "backoff interval bounds are inconsistent".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = CollectorConfig {
            database_url: "postgresql://localhost/quotad".into(),
            max_connections: 5,
            cluster_config_path: "./quotad.yaml".into(),
            capacity_workers: 0,
            usage_workers: 4,
            capacity_scrape_interval_secs: 900,
            usage_scrape_interval_secs: 300,
            sweep_interval_secs: 60,
            mail_poll_interval_secs: 10,
            backoff_base_interval_secs: 60,
            backoff_max_interval_secs: 1800,
            mail_max_retries: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff_bounds() {
        let config = CollectorConfig {
            database_url: "postgresql://localhost/quotad".into(),
            max_connections: 5,
            cluster_config_path: "./quotad.yaml".into(),
            capacity_workers: 2,
            usage_workers: 4,
            capacity_scrape_interval_secs: 900,
            usage_scrape_interval_secs: 300,
            sweep_interval_secs: 60,
            mail_poll_interval_secs: 10,
            backoff_base_interval_secs: 600,
            backoff_max_interval_secs: 60,
            mail_max_retries: None,
        };
        assert!(config.validate().is_err());
    }
}
