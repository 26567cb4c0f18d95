//! Configuration loading
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`relay.toml` in the working directory, or `RELAY_CONFIG_PATH`)
//! 3. Environment variables (`RELAY_DATABASE__URL`, `RELAY_TRIGGER__UI_BASE_URL`, ...)
//! 4. Explicit builder overrides
//!
//! `RELAY_DATABASE_URL` is also honoured as a shorthand for the database url.
//! A `.env` file is loaded first if present.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_NAME: &str = "relay";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Poll interval applied when a request does not set one.
    pub poll_interval_secs: u64,
    /// Overall wait timeout applied when a request does not set one. 0 = none.
    pub timeout_secs: u64,
    /// Base url used to render links to triggered runs.
    pub ui_base_url: String,
}

impl TriggerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumptionConfig {
    /// How often the resumption worker looks for due waits.
    pub worker_poll_interval_ms: u64,
    /// Maximum waits claimed per worker pass.
    pub batch_size: i64,
    /// How long a claimed wait stays hidden from other workers.
    pub claim_lease_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub trigger: TriggerConfig,
    pub resumption: ResumptionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                max_connections: 20,
                min_connections: 2,
                acquire_timeout_secs: 30,
                idle_timeout_secs: 600,
                max_lifetime_secs: 1800,
            },
            trigger: TriggerConfig {
                poll_interval_secs: 60,
                timeout_secs: 0,
                ui_base_url: "http://localhost:8080".to_string(),
            },
            resumption: ResumptionConfig {
                worker_poll_interval_ms: 1000,
                batch_size: 50,
                claim_lease_secs: 30,
            },
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load configuration from the default sources.
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    /// Database url, or an error explaining how to set one.
    pub fn database_url(&self) -> Result<&str> {
        self.database.url.as_deref().context(
            "Database URL not configured. Set RELAY_DATABASE_URL, pass --database-url, \
             or add [database] url to relay.toml",
        )
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
    require_database: bool,
}

impl ConfigBuilder {
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Fail the build when no database url is configured.
    pub fn require_database(mut self, require: bool) -> Self {
        self.require_database = require;
        self
    }

    pub fn build(self) -> Result<Config> {
        // Missing .env is not an error
        let _ = dotenvy::dotenv();

        let defaults = config::Config::try_from(&Config::default())
            .context("Failed to encode default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        let explicit_path = self
            .config_path
            .or_else(|| std::env::var("RELAY_CONFIG_PATH").ok().map(PathBuf::from));
        builder = match explicit_path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_NAME).required(false)),
        };

        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__"),
        );

        if let Ok(url) = std::env::var("RELAY_DATABASE_URL") {
            builder = builder
                .set_override("database.url", url)
                .context("Failed to apply RELAY_DATABASE_URL")?;
        }
        if let Some(url) = self.database_url {
            builder = builder
                .set_override("database.url", url)
                .context("Failed to apply database url override")?;
        }

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if self.require_database {
            config.database_url()?;
        }
        if config.database.min_connections > config.database.max_connections {
            anyhow::bail!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                config.database.min_connections,
                config.database.max_connections
            );
        }

        Ok(config)
    }
}
