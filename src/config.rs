//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::Driver;
use crate::store::{MemoryDriver, RedisDriver, SqlDriver, DEFAULT_TABLE};

/// Prefix for environment overrides, e.g. `TOLLGATE__DRIVER__URL`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Which backing store holds the time bases
    #[serde(default)]
    pub driver: DriverConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backing store selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriverConfig {
    /// Single-process, in-memory store
    Memory,
    /// PostgreSQL with row locking
    Postgres {
        url: String,
        #[serde(default = "default_table")]
        table: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Create the table on startup if it is missing
        #[serde(default)]
        ensure_schema: bool,
    },
    /// Redis with an atomic Lua script
    Redis {
        url: String,
        /// Load the script at startup instead of on first use
        #[serde(default = "default_preload_script")]
        preload_script: bool,
    },
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::Memory
    }
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_preload_script() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, as accepted by `tracing_subscriber::EnvFilter`
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Layer an optional YAML file and `TOLLGATE__*` environment variables
    /// over the defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&str>, prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }
        builder
            .add_source(
                // the tagged driver enum bypasses config's own coercion, so
                // numbers and booleans must be parsed here
                config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Connect to the configured store and return its driver.
    pub async fn build_driver(&self) -> Result<Box<dyn Driver>> {
        match &self.driver {
            DriverConfig::Memory => {
                info!("Using in-memory driver");
                Ok(Box::new(MemoryDriver::new()))
            }
            DriverConfig::Postgres {
                url,
                table,
                max_connections,
                ensure_schema,
            } => {
                let pool = PgPoolOptions::new()
                    .max_connections(*max_connections)
                    .connect(url)
                    .await
                    .map_err(|e| TollgateError::connect("PostgreSQL", e))?;
                let driver = SqlDriver::with_table(pool, table.clone())?;
                if *ensure_schema {
                    driver.ensure_schema().await?;
                }
                info!(table = %table, "Using PostgreSQL driver");
                Ok(Box::new(driver))
            }
            DriverConfig::Redis {
                url,
                preload_script,
            } => {
                let driver = RedisDriver::connect(url).await?;
                if *preload_script {
                    driver.load_script().await?;
                }
                info!("Using Redis driver");
                Ok(Box::new(driver))
            }
        }
    }
}
