//! Configuration types shared across crates.

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::Duration;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "MENDER_";

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
///
/// The active variant selects the relational engine for the whole process.
/// It is read once at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (recommended for testing and small deployments only).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot force-cancel queries).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host (e.g., "localhost" or "db.example.com").
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer MENDER_METADATA__PASSWORD env var over storing in config.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds (prevents hung queries).
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
    /// CockroachDB, reached over the PostgreSQL wire protocol.
    ///
    /// Claims rely on serializable isolation; the store refuses to start
    /// if the cluster default is anything weaker.
    Cockroach {
        /// Connection URL (e.g. "postgresql://root@localhost:26257/defaultdb").
        url: String,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
    /// Cloud Spanner. Parsed so that configurations round-trip, but there
    /// is no query path for it.
    Spanner {
        /// Fully qualified database name.
        database: String,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600) // advisory only
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/queue.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Short name of the configured backend, used in logs and errors.
    pub fn backend_name(&self) -> &'static str {
        match self {
            MetadataConfig::Sqlite { .. } => "sqlite",
            MetadataConfig::Postgres { .. } => "postgres",
            MetadataConfig::Cockroach { .. } => "cockroach",
            MetadataConfig::Spanner { .. } => "spanner",
        }
    }

    /// Validate metadata configuration invariants.
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } | MetadataConfig::Spanner { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
            MetadataConfig::Cockroach {
                url,
                max_connections,
                ..
            } => {
                if url.trim().is_empty() {
                    return Err("cockroach config requires a non-empty 'url'".to_string());
                }
                if *max_connections == 0 {
                    return Err("cockroach max_connections must be at least 1".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Longest accepted cooldown or retry interval (one year).
pub const MAX_QUEUE_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Timing and sizing knobs for the queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds after a repair claim before the segment may be selected again.
    #[serde(default = "default_repair_attempt_cooldown_secs")]
    pub repair_attempt_cooldown_secs: u64,
    /// Seconds after a reverification claim before the job may be handed out again.
    #[serde(default = "default_reverify_retry_interval_secs")]
    pub reverify_retry_interval_secs: u64,
    /// Upper bound on the number of segments a single select may claim.
    #[serde(default = "default_max_claim_batch")]
    pub max_claim_batch: u32,
}

fn default_repair_attempt_cooldown_secs() -> u64 {
    6 * 60 * 60
}

fn default_reverify_retry_interval_secs() -> u64 {
    4 * 60 * 60
}

fn default_max_claim_batch() -> u32 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            repair_attempt_cooldown_secs: default_repair_attempt_cooldown_secs(),
            reverify_retry_interval_secs: default_reverify_retry_interval_secs(),
            max_claim_batch: default_max_claim_batch(),
        }
    }
}

impl QueueConfig {
    /// Repair attempt cooldown as a duration.
    pub fn repair_attempt_cooldown(&self) -> Duration {
        Duration::seconds(i64::try_from(self.repair_attempt_cooldown_secs).unwrap_or(i64::MAX))
    }

    /// Reverification retry interval as a duration.
    pub fn reverify_retry_interval(&self) -> Duration {
        Duration::seconds(i64::try_from(self.reverify_retry_interval_secs).unwrap_or(i64::MAX))
    }

    /// Validate queue configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.repair_attempt_cooldown_secs == 0 {
            return Err("repair_attempt_cooldown_secs must be greater than zero".to_string());
        }
        if self.reverify_retry_interval_secs == 0 {
            return Err("reverify_retry_interval_secs must be greater than zero".to_string());
        }
        if self.max_claim_batch == 0 {
            return Err("max_claim_batch must be greater than zero".to_string());
        }
        if self.repair_attempt_cooldown_secs > MAX_QUEUE_INTERVAL_SECS {
            return Err(format!(
                "repair_attempt_cooldown_secs must be at most {MAX_QUEUE_INTERVAL_SECS}"
            ));
        }
        if self.reverify_retry_interval_secs > MAX_QUEUE_INTERVAL_SECS {
            return Err(format!(
                "reverify_retry_interval_secs must be at most {MAX_QUEUE_INTERVAL_SECS}"
            ));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Queue timing configuration.
    #[serde(default)]
    pub queue: QueueConfig,
}

impl AppConfig {
    /// Load configuration from an optional TOML file, overridden by
    /// `MENDER_`-prefixed environment variables (`__` separates nesting,
    /// e.g. `MENDER_QUEUE__MAX_CLAIM_BATCH=50`).
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(crate::Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate configuration from a prepared figment.
    pub fn from_figment(figment: Figment) -> crate::Result<Self> {
        let config: AppConfig = figment
            .extract()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate().map_err(crate::Error::Config)?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.queue.validate()
    }
}
