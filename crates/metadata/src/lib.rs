//! Durable work queues for mender.
//!
//! This crate persists the two queues that feed background workers:
//! - the segment repair queue, ordered by segment health and claimed in batches
//! - the reverification audit queue, claimed one job at a time in FIFO order
//!
//! Claims are atomic on every backend, so any number of workers may share one
//! database without handing out the same row twice inside a cooldown window.

pub mod dialect;
pub mod error;
pub mod metrics;
pub mod models;
pub mod placement;
pub mod postgres;
pub mod repos;
pub mod store;

pub use dialect::{Backend, ClaimStrategy, UpsertStrategy};
pub use error::{MetadataError, MetadataResult};
pub use metrics::QueueMetrics;
pub use postgres::PostgresStore;
pub use repos::{RepairQueueRepo, RepairQueueStat, ReverifyQueueRepo};
pub use store::{MetadataStore, SqliteStore};

use mender_core::config::MetadataConfig;
use mender_core::QueueConfig;
use std::sync::Arc;

/// Create a queue store from configuration.
pub async fn from_config(
    config: &MetadataConfig,
    queue: QueueConfig,
    metrics: Arc<QueueMetrics>,
) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate().map_err(MetadataError::Config)?;
    queue.validate().map_err(MetadataError::Config)?;

    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs)
                .await?
                .with_queue_config(queue)
                .with_metrics(metrics);
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store.with_queue_config(queue).with_metrics(metrics))
                as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Cockroach {
            url,
            max_connections,
            statement_timeout_ms,
        } => {
            tracing::info!("Connecting to CockroachDB using connection URL");
            let store =
                PostgresStore::cockroach(url, *max_connections, *statement_timeout_ms).await?;
            Ok(Arc::new(store.with_queue_config(queue).with_metrics(metrics))
                as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Spanner { database } => Err(MetadataError::UnsupportedBackend(format!(
            "spanner ({database}) has no queue implementation"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mender_core::config::MetadataConfig;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("queue.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            query_timeout_secs: None,
        };

        let store = from_config(&config, QueueConfig::default(), Arc::new(QueueMetrics::new()))
            .await
            .unwrap();
        store.health_check().await.unwrap();
        assert_eq!(store.backend(), Backend::Sqlite);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_from_config_spanner_is_unsupported() {
        let config = MetadataConfig::Spanner {
            database: "projects/p/instances/i/databases/d".to_string(),
        };
        let err = match from_config(&config, QueueConfig::default(), Arc::new(QueueMetrics::new()))
            .await
        {
            Ok(_) => panic!("spanner must not produce a store"),
            Err(err) => err,
        };
        assert!(matches!(err, MetadataError::UnsupportedBackend(_)));
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid_queue_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = MetadataConfig::Sqlite {
            path: temp_dir.path().join("queue.db"),
            query_timeout_secs: None,
        };
        let queue = QueueConfig {
            max_claim_batch: 0,
            ..QueueConfig::default()
        };
        let err = match from_config(&config, queue, Arc::new(QueueMetrics::new())).await {
            Ok(_) => panic!("invalid queue config must be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, MetadataError::Config(_)));
    }
}
