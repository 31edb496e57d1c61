//! Queue store test utilities.

use mender_core::{InjuredSegment, PlacementConstraint, QueueConfig, ReverificationJob};
use mender_metadata::{
    MetadataError, MetadataResult, MetadataStore, PostgresStore, QueueMetrics, RepairQueueRepo,
    ReverifyQueueRepo, SqliteStore,
};
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::cockroach_db::CockroachDb;
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// Same marker for the CockroachDB container.
pub const COCKROACH_CONTAINER_START_ERR_PREFIX: &str = "cockroach-container-start:";

/// Attempts made by the retrying helpers before giving up on serialization conflicts.
const MAX_RETRIES: usize = 20;

/// A SQLite queue store in a temporary directory.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub metrics: Arc<QueueMetrics>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        Self::with_queue_config(QueueConfig::default()).await
    }

    pub async fn with_queue_config(queue: QueueConfig) -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("queue.db");
        let metrics = Arc::new(QueueMetrics::new());
        let store = SqliteStore::new(&db_path, None)
            .await?
            .with_queue_config(queue)
            .with_metrics(metrics.clone());

        Ok(Self {
            store: Arc::new(store),
            metrics,
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }
}

/// PostgreSQL queue store backed by a testcontainer.
#[allow(dead_code)]
pub struct PostgresTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub url: String,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        Self::with_queue_config(QueueConfig::default()).await
    }

    pub async fn with_queue_config(queue: QueueConfig) -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{} Failed to start PostgreSQL container: {e}",
                    POSTGRES_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        let store = PostgresStore::from_url(&url, 10, None)
            .await?
            .with_queue_config(queue);

        Ok(Self {
            store: Arc::new(store),
            url,
            _container: container,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }
}

/// CockroachDB queue store backed by a single-node insecure testcontainer.
#[allow(dead_code)]
pub struct CockroachTestMetadata {
    pub store: Arc<dyn MetadataStore>,
    _container: ContainerAsync<CockroachDb>,
}

impl CockroachTestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        Self::with_queue_config(QueueConfig::default()).await
    }

    pub async fn with_queue_config(queue: QueueConfig) -> MetadataResult<Self> {
        let container = CockroachDb::default().start().await.map_err(|e| {
            MetadataError::Internal(format!(
                "{} Failed to start CockroachDB container: {e}",
                COCKROACH_CONTAINER_START_ERR_PREFIX
            ))
        })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(26257)
            .await
            .expect("Failed to get port");

        let url = format!(
            "postgresql://root@{}:{}/defaultdb?sslmode=disable",
            host, port
        );

        let store = PostgresStore::cockroach(&url, 10, None)
            .await?
            .with_queue_config(queue);

        Ok(Self {
            store: Arc::new(store),
            _container: container,
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }
}

/// Try to create a PostgreSQL test store, skipping if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures cause a skip. Schema or connection errors
/// still panic so real regressions are not silently swallowed.
#[allow(dead_code)]
pub async fn postgres_or_skip(queue: QueueConfig) -> Option<PostgresTestMetadata> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestMetadata::with_queue_config(queue).await {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

/// CockroachDB counterpart of [`postgres_or_skip`], honoring SKIP_COCKROACH_TESTS.
#[allow(dead_code)]
pub async fn cockroach_or_skip(queue: QueueConfig) -> Option<CockroachTestMetadata> {
    if std::env::var("SKIP_COCKROACH_TESTS").is_ok() {
        return None;
    }
    match CockroachTestMetadata::with_queue_config(queue).await {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(COCKROACH_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping CockroachDB test (Docker unavailable): {msg}");
                None
            } else {
                panic!("CockroachDB test setup failed: {msg}");
            }
        }
    }
}

/// Run a test against SQLite, PostgreSQL and CockroachDB.
#[allow(dead_code)]
pub async fn run_queue_test_all<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn MetadataStore>) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    run_queue_test_all_with_config(QueueConfig::default(), test_fn).await;
}

/// Run a test against every backend, each configured with `queue`.
#[allow(dead_code)]
pub async fn run_queue_test_all_with_config<F, Fut>(queue: QueueConfig, test_fn: F)
where
    F: Fn(Arc<dyn MetadataStore>) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestMetadata::with_queue_config(queue)
        .await
        .expect("Failed to create SQLite test metadata");
    test_fn.clone()(sqlite.store()).await;

    if let Some(postgres) = postgres_or_skip(queue).await {
        test_fn.clone()(postgres.store()).await;
    }

    if let Some(cockroach) = cockroach_or_skip(queue).await {
        test_fn(cockroach.store()).await;
    }
}

/// `select` that retries serialization conflicts the way a worker would.
#[allow(dead_code)]
pub async fn select_retrying(
    store: &Arc<dyn MetadataStore>,
    limit: u32,
    included: &[PlacementConstraint],
    excluded: &[PlacementConstraint],
) -> MetadataResult<Vec<InjuredSegment>> {
    let mut attempt = 0;
    loop {
        match store.select(limit, included, excluded).await {
            Err(err) if err.is_retryable() && attempt < MAX_RETRIES => attempt += 1,
            other => return other,
        }
    }
}

/// `get_next_job` that retries serialization conflicts.
#[allow(dead_code)]
pub async fn next_job_retrying(store: &Arc<dyn MetadataStore>) -> MetadataResult<ReverificationJob> {
    let mut attempt = 0;
    loop {
        match store.get_next_job().await {
            Err(err) if err.is_retryable() && attempt < MAX_RETRIES => attempt += 1,
            other => return other,
        }
    }
}

/// Make previously claimed segments eligible again by moving their attempt
/// time past the cooldown.
#[allow(dead_code)]
pub async fn expire_attempts(
    store: &Arc<dyn MetadataStore>,
    segments: &[InjuredSegment],
    queue: &QueueConfig,
) {
    let expired = time::OffsetDateTime::now_utc()
        - queue.repair_attempt_cooldown()
        - time::Duration::minutes(1);
    for segment in segments {
        store
            .testing_set_attempted_time(segment.stream_id, segment.position, expired)
            .await
            .expect("Failed to set attempted time");
    }
}
