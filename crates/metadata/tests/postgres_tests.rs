//! Backend-specific tests for the PostgreSQL wire-protocol store.
//!
//! These tests require Docker. Set SKIP_POSTGRES_TESTS=1 or
//! SKIP_COCKROACH_TESTS=1 to skip them.

mod common;

use common::{cockroach_or_skip, postgres_or_skip, segment};
use mender_core::config::MetadataConfig;
use mender_core::QueueConfig;
use mender_metadata::{
    Backend, MetadataError, MetadataStore, PostgresStore, QueueMetrics, RepairQueueRepo,
    from_config,
};
use std::sync::Arc;

#[tokio::test]
async fn test_postgres_reports_backend_and_is_healthy() {
    let Some(metadata) = postgres_or_skip(QueueConfig::default()).await else {
        return;
    };
    let store = metadata.store();
    assert_eq!(store.backend(), Backend::Postgres);
    store.health_check().await.expect("Health check failed");
    store.migrate().await.expect("Second migrate failed");
}

#[tokio::test]
async fn test_cockroach_reports_backend() {
    let Some(metadata) = cockroach_or_skip(QueueConfig::default()).await else {
        return;
    };
    let store = metadata.store();
    assert_eq!(store.backend(), Backend::Cockroach);
    store.health_check().await.expect("Health check failed");
}

#[tokio::test]
async fn test_serializable_precondition_rejects_read_committed() {
    let Some(metadata) = postgres_or_skip(QueueConfig::default()).await else {
        return;
    };

    // PostgreSQL defaults to read committed, so the lock-free claim path must
    // refuse to run against it.
    let err = match PostgresStore::cockroach(&metadata.url, 2, None).await {
        Ok(_) => panic!("lock-free claims accepted a read committed database"),
        Err(err) => err,
    };
    assert!(matches!(err, MetadataError::Config(_)), "got {err}");
    assert!(err.to_string().contains("serializable"));
}

#[tokio::test]
async fn test_from_config_postgres_url() {
    let Some(metadata) = postgres_or_skip(QueueConfig::default()).await else {
        return;
    };

    let config = MetadataConfig::Postgres {
        url: Some(metadata.url.clone()),
        host: None,
        port: None,
        username: None,
        password: None,
        database: None,
        ssl_mode: None,
        max_connections: 4,
        statement_timeout_ms: Some(5_000),
    };
    let metrics = Arc::new(QueueMetrics::new());
    let store = from_config(&config, QueueConfig::default(), metrics.clone())
        .await
        .expect("from_config failed");
    assert_eq!(store.backend(), Backend::Postgres);

    assert!(!store.insert(&segment(0.5, 0)).await.expect("Insert failed"));
    assert_eq!(metrics.operation_count("repair", "insert", "ok"), 1);
}

#[tokio::test]
async fn test_statement_timeout_is_applied() {
    let Some(metadata) = postgres_or_skip(QueueConfig::default()).await else {
        return;
    };

    let store = PostgresStore::from_url(&metadata.url, 2, Some(1_234))
        .await
        .expect("Connect failed");
    let timeout: String = sqlx::query_scalar("SHOW statement_timeout")
        .fetch_one(store.pool())
        .await
        .expect("SHOW failed");
    assert_eq!(timeout, "1234ms");
}
