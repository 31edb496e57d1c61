//! Reverification queue behavior, run against every available backend.

mod common;

use common::{next_job_retrying, piece_on, run_queue_test_all, unique_node_id};
use futures::future::join_all;
use mender_core::{PieceLocator, QueueConfig};
use mender_metadata::{MetadataError, MetadataStore, ReverifyQueueRepo};
use std::collections::HashSet;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

#[tokio::test]
async fn test_jobs_come_out_in_insertion_order() {
    run_queue_test_all(|store: Arc<dyn MetadataStore>| async move {
        let node = unique_node_id();
        let jobs: Vec<PieceLocator> = (0..3).map(|n| piece_on(node, n)).collect();
        for locator in &jobs {
            store
                .insert_reverification(locator)
                .await
                .expect("Insert failed");
        }

        for expected in &jobs {
            let job = store.get_next_job().await.expect("GetNextJob failed");
            assert_eq!(&job.locator, expected);
            assert_eq!(job.reverify_count, 1);
            assert!(job.last_attempt.is_some());
        }

        let err = store.get_next_job().await.unwrap_err();
        assert!(err.is_empty_queue());
    })
    .await;
}

#[tokio::test]
async fn test_expired_attempt_is_retried_first() {
    let queue = QueueConfig::default();
    run_queue_test_all(move |store: Arc<dyn MetadataStore>| async move {
        let node = unique_node_id();
        let a = piece_on(node, 1);
        let b = piece_on(node, 2);
        let c = piece_on(node, 3);
        for locator in [&a, &b] {
            store
                .insert_reverification(locator)
                .await
                .expect("Insert failed");
        }

        assert_eq!(store.get_next_job().await.expect("GetNextJob failed").locator, a);
        store.insert_reverification(&c).await.expect("Insert failed");

        // Push A's attempt one hour past the retry interval.
        let expired = OffsetDateTime::now_utc() - queue.reverify_retry_interval() - Duration::hours(1);
        store
            .testing_fudge_update_time(&a, expired)
            .await
            .expect("Fudge failed");

        let retried = store.get_next_job().await.expect("GetNextJob failed");
        assert_eq!(retried.locator, a);
        assert_eq!(retried.reverify_count, 2);

        assert_eq!(store.get_next_job().await.expect("GetNextJob failed").locator, b);
        assert_eq!(store.get_next_job().await.expect("GetNextJob failed").locator, c);
        assert!(store.get_next_job().await.unwrap_err().is_empty_queue());
    })
    .await;
}

#[tokio::test]
async fn test_in_flight_job_is_not_handed_out() {
    let queue = QueueConfig::default();
    run_queue_test_all(move |store: Arc<dyn MetadataStore>| async move {
        let locator = piece_on(unique_node_id(), 7);
        store
            .insert_reverification(&locator)
            .await
            .expect("Insert failed");
        store.get_next_job().await.expect("GetNextJob failed");

        let recent = OffsetDateTime::now_utc() - queue.reverify_retry_interval() + Duration::minutes(5);
        store
            .testing_fudge_update_time(&locator, recent)
            .await
            .expect("Fudge failed");
        let err = store.get_next_job().await.unwrap_err();
        assert!(err.is_empty_queue());
        assert_eq!(err.to_string(), "reverify queue is empty");
    })
    .await;
}

#[tokio::test]
async fn test_remove_reports_whether_row_existed() {
    run_queue_test_all(|store: Arc<dyn MetadataStore>| async move {
        let locator = piece_on(unique_node_id(), 0);
        store
            .insert_reverification(&locator)
            .await
            .expect("Insert failed");

        assert!(store.remove_reverification(&locator).await.expect("Remove failed"));
        assert!(!store.remove_reverification(&locator).await.expect("Remove failed"));
        assert!(store.get_next_job().await.unwrap_err().is_empty_queue());
    })
    .await;
}

#[tokio::test]
async fn test_duplicate_insert_fails() {
    run_queue_test_all(|store: Arc<dyn MetadataStore>| async move {
        let locator = piece_on(unique_node_id(), 4);
        store
            .insert_reverification(&locator)
            .await
            .expect("Insert failed");

        let err = store.insert_reverification(&locator).await.unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyExists(_)), "got {err}");

        // Another piece of the same segment on the same node is a distinct job.
        let mut sibling = locator;
        sibling.piece_num = 5;
        store
            .insert_reverification(&sibling)
            .await
            .expect("Insert of sibling piece failed");
    })
    .await;
}

#[tokio::test]
async fn test_get_by_node_id() {
    run_queue_test_all(|store: Arc<dyn MetadataStore>| async move {
        let node = unique_node_id();
        let other = unique_node_id();

        let err = store.get_by_node_id(node).await.unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));

        let first = piece_on(node, 1);
        let second = piece_on(node, 2);
        store.insert_reverification(&first).await.expect("Insert failed");
        store.insert_reverification(&second).await.expect("Insert failed");
        store
            .insert_reverification(&piece_on(other, 1))
            .await
            .expect("Insert failed");

        let job = store.get_by_node_id(node).await.expect("GetByNodeID failed");
        assert_eq!(job.locator, first);
        assert_eq!(job.reverify_count, 0);
        assert!(job.last_attempt.is_none());

        // Lookup does not claim.
        let claimed = store.get_next_job().await.expect("GetNextJob failed");
        assert_eq!(claimed.locator, first);
    })
    .await;
}

#[tokio::test]
async fn test_fudge_missing_job_is_not_found() {
    run_queue_test_all(|store: Arc<dyn MetadataStore>| async move {
        let err = store
            .testing_fudge_update_time(&piece_on(unique_node_id(), 1), OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::NotFound(_)));
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_claims_never_share_jobs() {
    run_queue_test_all(|store: Arc<dyn MetadataStore>| async move {
        let node = unique_node_id();
        let jobs: Vec<PieceLocator> = (0..6).map(|n| piece_on(node, n)).collect();
        for locator in &jobs {
            store
                .insert_reverification(locator)
                .await
                .expect("Insert failed");
        }

        let results = join_all((0..10).map(|_| {
            let store = store.clone();
            async move { next_job_retrying(&store).await }
        }))
        .await;

        let mut seen = HashSet::new();
        for result in results {
            match result {
                Ok(job) => assert!(seen.insert(job.locator), "job handed out twice"),
                Err(err) => assert!(err.is_empty_queue(), "unexpected error: {err}"),
            }
        }

        while let Ok(job) = next_job_retrying(&store).await {
            assert!(seen.insert(job.locator), "job handed out twice");
        }
        assert_eq!(seen, jobs.into_iter().collect::<HashSet<_>>());
    })
    .await;
}
