//! Reverification audit queue repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use mender_core::{NodeId, PieceLocator, ReverificationJob};
use time::OffsetDateTime;

/// Repository for pieces waiting on a follow-up audit.
#[async_trait]
pub trait ReverifyQueueRepo: Send + Sync {
    /// Queue a reverification job for a piece.
    ///
    /// Inserting a locator that is already queued fails with
    /// [`MetadataError::AlreadyExists`](crate::MetadataError::AlreadyExists);
    /// jobs are created once per inconclusive audit.
    async fn insert_reverification(&self, locator: &PieceLocator) -> MetadataResult<()>;

    /// Claim the oldest job that is not in flight.
    ///
    /// A job is in flight while its last attempt is within the configured
    /// retry interval. The claim sets `last_attempt` to now and increments
    /// `reverify_count` atomically. Returns
    /// [`MetadataError::EmptyQueue`](crate::MetadataError::EmptyQueue) if no
    /// job is due.
    async fn get_next_job(&self) -> MetadataResult<ReverificationJob>;

    /// Delete a job. Returns whether a row existed.
    async fn remove_reverification(&self, locator: &PieceLocator) -> MetadataResult<bool>;

    /// Oldest pending job for a node, without claiming it.
    ///
    /// Returns [`MetadataError::NotFound`](crate::MetadataError::NotFound) if
    /// the node has no pending reverification.
    async fn get_by_node_id(&self, node_id: NodeId) -> MetadataResult<ReverificationJob>;

    /// Testing only: overwrite `last_attempt` for a job.
    async fn testing_fudge_update_time(
        &self,
        locator: &PieceLocator,
        last_attempt: OffsetDateTime,
    ) -> MetadataResult<()>;
}
