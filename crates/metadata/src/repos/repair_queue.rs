//! Segment repair queue repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use mender_core::{InjuredSegment, PlacementConstraint, SegmentPosition, StreamId};
use time::OffsetDateTime;

/// Repository for the segment repair queue.
///
/// Rows are keyed by `(stream_id, position)`. Health checkers upsert rows,
/// repair workers claim the least healthy ones with [`RepairQueueRepo::select`]
/// and then release them.
#[async_trait]
pub trait RepairQueueRepo: Send + Sync {
    /// Insert a segment, or update health, placement, piece counters and
    /// `updated_at` if it is already queued.
    ///
    /// Returns `true` if the segment was already in the queue.
    async fn insert(&self, segment: &InjuredSegment) -> MetadataResult<bool>;

    /// Upsert many segments. Returns the segments that were not previously
    /// queued. An empty input is a no-op.
    async fn insert_batch(
        &self,
        segments: &[InjuredSegment],
    ) -> MetadataResult<Vec<InjuredSegment>>;

    /// Claim up to `limit` segments that are eligible for a repair attempt.
    ///
    /// A segment is eligible when it was never attempted or its last attempt
    /// is older than the configured cooldown. Non-empty `included_placements`
    /// restricts the candidates to those placements; non-empty
    /// `excluded_placements` removes those placements. Results come back
    /// least healthy first, never-attempted before previously attempted on a
    /// tie. Claimed rows get `attempted_at` set to now in the same atomic step,
    /// so concurrent callers never receive the same row.
    ///
    /// Returns [`MetadataError::EmptyQueue`](crate::MetadataError::EmptyQueue)
    /// if nothing is eligible.
    async fn select(
        &self,
        limit: u32,
        included_placements: &[PlacementConstraint],
        excluded_placements: &[PlacementConstraint],
    ) -> MetadataResult<Vec<InjuredSegment>>;

    /// Finish a repair attempt. A repaired segment is deleted; otherwise the
    /// row stays and becomes selectable again after the cooldown.
    async fn release(&self, segment: &InjuredSegment, repaired: bool) -> MetadataResult<()> {
        if repaired {
            self.delete(segment).await?;
        }
        Ok(())
    }

    /// Remove a segment from the queue. Removing an absent segment is not an error.
    async fn delete(&self, segment: &InjuredSegment) -> MetadataResult<()>;

    /// Delete every row whose `updated_at` is older than `before`.
    async fn clean(&self, before: OffsetDateTime) -> MetadataResult<u64>;

    /// List up to `limit` rows, least healthy first, without claiming them.
    async fn select_n(&self, limit: u32) -> MetadataResult<Vec<InjuredSegment>>;

    /// Total number of queued segments.
    async fn count(&self) -> MetadataResult<u64>;

    /// Aggregate statistics grouped by placement and attempted state.
    async fn stat(&self) -> MetadataResult<Vec<RepairQueueStat>>;

    /// Testing only: overwrite `attempted_at` for a segment.
    async fn testing_set_attempted_time(
        &self,
        stream_id: StreamId,
        position: SegmentPosition,
        attempted_at: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Testing only: overwrite `updated_at` for a segment.
    async fn testing_set_updated_time(
        &self,
        stream_id: StreamId,
        position: SegmentPosition,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<u64>;
}

/// Repair queue statistics for one placement and attempted state.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairQueueStat {
    pub placement: PlacementConstraint,
    /// Whether this group holds rows that have been claimed at least once.
    pub attempted: bool,
    pub count: u64,
    pub min_inserted_at: OffsetDateTime,
    pub max_inserted_at: OffsetDateTime,
    pub min_attempted_at: Option<OffsetDateTime>,
    pub max_attempted_at: Option<OffsetDateTime>,
    pub min_segment_health: f64,
    pub max_segment_health: f64,
}

impl TryFrom<crate::models::RepairQueueStatRow> for RepairQueueStat {
    type Error = crate::MetadataError;

    fn try_from(row: crate::models::RepairQueueStatRow) -> MetadataResult<Self> {
        Ok(Self {
            placement: PlacementConstraint::from_db(row.placement)?,
            attempted: row.attempted,
            count: row.count as u64,
            min_inserted_at: row.min_inserted_at,
            max_inserted_at: row.max_inserted_at,
            min_attempted_at: row.min_attempted_at,
            max_attempted_at: row.max_attempted_at,
            min_segment_health: row.min_segment_health,
            max_segment_health: row.max_segment_health,
        })
    }
}

/// Resolve the number of rows a select may claim. `None` means the request
/// cannot claim anything.
pub(crate) fn claim_limit(requested: u32, max_claim_batch: u32) -> Option<i64> {
    match requested.min(max_claim_batch) {
        0 => None,
        n => Some(i64::from(n)),
    }
}

/// Collapse repeated keys in a batch, keeping the last occurrence of each key
/// at the position where the key first appeared.
pub(crate) fn collapse_duplicate_keys(segments: &[InjuredSegment]) -> Vec<&InjuredSegment> {
    let mut slots: std::collections::HashMap<(StreamId, SegmentPosition), usize> =
        std::collections::HashMap::with_capacity(segments.len());
    let mut collapsed: Vec<&InjuredSegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match slots.get(&segment.key()) {
            Some(&slot) => collapsed[slot] = segment,
            None => {
                slots.insert(segment.key(), collapsed.len());
                collapsed.push(segment);
            }
        }
    }
    collapsed
}
