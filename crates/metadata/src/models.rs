//! Database models mapping to the queue schema.

use crate::error::{MetadataError, MetadataResult};
use mender_core::{
    InjuredSegment, NodeId, PieceLocator, PlacementConstraint, ReverificationJob,
    SegmentPosition, StreamId,
};
use sqlx::FromRow;
use time::OffsetDateTime;

/// Column list shared by every query that reads whole repair queue rows.
pub(crate) const SEGMENT_COLUMNS: &str = "stream_id, position, segment_health, placement, \
     num_normalized_healthy, num_normalized_retrievable, num_out_of_placement, \
     attempted_at, updated_at, inserted_at";

/// Column list shared by every query that reads whole reverification rows.
pub(crate) const JOB_COLUMNS: &str =
    "node_id, stream_id, position, piece_num, inserted_at, last_attempt, reverify_count";

/// Current time truncated to the microsecond precision the stores keep, so
/// values handed back to callers match what a later read returns.
pub(crate) fn db_now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now - time::Duration::nanoseconds(i64::from(now.nanosecond() % 1_000))
}

/// Eligibility cutoff `interval` before `now`. An interval that reaches past
/// the supported date range is a configuration error.
pub(crate) fn cutoff_before(
    now: OffsetDateTime,
    interval: time::Duration,
    name: &str,
) -> MetadataResult<OffsetDateTime> {
    now.checked_sub(interval).ok_or_else(|| {
        MetadataError::Config(format!(
            "{name} of {}s is out of range",
            interval.whole_seconds()
        ))
    })
}

// =============================================================================
// Repair queue
// =============================================================================

/// Repair queue record.
#[derive(Debug, Clone, FromRow)]
pub struct InjuredSegmentRow {
    pub stream_id: Vec<u8>,
    pub position: i64,
    pub segment_health: f64,
    pub placement: i32,
    pub num_normalized_healthy: i16,
    pub num_normalized_retrievable: i16,
    pub num_out_of_placement: i16,
    pub attempted_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
    pub inserted_at: OffsetDateTime,
}

impl TryFrom<InjuredSegmentRow> for InjuredSegment {
    type Error = MetadataError;

    fn try_from(row: InjuredSegmentRow) -> MetadataResult<Self> {
        Ok(InjuredSegment {
            stream_id: StreamId::from_bytes(&row.stream_id)?,
            position: SegmentPosition::from_db(row.position),
            segment_health: row.segment_health,
            placement: PlacementConstraint::from_db(row.placement)?,
            attempted_at: row.attempted_at,
            updated_at: row.updated_at,
            inserted_at: row.inserted_at,
            num_normalized_healthy: row.num_normalized_healthy,
            num_normalized_retrievable: row.num_normalized_retrievable,
            num_out_of_placement: row.num_out_of_placement,
        })
    }
}

/// A repair queue record returned by a claim, with the attempt time it had
/// before the claim overwrote it.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimedSegmentRow {
    #[sqlx(flatten)]
    pub segment: InjuredSegmentRow,
    pub prior_attempted_at: Option<OffsetDateTime>,
}

/// Convert the rows returned by a claim into segments, stamped with the claim
/// time and ordered least healthy first, never-attempted before previously
/// attempted, then oldest prior attempt first.
pub fn into_claimed_segments(
    rows: Vec<ClaimedSegmentRow>,
    claimed_at: OffsetDateTime,
) -> MetadataResult<Vec<InjuredSegment>> {
    let mut claimed = rows
        .into_iter()
        .map(|row| {
            let prior = row.prior_attempted_at;
            let mut segment = InjuredSegment::try_from(row.segment)?;
            segment.attempted_at = Some(claimed_at);
            Ok((segment, prior))
        })
        .collect::<MetadataResult<Vec<_>>>()?;

    // Option orders None before Some, which is the null-first tie-break.
    claimed.sort_by(|(a, a_prior), (b, b_prior)| {
        a.segment_health
            .total_cmp(&b.segment_health)
            .then_with(|| a_prior.cmp(b_prior))
    });
    Ok(claimed.into_iter().map(|(segment, _)| segment).collect())
}

/// Aggregate row for repair queue statistics.
#[derive(Debug, Clone, FromRow)]
pub struct RepairQueueStatRow {
    pub placement: i32,
    pub attempted: bool,
    pub count: i64,
    pub min_inserted_at: OffsetDateTime,
    pub max_inserted_at: OffsetDateTime,
    pub min_attempted_at: Option<OffsetDateTime>,
    pub max_attempted_at: Option<OffsetDateTime>,
    pub min_segment_health: f64,
    pub max_segment_health: f64,
}

// =============================================================================
// Reverification queue
// =============================================================================

/// Reverification audit record.
#[derive(Debug, Clone, FromRow)]
pub struct ReverificationJobRow {
    pub node_id: Vec<u8>,
    pub stream_id: Vec<u8>,
    pub position: i64,
    pub piece_num: i32,
    pub inserted_at: OffsetDateTime,
    pub last_attempt: Option<OffsetDateTime>,
    pub reverify_count: i64,
}

impl TryFrom<ReverificationJobRow> for ReverificationJob {
    type Error = MetadataError;

    fn try_from(row: ReverificationJobRow) -> MetadataResult<Self> {
        Ok(ReverificationJob {
            locator: PieceLocator {
                stream_id: StreamId::from_bytes(&row.stream_id)?,
                position: SegmentPosition::from_db(row.position),
                node_id: NodeId::from_bytes(&row.node_id)?,
                piece_num: row.piece_num,
            },
            inserted_at: row.inserted_at,
            reverify_count: row.reverify_count,
            last_attempt: row.last_attempt,
        })
    }
}
