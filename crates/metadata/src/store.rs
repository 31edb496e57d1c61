//! Metadata store trait and the SQLite implementation.

use crate::dialect::Backend;
use crate::error::MetadataResult;
use crate::metrics::QueueMetrics;
use crate::repos::{RepairQueueRepo, ReverifyQueueRepo};
use async_trait::async_trait;
use mender_core::QueueConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: RepairQueueRepo + ReverifyQueueRepo + Send + Sync {
    /// Create tables and indexes if they do not exist yet.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Engine behind this store.
    fn backend(&self) -> Backend;
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS repair_queue (
    stream_id BLOB NOT NULL,
    position INTEGER NOT NULL,
    attempted_at TEXT,
    updated_at TEXT NOT NULL,
    inserted_at TEXT NOT NULL,
    segment_health REAL NOT NULL DEFAULT 1,
    placement INTEGER NOT NULL DEFAULT 0,
    num_normalized_healthy INTEGER NOT NULL DEFAULT 0,
    num_normalized_retrievable INTEGER NOT NULL DEFAULT 0,
    num_out_of_placement INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (stream_id, position)
);

CREATE INDEX IF NOT EXISTS repair_queue_updated_at_index ON repair_queue (updated_at);
CREATE INDEX IF NOT EXISTS repair_queue_health_attempted_index ON repair_queue (segment_health, attempted_at);
CREATE INDEX IF NOT EXISTS repair_queue_placement_index ON repair_queue (placement);

CREATE TABLE IF NOT EXISTS reverification_audits (
    node_id BLOB NOT NULL,
    stream_id BLOB NOT NULL,
    position INTEGER NOT NULL,
    piece_num INTEGER NOT NULL,
    inserted_at TEXT NOT NULL,
    last_attempt TEXT,
    reverify_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (node_id, stream_id, position, piece_num)
);

CREATE INDEX IF NOT EXISTS reverification_audits_inserted_at_index ON reverification_audits (inserted_at);
"#;

/// SQLite-based queue store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    queue: QueueConfig,
    metrics: Arc<QueueMetrics>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serializes every claim transaction.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            queue: QueueConfig::default(),
            metrics: Arc::new(QueueMetrics::new()),
        };
        store.migrate().await?;

        tracing::warn!(
            query_timeout_secs = query_timeout_secs,
            "SQLite query timeout is advisory only and claims are serialized through one \
             connection. Use PostgreSQL or CockroachDB when several workers share the queues."
        );

        Ok(store)
    }

    /// Replace the queue timing configuration.
    ///
    /// The config is not re-validated here. An interval reaching past the
    /// supported date range makes claims fail with `MetadataError::Config`.
    pub fn with_queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Replace the metrics collaborator.
    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> Backend {
        Backend::Sqlite
    }
}

mod sqlite_impl {
    use super::*;
    use crate::error::{MetadataError, map_unique_violation};
    use crate::models::*;
    use crate::placement::PlacementFilter;
    use crate::repos::RepairQueueStat;
    use crate::repos::repair_queue::{claim_limit, collapse_duplicate_keys};
    use mender_core::{
        InjuredSegment, NodeId, PieceLocator, PlacementConstraint, ReverificationJob,
        SegmentPosition, StreamId,
    };
    use sqlx::{QueryBuilder, SqliteConnection};
    use time::macros::format_description;
    use time::{OffsetDateTime, UtcOffset};

    const REPAIR: &str = "repair";
    const REVERIFY: &str = "reverify";

    // Timestamps are stored and compared as text. Fixed-width UTC RFC 3339
    // keeps lexicographic order equal to chronological order.
    fn ts(t: OffsetDateTime) -> MetadataResult<String> {
        let format = format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        );
        t.to_offset(UtcOffset::UTC)
            .format(format)
            .map_err(|e| MetadataError::Internal(format!("timestamp out of range: {e}")))
    }

    async fn update_segment(
        conn: &mut SqliteConnection,
        segment: &InjuredSegment,
        now: &str,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE repair_queue
            SET segment_health = ?, placement = ?, num_normalized_healthy = ?,
                num_normalized_retrievable = ?, num_out_of_placement = ?, updated_at = ?
            WHERE stream_id = ? AND position = ?
            "#,
        )
        .bind(segment.segment_health)
        .bind(segment.placement.to_db())
        .bind(segment.num_normalized_healthy)
        .bind(segment.num_normalized_retrievable)
        .bind(segment.num_out_of_placement)
        .bind(now)
        .bind(segment.stream_id.as_bytes().as_slice())
        .bind(segment.position.to_db())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Update-then-insert-ignore upsert. Returns whether the segment was
    /// already queued.
    async fn upsert_segment(
        conn: &mut SqliteConnection,
        segment: &InjuredSegment,
        now: &str,
    ) -> MetadataResult<bool> {
        if update_segment(conn, segment, now).await? {
            return Ok(true);
        }

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO repair_queue (
                stream_id, position, segment_health, placement, num_normalized_healthy,
                num_normalized_retrievable, num_out_of_placement, attempted_at,
                updated_at, inserted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(segment.stream_id.as_bytes().as_slice())
        .bind(segment.position.to_db())
        .bind(segment.segment_health)
        .bind(segment.placement.to_db())
        .bind(segment.num_normalized_healthy)
        .bind(segment.num_normalized_retrievable)
        .bind(segment.num_out_of_placement)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(false);
        }

        tracing::debug!(
            stream_id = %segment.stream_id,
            position = %segment.position,
            "repair queue insert ignored after update missed, updating existing row"
        );
        if !update_segment(conn, segment, now).await? {
            return Err(MetadataError::Internal(format!(
                "repair queue row {}/{} vanished during upsert",
                segment.stream_id, segment.position
            )));
        }
        Ok(true)
    }

    #[async_trait]
    impl RepairQueueRepo for SqliteStore {
        async fn insert(&self, segment: &InjuredSegment) -> MetadataResult<bool> {
            self.metrics
                .track(REPAIR, "insert", async {
                    let mut tx = self.pool.begin().await?;
                    let already_inserted = upsert_segment(&mut *tx, segment, &ts(db_now())?).await?;
                    tx.commit().await?;
                    Ok(already_inserted)
                })
                .await
        }

        async fn insert_batch(
            &self,
            segments: &[InjuredSegment],
        ) -> MetadataResult<Vec<InjuredSegment>> {
            self.metrics
                .track(REPAIR, "insert_batch", async {
                    if segments.is_empty() {
                        return Ok(Vec::new());
                    }

                    let now = ts(db_now())?;
                    let mut newly_inserted = Vec::new();
                    let mut tx = self.pool.begin().await?;
                    for segment in collapse_duplicate_keys(segments) {
                        if !upsert_segment(&mut *tx, segment, &now).await? {
                            newly_inserted.push(segment.clone());
                        }
                    }
                    tx.commit().await?;
                    Ok(newly_inserted)
                })
                .await
        }

        async fn select(
            &self,
            limit: u32,
            included_placements: &[PlacementConstraint],
            excluded_placements: &[PlacementConstraint],
        ) -> MetadataResult<Vec<InjuredSegment>> {
            self.metrics
                .track(REPAIR, "select", async {
                    let Some(limit) = claim_limit(limit, self.queue.max_claim_batch) else {
                        return Err(MetadataError::EmptyQueue { queue: REPAIR });
                    };

                    let now = db_now();
                    let cutoff = ts(cutoff_before(
                        now,
                        self.queue.repair_attempt_cooldown(),
                        "repair attempt cooldown",
                    )?)?;
                    let claimed_at = ts(now)?;
                    let filter = PlacementFilter::new(included_placements, excluded_placements);

                    let mut tx = self.pool.begin().await?;

                    let mut qb = QueryBuilder::<Sqlite>::new(
                        "SELECT stream_id, position, attempted_at FROM repair_queue \
                         WHERE (attempted_at IS NULL OR attempted_at < ",
                    );
                    qb.push_bind(cutoff.clone()).push(")");
                    filter.push_sql(&mut qb, "placement");
                    qb.push(" ORDER BY segment_health ASC, attempted_at ASC NULLS FIRST LIMIT ");
                    qb.push_bind(limit);

                    let candidates: Vec<(Vec<u8>, i64, Option<OffsetDateTime>)> =
                        qb.build_query_as().fetch_all(&mut *tx).await?;

                    let claim_sql = format!(
                        "UPDATE repair_queue SET attempted_at = ? \
                         WHERE stream_id = ? AND position = ? \
                           AND (attempted_at IS NULL OR attempted_at < ?) \
                         RETURNING {SEGMENT_COLUMNS}"
                    );

                    let mut claimed = Vec::with_capacity(candidates.len());
                    for (stream_id, position, prior_attempted_at) in candidates {
                        // Re-check eligibility so a row claimed since the read is skipped.
                        let row: Option<InjuredSegmentRow> = sqlx::query_as(&claim_sql)
                            .bind(&claimed_at)
                            .bind(&stream_id)
                            .bind(position)
                            .bind(&cutoff)
                            .fetch_optional(&mut *tx)
                            .await?;

                        match row {
                            Some(segment) => claimed.push(ClaimedSegmentRow {
                                segment,
                                prior_attempted_at,
                            }),
                            None => tracing::debug!(
                                position,
                                "repair queue candidate no longer eligible, skipping"
                            ),
                        }
                    }
                    if claimed.is_empty() {
                        return Err(MetadataError::EmptyQueue { queue: REPAIR });
                    }

                    // Rows that fail to decode roll the claim back.
                    let segments = into_claimed_segments(claimed, now)?;
                    tx.commit().await?;
                    tracing::debug!(count = segments.len(), "claimed repair queue segments");
                    Ok(segments)
                })
                .await
        }

        async fn delete(&self, segment: &InjuredSegment) -> MetadataResult<()> {
            self.metrics
                .track(REPAIR, "delete", async {
                    sqlx::query("DELETE FROM repair_queue WHERE stream_id = ? AND position = ?")
                        .bind(segment.stream_id.as_bytes().as_slice())
                        .bind(segment.position.to_db())
                        .execute(&self.pool)
                        .await?;
                    Ok(())
                })
                .await
        }

        async fn clean(&self, before: OffsetDateTime) -> MetadataResult<u64> {
            self.metrics
                .track(REPAIR, "clean", async {
                    let result = sqlx::query("DELETE FROM repair_queue WHERE updated_at < ?")
                        .bind(ts(before)?)
                        .execute(&self.pool)
                        .await?;
                    Ok(result.rows_affected())
                })
                .await
        }

        async fn select_n(&self, limit: u32) -> MetadataResult<Vec<InjuredSegment>> {
            self.metrics
                .track(REPAIR, "select_n", async {
                    let rows: Vec<InjuredSegmentRow> = sqlx::query_as(&format!(
                        "SELECT {SEGMENT_COLUMNS} FROM repair_queue \
                         ORDER BY segment_health ASC, attempted_at ASC NULLS FIRST LIMIT ?"
                    ))
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?;
                    rows.into_iter().map(InjuredSegment::try_from).collect()
                })
                .await
        }

        async fn count(&self) -> MetadataResult<u64> {
            self.metrics
                .track(REPAIR, "count", async {
                    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repair_queue")
                        .fetch_one(&self.pool)
                        .await?;
                    Ok(count as u64)
                })
                .await
        }

        async fn stat(&self) -> MetadataResult<Vec<RepairQueueStat>> {
            self.metrics
                .track(REPAIR, "stat", async {
                    let rows: Vec<RepairQueueStatRow> = sqlx::query_as(
                        r#"
                        SELECT
                            placement,
                            attempted_at IS NOT NULL AS attempted,
                            COUNT(*) AS count,
                            MIN(inserted_at) AS min_inserted_at,
                            MAX(inserted_at) AS max_inserted_at,
                            MIN(attempted_at) AS min_attempted_at,
                            MAX(attempted_at) AS max_attempted_at,
                            MIN(segment_health) AS min_segment_health,
                            MAX(segment_health) AS max_segment_health
                        FROM repair_queue
                        GROUP BY placement, attempted_at IS NOT NULL
                        ORDER BY placement, attempted
                        "#,
                    )
                    .fetch_all(&self.pool)
                    .await?;
                    rows.into_iter().map(RepairQueueStat::try_from).collect()
                })
                .await
        }

        async fn testing_set_attempted_time(
            &self,
            stream_id: StreamId,
            position: SegmentPosition,
            attempted_at: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                "UPDATE repair_queue SET attempted_at = ? WHERE stream_id = ? AND position = ?",
            )
            .bind(ts(attempted_at)?)
            .bind(stream_id.as_bytes().as_slice())
            .bind(position.to_db())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }

        async fn testing_set_updated_time(
            &self,
            stream_id: StreamId,
            position: SegmentPosition,
            updated_at: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                "UPDATE repair_queue SET updated_at = ? WHERE stream_id = ? AND position = ?",
            )
            .bind(ts(updated_at)?)
            .bind(stream_id.as_bytes().as_slice())
            .bind(position.to_db())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl ReverifyQueueRepo for SqliteStore {
        async fn insert_reverification(&self, locator: &PieceLocator) -> MetadataResult<()> {
            self.metrics
                .track(REVERIFY, "insert", async {
                    sqlx::query(
                        r#"
                        INSERT INTO reverification_audits (
                            node_id, stream_id, position, piece_num, inserted_at,
                            last_attempt, reverify_count
                        ) VALUES (?, ?, ?, ?, ?, NULL, 0)
                        "#,
                    )
                    .bind(locator.node_id.as_bytes().as_slice())
                    .bind(locator.stream_id.as_bytes().as_slice())
                    .bind(locator.position.to_db())
                    .bind(locator.piece_num)
                    .bind(ts(db_now())?)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        map_unique_violation(e, || {
                            format!(
                                "reverification job for node {} piece {} of {}/{}",
                                locator.node_id,
                                locator.piece_num,
                                locator.stream_id,
                                locator.position
                            )
                        })
                    })?;
                    Ok(())
                })
                .await
        }

        async fn get_next_job(&self) -> MetadataResult<ReverificationJob> {
            self.metrics
                .track(REVERIFY, "get_next_job", async {
                    let now = db_now();
                    let claimed_at = ts(now)?;
                    let cutoff = ts(cutoff_before(
                        now,
                        self.queue.reverify_retry_interval(),
                        "reverify retry interval",
                    )?)?;
                    let row: Option<ReverificationJobRow> = sqlx::query_as(&format!(
                        r#"
                        UPDATE reverification_audits
                        SET last_attempt = ?, reverify_count = reverify_count + 1
                        WHERE (node_id, stream_id, position, piece_num) = (
                            SELECT node_id, stream_id, position, piece_num
                            FROM reverification_audits
                            WHERE last_attempt IS NULL OR last_attempt < ?
                            ORDER BY inserted_at, node_id, stream_id, position, piece_num
                            LIMIT 1
                        )
                        RETURNING {JOB_COLUMNS}
                        "#
                    ))
                    .bind(claimed_at)
                    .bind(cutoff)
                    .fetch_optional(&self.pool)
                    .await?;

                    match row {
                        Some(row) => ReverificationJob::try_from(row),
                        None => Err(MetadataError::EmptyQueue { queue: REVERIFY }),
                    }
                })
                .await
        }

        async fn remove_reverification(&self, locator: &PieceLocator) -> MetadataResult<bool> {
            self.metrics
                .track(REVERIFY, "remove", async {
                    let result = sqlx::query(
                        r#"
                        DELETE FROM reverification_audits
                        WHERE node_id = ? AND stream_id = ? AND position = ? AND piece_num = ?
                        "#,
                    )
                    .bind(locator.node_id.as_bytes().as_slice())
                    .bind(locator.stream_id.as_bytes().as_slice())
                    .bind(locator.position.to_db())
                    .bind(locator.piece_num)
                    .execute(&self.pool)
                    .await?;
                    Ok(result.rows_affected() > 0)
                })
                .await
        }

        async fn get_by_node_id(&self, node_id: NodeId) -> MetadataResult<ReverificationJob> {
            self.metrics
                .track(REVERIFY, "get_by_node_id", async {
                    let row: Option<ReverificationJobRow> = sqlx::query_as(&format!(
                        "SELECT {JOB_COLUMNS} FROM reverification_audits WHERE node_id = ? \
                         ORDER BY inserted_at, stream_id, position, piece_num LIMIT 1"
                    ))
                    .bind(node_id.as_bytes().as_slice())
                    .fetch_optional(&self.pool)
                    .await?;

                    match row {
                        Some(row) => ReverificationJob::try_from(row),
                        None => Err(MetadataError::NotFound(format!(
                            "reverification job for node {node_id}"
                        ))),
                    }
                })
                .await
        }

        async fn testing_fudge_update_time(
            &self,
            locator: &PieceLocator,
            last_attempt: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE reverification_audits SET last_attempt = ?
                WHERE node_id = ? AND stream_id = ? AND position = ? AND piece_num = ?
                "#,
            )
            .bind(ts(last_attempt)?)
            .bind(locator.node_id.as_bytes().as_slice())
            .bind(locator.stream_id.as_bytes().as_slice())
            .bind(locator.position.to_db())
            .bind(locator.piece_num)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "reverification job for node {} piece {}",
                    locator.node_id, locator.piece_num
                )));
            }
            Ok(())
        }
    }
}
