//! PostgreSQL and CockroachDB queue store.
//!
//! Both engines speak the PostgreSQL wire protocol and share the schema and
//! most statements. The upsert and claim statements differ per [`Backend`]:
//! PostgreSQL locks claim candidates and reads `xmax` to tell inserts from
//! updates, CockroachDB relies on serializable isolation and a snapshot CTE.

use crate::dialect::{Backend, ClaimStrategy, UpsertStrategy};
use crate::error::{MetadataError, MetadataResult, map_unique_violation};
use crate::metrics::QueueMetrics;
use crate::models::*;
use crate::placement::PlacementFilter;
use crate::repos::repair_queue::{claim_limit, collapse_duplicate_keys};
use crate::repos::{RepairQueueRepo, RepairQueueStat, ReverifyQueueRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use mender_core::QueueConfig;
use mender_core::config::PgSslMode;
use mender_core::{
    InjuredSegment, NodeId, PieceLocator, PlacementConstraint, ReverificationJob, SegmentPosition,
    StreamId,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

const REPAIR: &str = "repair";
const REVERIFY: &str = "reverify";

/// Columns returned by a repair claim: the claimed row plus the attempt time
/// it had before the claim.
const CLAIM_RETURNING: &str = "r.stream_id, r.position, r.segment_health, r.placement, \
     r.num_normalized_healthy, r.num_normalized_retrievable, r.num_out_of_placement, \
     r.attempted_at, r.updated_at, r.inserted_at, c.prior_attempted_at";

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Upsert statement over `UNNEST`ed column arrays for the given strategy.
///
/// Binds: `$1` stream ids, `$2` positions, `$3` health, `$4` placement,
/// `$5..$7` piece counters, `$8` current time. Every returned row carries
/// `stream_id`, `position` and `inserted`.
fn upsert_sql(strategy: UpsertStrategy) -> MetadataResult<&'static str> {
    match strategy {
        UpsertStrategy::NativeUpsert => Ok(r#"
            INSERT INTO repair_queue (
                stream_id, position, segment_health, placement, num_normalized_healthy,
                num_normalized_retrievable, num_out_of_placement, attempted_at,
                updated_at, inserted_at
            )
            SELECT i.stream_id, i.position, i.segment_health, i.placement, i.healthy,
                   i.retrievable, i.out_of_placement, NULL::TIMESTAMPTZ,
                   $8::TIMESTAMPTZ, $8::TIMESTAMPTZ
            FROM UNNEST($1::BYTEA[], $2::INT8[], $3::FLOAT8[], $4::INT4[],
                        $5::INT2[], $6::INT2[], $7::INT2[])
                AS i(stream_id, position, segment_health, placement, healthy,
                     retrievable, out_of_placement)
            ON CONFLICT (stream_id, position) DO UPDATE SET
                segment_health = EXCLUDED.segment_health,
                placement = EXCLUDED.placement,
                num_normalized_healthy = EXCLUDED.num_normalized_healthy,
                num_normalized_retrievable = EXCLUDED.num_normalized_retrievable,
                num_out_of_placement = EXCLUDED.num_out_of_placement,
                updated_at = EXCLUDED.updated_at
            RETURNING stream_id, position, (xmax = 0) AS inserted
            "#),
        UpsertStrategy::CteConditionalWrite => Ok(r#"
            WITH input AS (
                SELECT *
                FROM UNNEST($1::BYTEA[], $2::INT8[], $3::FLOAT8[], $4::INT4[],
                            $5::INT2[], $6::INT2[], $7::INT2[])
                    AS i(stream_id, position, segment_health, placement, healthy,
                         retrievable, out_of_placement)
            ),
            existing AS (
                SELECT r.stream_id, r.position
                FROM repair_queue AS r
                JOIN input ON r.stream_id = input.stream_id AND r.position = input.position
            ),
            upserted AS (
                INSERT INTO repair_queue (
                    stream_id, position, segment_health, placement, num_normalized_healthy,
                    num_normalized_retrievable, num_out_of_placement, attempted_at,
                    updated_at, inserted_at
                )
                SELECT stream_id, position, segment_health, placement, healthy,
                       retrievable, out_of_placement, NULL::TIMESTAMPTZ,
                       $8::TIMESTAMPTZ, $8::TIMESTAMPTZ
                FROM input
                ON CONFLICT (stream_id, position) DO UPDATE SET
                    segment_health = excluded.segment_health,
                    placement = excluded.placement,
                    num_normalized_healthy = excluded.num_normalized_healthy,
                    num_normalized_retrievable = excluded.num_normalized_retrievable,
                    num_out_of_placement = excluded.num_out_of_placement,
                    updated_at = excluded.updated_at
                RETURNING stream_id, position
            )
            SELECT u.stream_id, u.position, (e.stream_id IS NULL) AS inserted
            FROM upserted AS u
            LEFT JOIN existing AS e ON e.stream_id = u.stream_id AND e.position = u.position
            "#),
        UpsertStrategy::UpdateThenInsertIgnore => Err(MetadataError::Internal(
            "update-then-insert-ignore upserts are not run over the postgres protocol"
                .to_string(),
        )),
    }
}

/// PostgreSQL or CockroachDB queue store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
    backend: Backend,
    queue: QueueConfig,
    metrics: Arc<QueueMetrics>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms, Backend::Postgres).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// This allows credentials to be passed separately, e.g. the password via
    /// `MENDER_METADATA__PASSWORD`.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms, Backend::Postgres).await
    }

    /// Create a new CockroachDB store from a connection URL.
    ///
    /// Fails with [`MetadataError::Config`] unless the cluster's default
    /// transaction isolation is serializable, since claims take no row locks.
    pub async fn cockroach(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms, Backend::Cockroach).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
        backend: Backend,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!(%backend, "statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            backend,
            queue: QueueConfig::default(),
            metrics: Arc::new(QueueMetrics::new()),
        };
        if store.backend.claim_strategy() == ClaimStrategy::SerializableSubselect {
            store.require_serializable().await?;
        }
        store.migrate().await?;

        Ok(store)
    }

    async fn require_serializable(&self) -> MetadataResult<()> {
        let isolation: String = sqlx::query_scalar("SHOW default_transaction_isolation")
            .fetch_one(&self.pool)
            .await?;
        if !isolation.eq_ignore_ascii_case("serializable") {
            return Err(MetadataError::Config(format!(
                "{} claims require serializable isolation, cluster default is '{}'",
                self.backend, isolation
            )));
        }
        Ok(())
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
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Upsert distinct segments and return the keys that were newly inserted.
    async fn upsert_segments(
        &self,
        segments: &[&InjuredSegment],
    ) -> MetadataResult<HashSet<(StreamId, SegmentPosition)>> {
        let sql = upsert_sql(self.backend.upsert_strategy())?;

        let mut stream_ids = Vec::with_capacity(segments.len());
        let mut positions = Vec::with_capacity(segments.len());
        let mut healths = Vec::with_capacity(segments.len());
        let mut placements = Vec::with_capacity(segments.len());
        let mut healthy = Vec::with_capacity(segments.len());
        let mut retrievable = Vec::with_capacity(segments.len());
        let mut out_of_placement = Vec::with_capacity(segments.len());
        for segment in segments {
            stream_ids.push(segment.stream_id.as_bytes().to_vec());
            positions.push(segment.position.to_db());
            healths.push(segment.segment_health);
            placements.push(segment.placement.to_db());
            healthy.push(segment.num_normalized_healthy);
            retrievable.push(segment.num_normalized_retrievable);
            out_of_placement.push(segment.num_out_of_placement);
        }

        let rows: Vec<(Vec<u8>, i64, bool)> = sqlx::query_as(sql)
            .bind(stream_ids)
            .bind(positions)
            .bind(healths)
            .bind(placements)
            .bind(healthy)
            .bind(retrievable)
            .bind(out_of_placement)
            .bind(db_now())
            .fetch_all(&self.pool)
            .await?;

        let mut inserted = HashSet::new();
        for (stream_id, position, was_inserted) in rows {
            if was_inserted {
                inserted.insert((
                    StreamId::from_bytes(&stream_id)?,
                    SegmentPosition::from_db(position),
                ));
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold more than one statement.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> Backend {
        self.backend
    }
}

#[async_trait]
impl RepairQueueRepo for PostgresStore {
    async fn insert(&self, segment: &InjuredSegment) -> MetadataResult<bool> {
        self.metrics
            .track(REPAIR, "insert", async {
                let inserted = self.upsert_segments(&[segment]).await?;
                Ok(!inserted.contains(&segment.key()))
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

                // ON CONFLICT cannot touch the same row twice in one statement.
                let collapsed = collapse_duplicate_keys(segments);
                let inserted = self.upsert_segments(&collapsed).await?;
                Ok(collapsed
                    .into_iter()
                    .filter(|segment| inserted.contains(&segment.key()))
                    .cloned()
                    .collect())
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

                let strategy = self.backend.claim_strategy();
                let now = db_now();
                let cutoff = cutoff_before(
                    now,
                    self.queue.repair_attempt_cooldown(),
                    "repair attempt cooldown",
                )?;
                let filter = PlacementFilter::new(included_placements, excluded_placements);

                let mut qb = QueryBuilder::<Postgres>::new(
                    "WITH candidates AS ( \
                     SELECT stream_id, position, attempted_at AS prior_attempted_at \
                     FROM repair_queue \
                     WHERE (attempted_at IS NULL OR attempted_at < ",
                );
                qb.push_bind(cutoff).push(")");
                filter.push_sql(&mut qb, "placement");
                qb.push(" ORDER BY segment_health ASC, attempted_at ASC NULLS FIRST LIMIT ");
                qb.push_bind(limit);
                qb.push(strategy.candidate_lock_clause());
                qb.push(") UPDATE repair_queue AS r SET attempted_at = ");
                qb.push_bind(now);
                qb.push(" FROM candidates AS c WHERE r.stream_id = c.stream_id AND r.position = c.position RETURNING ");
                qb.push(CLAIM_RETURNING);

                let mut tx = self.pool.begin().await?;
                let rows: Vec<ClaimedSegmentRow> =
                    qb.build_query_as().fetch_all(&mut *tx).await?;

                if rows.is_empty() {
                    return Err(MetadataError::EmptyQueue { queue: REPAIR });
                }

                // Rows that fail to decode roll the claim back.
                let segments = into_claimed_segments(rows, now)?;
                tx.commit().await?;
                tracing::debug!(
                    backend = %self.backend,
                    count = segments.len(),
                    "claimed repair queue segments"
                );
                Ok(segments)
            })
            .await
    }

    async fn delete(&self, segment: &InjuredSegment) -> MetadataResult<()> {
        self.metrics
            .track(REPAIR, "delete", async {
                sqlx::query("DELETE FROM repair_queue WHERE stream_id = $1 AND position = $2")
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
                let result = sqlx::query("DELETE FROM repair_queue WHERE updated_at < $1")
                    .bind(before)
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
                     ORDER BY segment_health ASC, attempted_at ASC NULLS FIRST LIMIT $1"
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
            "UPDATE repair_queue SET attempted_at = $1 WHERE stream_id = $2 AND position = $3",
        )
        .bind(attempted_at)
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
            "UPDATE repair_queue SET updated_at = $1 WHERE stream_id = $2 AND position = $3",
        )
        .bind(updated_at)
        .bind(stream_id.as_bytes().as_slice())
        .bind(position.to_db())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ReverifyQueueRepo for PostgresStore {
    async fn insert_reverification(&self, locator: &PieceLocator) -> MetadataResult<()> {
        self.metrics
            .track(REVERIFY, "insert", async {
                sqlx::query(
                    r#"
                    INSERT INTO reverification_audits (
                        node_id, stream_id, position, piece_num, inserted_at,
                        last_attempt, reverify_count
                    ) VALUES ($1, $2, $3, $4, $5, NULL, 0)
                    "#,
                )
                .bind(locator.node_id.as_bytes().as_slice())
                .bind(locator.stream_id.as_bytes().as_slice())
                .bind(locator.position.to_db())
                .bind(locator.piece_num)
                .bind(db_now())
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
                let cutoff = cutoff_before(
                    now,
                    self.queue.reverify_retry_interval(),
                    "reverify retry interval",
                )?;
                let sql = format!(
                    r#"
                    WITH next_job AS (
                        SELECT node_id, stream_id, position, piece_num
                        FROM reverification_audits
                        WHERE last_attempt IS NULL OR last_attempt < $1
                        ORDER BY inserted_at, node_id, stream_id, position, piece_num
                        LIMIT 1{lock}
                    )
                    UPDATE reverification_audits AS ra
                    SET last_attempt = $2, reverify_count = ra.reverify_count + 1
                    FROM next_job AS n
                    WHERE ra.node_id = n.node_id
                      AND ra.stream_id = n.stream_id
                      AND ra.position = n.position
                      AND ra.piece_num = n.piece_num
                    RETURNING ra.node_id, ra.stream_id, ra.position, ra.piece_num,
                              ra.inserted_at, ra.last_attempt, ra.reverify_count
                    "#,
                    lock = self.backend.claim_strategy().candidate_lock_clause()
                );

                let row: Option<ReverificationJobRow> = sqlx::query_as(&sql)
                    .bind(cutoff)
                    .bind(now)
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
                    WHERE node_id = $1 AND stream_id = $2 AND position = $3 AND piece_num = $4
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
                    "SELECT {JOB_COLUMNS} FROM reverification_audits WHERE node_id = $1 \
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
            UPDATE reverification_audits SET last_attempt = $1
            WHERE node_id = $2 AND stream_id = $3 AND position = $4 AND piece_num = $5
            "#,
        )
        .bind(last_attempt)
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
