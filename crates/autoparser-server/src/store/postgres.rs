//! Postgres-backed store
//!
//! Queries are built at runtime and mapped through `FromRow` row structs, then
//! converted into the domain models. Each method commits on its own; only
//! identifier allocation uses an explicit transaction. Writes made on behalf of
//! a live run also bump its `heartbeat_at`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{scrub, Store, StoreError, StoreResult};
use crate::models::{
    Allocation, Measure, NewMeasure, NewSnapshot, NewSource, Run, RunCounter, RunStatus,
    Snapshot, Source, Step, StepStatus,
};
use crate::pipeline::identifier::{format_intlid, sequence_after};
use crate::pipeline::stages::Stage;

/// Attempts for transactions that hit a serialization failure or deadlock
const MAX_CONFLICT_RETRIES: usize = 3;

const RUN_COLUMNS: &str = "id, region, status, started_at, finished_at, found, processed, ok, \
                           errors, error_message, claimed_by, heartbeat_at";
const STEP_COLUMNS: &str = "id, run_id, source_id, stage, status, payload, created_at, finished_at";
const SOURCE_COLUMNS: &str =
    "id, url, domain, region_code, is_official, first_seen_at, last_checked_at, status";
const SNAPSHOT_COLUMNS: &str =
    "id, source_id, content_hash, stored_at, raw_content, clean_text, http_status, charset";
const MEASURE_COLUMNS: &str =
    "intlid, card, region_code, prglvl, segmnt, typeid, source_id, checked_at";

#[derive(Debug, FromRow)]
struct RunRow {
    id: Uuid,
    region: String,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    found: i64,
    processed: i64,
    ok: i64,
    errors: i64,
    error_message: Option<String>,
    claimed_by: Option<String>,
    heartbeat_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: row.id,
            region: row.region,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            found: row.found,
            processed: row.processed,
            ok: row.ok,
            errors: row.errors,
            error_message: row.error_message,
            claimed_by: row.claimed_by,
            heartbeat_at: row.heartbeat_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct StepRow {
    id: Uuid,
    run_id: Uuid,
    source_id: Option<Uuid>,
    stage: String,
    status: String,
    payload: Option<Value>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRow> for Step {
    type Error = StoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Step {
            id: row.id,
            run_id: row.run_id,
            source_id: row.source_id,
            stage: row.stage.parse().map_err(StoreError::Corrupt)?,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            payload: row.payload,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SourceRow {
    id: Uuid,
    url: String,
    domain: Option<String>,
    region_code: Option<String>,
    is_official: bool,
    first_seen_at: DateTime<Utc>,
    last_checked_at: Option<DateTime<Utc>>,
    status: String,
}

impl From<SourceRow> for Source {
    fn from(row: SourceRow) -> Self {
        Source {
            id: row.id,
            url: row.url,
            domain: row.domain,
            region_code: row.region_code,
            is_official: row.is_official,
            first_seen_at: row.first_seen_at,
            last_checked_at: row.last_checked_at,
            status: row.status,
        }
    }
}

#[derive(Debug, FromRow)]
struct SnapshotRow {
    id: Uuid,
    source_id: Uuid,
    content_hash: String,
    stored_at: DateTime<Utc>,
    raw_content: String,
    clean_text: String,
    http_status: Option<i32>,
    charset: Option<String>,
}

impl From<SnapshotRow> for Snapshot {
    fn from(row: SnapshotRow) -> Self {
        Snapshot {
            id: row.id,
            source_id: row.source_id,
            content_hash: row.content_hash,
            stored_at: row.stored_at,
            raw_content: row.raw_content,
            clean_text: row.clean_text,
            http_status: row.http_status,
            charset: row.charset,
        }
    }
}

#[derive(Debug, FromRow)]
struct MeasureRow {
    intlid: String,
    card: Value,
    region_code: String,
    prglvl: String,
    segmnt: String,
    typeid: String,
    source_id: Option<Uuid>,
    checked_at: DateTime<Utc>,
}

impl From<MeasureRow> for Measure {
    fn from(row: MeasureRow) -> Self {
        Measure {
            intlid: row.intlid,
            card: row.card,
            region_code: row.region_code,
            prglvl: row.prglvl,
            segmnt: row.segmnt,
            typeid: row.typeid,
            source_id: row.source_id,
            checked_at: row.checked_at,
        }
    }
}

/// Serialization failure, deadlock or a unique violation lost to a concurrent insert
fn is_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01") | Some("23505"))
        },
        _ => false,
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations from the workspace `migrations/` directory
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    async fn run_exists(&self, run_id: Uuid) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM runs WHERE id = $1)")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Error for an update that matched no unfinished run
    async fn missing_or_finished(&self, run_id: Uuid) -> StoreError {
        match self.run_exists(run_id).await {
            Ok(true) => StoreError::RunFinished(run_id),
            Ok(false) => StoreError::not_found("run", run_id),
            Err(e) => e,
        }
    }

    async fn allocate_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        prefix: &str,
        source_id: Uuid,
        width: usize,
    ) -> StoreResult<Allocation> {
        sqlx::query(
            "INSERT INTO intlid_sequences (prefix, last_seq) VALUES ($1, 0) \
             ON CONFLICT (prefix) DO NOTHING",
        )
        .bind(prefix)
        .execute(&mut **tx)
        .await?;

        let last_seq: i64 =
            sqlx::query_scalar("SELECT last_seq FROM intlid_sequences WHERE prefix = $1 FOR UPDATE")
                .bind(prefix)
                .fetch_one(&mut **tx)
                .await?;

        let existing: Option<(String, i64)> = sqlx::query_as(
            "SELECT intlid, sequence FROM intlid_assignments WHERE prefix = $1 AND source_id = $2",
        )
        .bind(prefix)
        .bind(source_id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some((intlid, sequence)) = existing {
            return Ok(Allocation {
                intlid,
                sequence,
                reused: true,
            });
        }

        let issued: Vec<String> = sqlx::query_scalar(
            "SELECT intlid FROM measures WHERE left(intlid, length($1) + 1) = $1 || '_'",
        )
        .bind(prefix)
        .fetch_all(&mut **tx)
        .await?;

        let sequence = sequence_after(prefix, last_seq, issued.iter().map(String::as_str));
        let intlid = format_intlid(prefix, sequence, width);

        sqlx::query(
            "UPDATE intlid_sequences SET last_seq = $2, updated_at = NOW() WHERE prefix = $1",
        )
        .bind(prefix)
        .bind(sequence)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            "INSERT INTO intlid_assignments (intlid, prefix, source_id, sequence) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&intlid)
        .bind(prefix)
        .bind(source_id)
        .bind(sequence)
        .execute(&mut **tx)
        .await?;

        Ok(Allocation {
            intlid,
            sequence,
            reused: false,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_run(&self, region: &str, status: RunStatus) -> StoreResult<Run> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "INSERT INTO runs (id, region, status, started_at, heartbeat_at) \
             VALUES ($1, $2, $3, NOW(), NOW()) \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&*scrub::text(region))
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn claim_queued_run(&self, worker: &str) -> StoreResult<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            UPDATE runs
            SET status = 'running', started_at = NOW(), heartbeat_at = NOW(), claimed_by = $1
            WHERE id = (
                SELECT id FROM runs
                WHERE status = 'queued'
                ORDER BY started_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(&*scrub::text(worker))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn increment_run_counter(
        &self,
        run_id: Uuid,
        counter: RunCounter,
        by: i64,
    ) -> StoreResult<Run> {
        let column = counter.column();
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE runs SET {column} = {column} + $2, heartbeat_at = NOW() \
             WHERE id = $1 AND finished_at IS NULL \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id)
        .bind(by)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.missing_or_finished(run_id).await),
        }
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> StoreResult<Run> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE runs SET status = $2, finished_at = NOW(), error_message = $3 \
             WHERE id = $1 AND finished_at IS NULL \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id)
        .bind(status.as_str())
        .bind(scrub::opt_text(error_message).as_deref())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.missing_or_finished(run_id).await),
        }
    }

    async fn fail_stale_runs(
        &self,
        silent_since: DateTime<Utc>,
        error_message: &str,
    ) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE runs
            SET status = 'error', finished_at = NOW(), error_message = $2
            WHERE status = 'running' AND finished_at IS NULL AND heartbeat_at < $1
            RETURNING id
            "#,
        )
        .bind(silent_since)
        .bind(&*scrub::text(error_message))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn open_step(
        &self,
        run_id: Uuid,
        stage: Stage,
        source_id: Option<Uuid>,
    ) -> StoreResult<Step> {
        // clock_timestamp() keeps steps of one run strictly ordered
        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            WITH live AS (
                UPDATE runs SET heartbeat_at = NOW()
                WHERE id = $2 AND finished_at IS NULL
                RETURNING id
            )
            INSERT INTO steps (id, run_id, source_id, stage, status, created_at)
            SELECT $1, live.id, $3, $4, 'running', clock_timestamp()
            FROM live
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(source_id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.missing_or_finished(run_id).await),
        }
    }

    async fn close_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        payload: Value,
    ) -> StoreResult<Step> {
        if status == StepStatus::Running {
            return Err(StoreError::Corrupt(format!(
                "step {} cannot be closed as running",
                step_id
            )));
        }

        let payload = scrub::json(&payload);
        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            WITH closed AS (
                UPDATE steps SET status = $2, payload = $3, finished_at = clock_timestamp()
                WHERE id = $1 AND finished_at IS NULL
                RETURNING {STEP_COLUMNS}
            ),
            beat AS (
                UPDATE runs SET heartbeat_at = NOW()
                WHERE id IN (SELECT run_id FROM closed) AND finished_at IS NULL
            )
            SELECT {STEP_COLUMNS} FROM closed
            "#
        ))
        .bind(step_id)
        .bind(status.as_str())
        .bind(&*payload)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row.try_into();
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM steps WHERE id = $1)")
            .bind(step_id)
            .fetch_one(&self.pool)
            .await?;
        Err(if exists {
            StoreError::StepClosed(step_id)
        } else {
            StoreError::not_found("step", step_id)
        })
    }

    async fn list_steps(&self, run_id: Uuid) -> StoreResult<Vec<Step>> {
        let rows = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = $1 ORDER BY created_at, id"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Step::try_from).collect()
    }

    async fn get_step(&self, run_id: Uuid, step_id: Uuid) -> StoreResult<Option<Step>> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = $1 AND id = $2"
        ))
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Step::try_from).transpose()
    }

    async fn resolve_source(&self, source: &NewSource) -> StoreResult<Source> {
        let inserted = sqlx::query_as::<_, SourceRow>(&format!(
            r#"
            INSERT INTO sources (id, url, domain, region_code, is_official, first_seen_at, status)
            VALUES ($1, $2, $3, $4, $5, NOW(), 'new')
            ON CONFLICT (url) DO NOTHING
            RETURNING {SOURCE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&*scrub::text(&source.url))
        .bind(scrub::opt_text(source.domain.as_deref()).as_deref())
        .bind(scrub::opt_text(source.region_code.as_deref()).as_deref())
        .bind(source.is_official)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        // Lost the race for this URL; the winner's row is committed
        let row = sqlx::query_as::<_, SourceRow>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE url = $1"
        ))
        .bind(&*scrub::text(&source.url))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("source", &source.url))?;

        Ok(row.into())
    }

    async fn touch_source(&self, source_id: Uuid, status: &str) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE sources SET last_checked_at = NOW(), status = $2 WHERE id = $1")
                .bind(source_id)
                .bind(&*scrub::text(status))
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("source", source_id));
        }
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> StoreResult<Snapshot> {
        let row = sqlx::query_as::<_, SnapshotRow>(&format!(
            r#"
            INSERT INTO snapshots
                (id, source_id, content_hash, stored_at, raw_content, clean_text, http_status, charset)
            VALUES ($1, $2, $3, NOW(), $4, $5, $6, $7)
            RETURNING {SNAPSHOT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(snapshot.source_id)
        .bind(&snapshot.content_hash)
        .bind(&*scrub::text(&snapshot.raw_content))
        .bind(&*scrub::text(&snapshot.clean_text))
        .bind(snapshot.http_status)
        .bind(scrub::opt_text(snapshot.charset.as_deref()).as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_snapshot(&self, snapshot_id: Uuid) -> StoreResult<Option<Snapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE id = $1"
        ))
        .bind(snapshot_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Snapshot::from))
    }

    async fn allocate_intlid(
        &self,
        prefix: &str,
        source_id: Uuid,
        width: usize,
    ) -> StoreResult<Allocation> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.pool.begin().await?;
            match Self::allocate_in_tx(&mut tx, prefix, source_id, width).await {
                Ok(allocation) => match tx.commit().await {
                    Ok(()) => return Ok(allocation),
                    Err(e) if is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                        tracing::debug!(prefix, attempt, error = %e, "Retrying identifier allocation");
                    },
                    Err(e) => return Err(e.into()),
                },
                Err(StoreError::Database(e)) if is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                    tracing::debug!(prefix, attempt, error = %e, "Retrying identifier allocation");
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn upsert_measure(&self, measure: &NewMeasure) -> StoreResult<Measure> {
        let row = sqlx::query_as::<_, MeasureRow>(&format!(
            r#"
            INSERT INTO measures (intlid, card, region_code, prglvl, segmnt, typeid, source_id, checked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (intlid) DO UPDATE SET
                card = EXCLUDED.card,
                region_code = EXCLUDED.region_code,
                prglvl = EXCLUDED.prglvl,
                segmnt = EXCLUDED.segmnt,
                typeid = EXCLUDED.typeid,
                source_id = EXCLUDED.source_id,
                checked_at = EXCLUDED.checked_at
            RETURNING {MEASURE_COLUMNS}
            "#
        ))
        .bind(&*scrub::text(&measure.intlid))
        .bind(&*scrub::json(&measure.card))
        .bind(&*scrub::text(&measure.region_code))
        .bind(&*scrub::text(&measure.prglvl))
        .bind(&*scrub::text(&measure.segmnt))
        .bind(&*scrub::text(&measure.typeid))
        .bind(measure.source_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_measure(&self, intlid: &str) -> StoreResult<Option<Measure>> {
        let row = sqlx::query_as::<_, MeasureRow>(&format!(
            "SELECT {MEASURE_COLUMNS} FROM measures WHERE intlid = $1"
        ))
        .bind(intlid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Measure::from))
    }
}
