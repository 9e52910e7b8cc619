//! Storage for runs, steps, sources, snapshots and measures
//!
//! The pipeline talks to storage only through [`Store`]. [`PgStore`] is the
//! production backend; [`MemoryStore`] keeps everything in process for tests and
//! dry runs. Both honour the same contract:
//!
//! - every write commits on its own, so a crash leaves earlier writes inspectable
//! - counter increments are a single atomic update of the run row
//! - a finished run rejects further counter updates and new steps
//! - a step can be closed exactly once
//! - identifier allocation for one prefix is serialized
//! - writes on behalf of a live run refresh its heartbeat
//! - NUL characters are dropped from stored text and JSON

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    Allocation, Measure, NewMeasure, NewSnapshot, NewSource, Run, RunCounter, RunStatus,
    Snapshot, Source, Step, StepStatus,
};
use crate::pipeline::stages::Stage;

pub mod memory;
pub mod postgres;
pub mod scrub;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors returned by a [`Store`] implementation
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("run {0} is already finished")]
    RunFinished(Uuid),

    #[error("step {0} is already closed")]
    StepClosed(Uuid),

    /// A stored value could not be mapped back onto the domain model
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ── Runs ─────────────────────────────────────────────────────────────────

    /// Create a run with zero counters in `queued` or `running` status
    async fn insert_run(&self, region: &str, status: RunStatus) -> StoreResult<Run>;

    /// Move the oldest queued run to `running` and mark it claimed by `worker`
    async fn claim_queued_run(&self, worker: &str) -> StoreResult<Option<Run>>;

    /// Add `by` to one counter of an unfinished run
    async fn increment_run_counter(
        &self,
        run_id: Uuid,
        counter: RunCounter,
        by: i64,
    ) -> StoreResult<Run>;

    /// Set the terminal status and `finished_at` of an unfinished run
    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> StoreResult<Run>;

    /// Fail every run still `running` whose last heartbeat is older than `silent_since`
    async fn fail_stale_runs(
        &self,
        silent_since: DateTime<Utc>,
        error_message: &str,
    ) -> StoreResult<Vec<Uuid>>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>>;

    /// Most recently started runs first
    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>>;

    // ── Steps ────────────────────────────────────────────────────────────────

    async fn open_step(
        &self,
        run_id: Uuid,
        stage: Stage,
        source_id: Option<Uuid>,
    ) -> StoreResult<Step>;

    /// Terminal write of a step; `status` must not be `running`
    async fn close_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        payload: Value,
    ) -> StoreResult<Step>;

    /// Steps of a run in the order they were opened
    async fn list_steps(&self, run_id: Uuid) -> StoreResult<Vec<Step>>;

    async fn get_step(&self, run_id: Uuid, step_id: Uuid) -> StoreResult<Option<Step>>;

    // ── Sources and snapshots ────────────────────────────────────────────────

    /// Insert the source, or return the existing row with the same URL
    async fn resolve_source(&self, source: &NewSource) -> StoreResult<Source>;

    /// Record a fetch attempt on the source
    async fn touch_source(&self, source_id: Uuid, status: &str) -> StoreResult<()>;

    async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> StoreResult<Snapshot>;

    async fn get_snapshot(&self, snapshot_id: Uuid) -> StoreResult<Option<Snapshot>>;

    // ── Measures ─────────────────────────────────────────────────────────────

    /// Reserve the next identifier for `prefix`, or return the one `source_id`
    /// already holds under it
    async fn allocate_intlid(
        &self,
        prefix: &str,
        source_id: Uuid,
        width: usize,
    ) -> StoreResult<Allocation>;

    /// Insert the measure, or fully replace the existing one with the same id
    async fn upsert_measure(&self, measure: &NewMeasure) -> StoreResult<Measure>;

    async fn get_measure(&self, intlid: &str) -> StoreResult<Option<Measure>>;
}
