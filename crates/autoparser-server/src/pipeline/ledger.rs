//! Run lifecycle and aggregate counters

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{Run, RunCounter, RunStatus};
use crate::store::{Store, StoreError};

/// Message stored on runs failed by the stale-run reaper
pub const STALE_RUN_MESSAGE: &str = "worker lost: no heartbeat within the stale timeout";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("region must not be empty")]
    EmptyRegion,

    #[error("run {0} not found")]
    NotFound(Uuid),

    /// The run already reached `done` or `error`
    #[error("run {0} is terminal and cannot be modified")]
    Terminal(Uuid),

    #[error("'{0}' is not a terminal run status")]
    NotTerminal(RunStatus),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunFinished(id) => LedgerError::Terminal(id),
            StoreError::NotFound { entity: "run", id } => match id.parse() {
                Ok(id) => LedgerError::NotFound(id),
                Err(_) => LedgerError::Store(StoreError::NotFound { entity: "run", id }),
            },
            other => LedgerError::Store(other),
        }
    }
}

/// Only writer of run rows
#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn Store>,
}

impl RunLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn normalize_region(region: &str) -> Result<&str, LedgerError> {
        let region = region.trim();
        if region.is_empty() {
            return Err(LedgerError::EmptyRegion);
        }
        Ok(region)
    }

    /// Create a run that executes immediately
    pub async fn start_run(&self, region: &str) -> Result<Run, LedgerError> {
        let region = Self::normalize_region(region)?;
        let run = self.store.insert_run(region, RunStatus::Running).await?;
        tracing::info!(run_id = %run.id, region, "Run started");
        Ok(run)
    }

    /// Create a run for a worker to pick up later
    pub async fn enqueue_run(&self, region: &str) -> Result<Run, LedgerError> {
        let region = Self::normalize_region(region)?;
        let run = self.store.insert_run(region, RunStatus::Queued).await?;
        tracing::info!(run_id = %run.id, region, "Run queued");
        Ok(run)
    }

    /// Claim the oldest queued run for `worker`
    pub async fn claim_next(&self, worker: &str) -> Result<Option<Run>, LedgerError> {
        let run = self.store.claim_queued_run(worker).await?;
        if let Some(ref run) = run {
            tracing::info!(run_id = %run.id, region = %run.region, worker, "Run claimed");
        }
        Ok(run)
    }

    pub async fn increment(&self, run_id: Uuid, counter: RunCounter) -> Result<Run, LedgerError> {
        self.increment_by(run_id, counter, 1).await
    }

    pub async fn increment_by(
        &self,
        run_id: Uuid,
        counter: RunCounter,
        by: i64,
    ) -> Result<Run, LedgerError> {
        Ok(self.store.increment_run_counter(run_id, counter, by).await?)
    }

    /// Final write of a run; later mutations fail with [`LedgerError::Terminal`]
    pub async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<Run, LedgerError> {
        if !status.is_terminal() {
            return Err(LedgerError::NotTerminal(status));
        }

        let run = self.store.finish_run(run_id, status, error_message).await?;
        tracing::info!(
            run_id = %run.id,
            status = %run.status,
            found = run.found,
            processed = run.processed,
            ok = run.ok,
            errors = run.errors,
            "Run finished"
        );
        Ok(run)
    }

    /// Fail `running` runs whose heartbeat is older than `silent_for`
    ///
    /// Every step and counter write refreshes the heartbeat, so a live run is
    /// only reaped if a single stage stalls for the whole window.
    pub async fn reap_stale(&self, silent_for: Duration) -> Result<Vec<Uuid>, LedgerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(silent_for).unwrap_or_else(|_| chrono::Duration::days(1));
        let reaped = self.store.fail_stale_runs(cutoff, STALE_RUN_MESSAGE).await?;
        if !reaped.is_empty() {
            tracing::warn!(count = reaped.len(), "Stale runs marked as error");
        }
        Ok(reaped)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Run, LedgerError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(LedgerError::NotFound(run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ledger() -> RunLedger {
        RunLedger::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_start_run_has_zero_counters() {
        let run = ledger().start_run("  Татарстан ").await.unwrap();
        assert_eq!(run.region, "Татарстан");
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!((run.found, run.processed, run.ok, run.errors), (0, 0, 0, 0));
        assert!(run.finished_at.is_none());
    }

    #[tokio::test]
    async fn test_empty_region_is_rejected() {
        assert!(matches!(
            ledger().start_run("   ").await,
            Err(LedgerError::EmptyRegion)
        ));
        assert!(matches!(
            ledger().enqueue_run("").await,
            Err(LedgerError::EmptyRegion)
        ));
    }

    #[tokio::test]
    async fn test_terminal_run_rejects_updates() {
        let ledger = ledger();
        let run = ledger.start_run("Татарстан").await.unwrap();
        ledger.increment(run.id, RunCounter::Found).await.unwrap();
        ledger.finish_run(run.id, RunStatus::Done, None).await.unwrap();

        assert!(matches!(
            ledger.increment(run.id, RunCounter::Processed).await,
            Err(LedgerError::Terminal(id)) if id == run.id
        ));
        assert!(matches!(
            ledger.finish_run(run.id, RunStatus::Error, Some("late")).await,
            Err(LedgerError::Terminal(_))
        ));

        let run = ledger.get(run.id).await.unwrap();
        assert_eq!(run.found, 1);
        assert_eq!(run.status, RunStatus::Done);
    }

    #[tokio::test]
    async fn test_finish_requires_terminal_status() {
        let ledger = ledger();
        let run = ledger.start_run("Татарстан").await.unwrap();
        assert!(matches!(
            ledger.finish_run(run.id, RunStatus::Queued, None).await,
            Err(LedgerError::NotTerminal(RunStatus::Queued))
        ));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let id = Uuid::new_v4();
        assert!(matches!(ledger().get(id).await, Err(LedgerError::NotFound(x)) if x == id));
        assert!(matches!(
            ledger().increment(id, RunCounter::Ok).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let ledger = ledger();
        let run = ledger.start_run("Татарстан").await.unwrap();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.increment(run.id, RunCounter::Processed).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(ledger.get(run.id).await.unwrap().processed, 32);
    }
}
