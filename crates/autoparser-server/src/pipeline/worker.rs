//! Queue worker for runs triggered in queued mode
//!
//! Workers poll the runs table for `queued` rows, claim them atomically and
//! execute them with the same [`StageExecutor`] the synchronous mode uses.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::executor::StageExecutor;
use super::ledger::RunLedger;
use super::PipelineError;
use crate::models::Run;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub concurrency: usize,
    /// Runs `running` that wrote nothing for longer than this are treated as orphaned
    pub stale_after: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
        }
    }
}

fn worker_name() -> String {
    let host = hostname::get()
        .unwrap_or_else(|_| "unknown".into())
        .to_string_lossy()
        .to_string();
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &id[..8])
}

#[derive(Clone)]
pub struct RunWorker {
    name: String,
    ledger: RunLedger,
    executor: StageExecutor,
    settings: WorkerSettings,
}

impl RunWorker {
    pub fn new(ledger: RunLedger, executor: StageExecutor, settings: WorkerSettings) -> Self {
        Self {
            name: worker_name(),
            ledger,
            executor,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim and execute at most one queued run
    pub async fn run_once(&self, cancel: CancellationToken) -> Result<Option<Run>, PipelineError> {
        let Some(run) = self.ledger.claim_next(&self.name).await? else {
            return Ok(None);
        };
        let run = self.executor.execute(run, cancel).await?;
        Ok(Some(run))
    }

    /// Poll until `cancel` fires, executing up to `concurrency` runs at once
    ///
    /// In-flight runs observe the same token and stop between sources.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        self.ledger.reap_stale(self.settings.stale_after).await?;

        tracing::info!(
            worker = %self.name,
            concurrency = self.settings.concurrency,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Worker started"
        );

        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Reap finished tasks so the set does not grow without bound
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Run task aborted");
                }
            }

            match self.ledger.claim_next(&self.name).await {
                Ok(Some(run)) => {
                    let executor = self.executor.clone();
                    let token = cancel.child_token();
                    tasks.spawn(async move {
                        let run_id = run.id;
                        if let Err(e) = executor.execute(run, token).await {
                            tracing::error!(%run_id, error = %e, "Run could not be finalized");
                        }
                        drop(permit);
                    });
                },
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.poll_interval) => {},
                    }
                },
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to claim run");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.poll_interval) => {},
                    }
                },
            }
        }

        tracing::info!(worker = %self.name, in_flight = tasks.len(), "Worker stopping");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Run task aborted");
            }
        }

        Ok(())
    }
}
