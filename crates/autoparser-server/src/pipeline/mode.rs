//! Execution mode switch: run in the caller's context or hand off to a worker

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::executor::StageExecutor;
use super::ledger::RunLedger;
use super::PipelineError;
use crate::models::Run;

/// What a trigger returns
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RunResult {
    /// Executed in-process; the run is terminal
    Completed(Run),
    /// Queued for a worker; `ticket` identifies the queue entry
    Pending { run_id: Uuid, ticket: String },
}

impl RunResult {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunResult::Completed(run) => run.id,
            RunResult::Pending { run_id, .. } => *run_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionModeKind {
    #[default]
    Queued,
    Sync,
}

impl ExecutionModeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionModeKind::Queued => "queued",
            ExecutionModeKind::Sync => "sync",
        }
    }

    /// Resolve from `EXECUTION_MODE` and the legacy `LOCAL_SINGLEEXE` flag
    ///
    /// Any non-empty `LOCAL_SINGLEEXE` other than `0`/`false` forces `sync`.
    pub fn resolve(mode: Option<&str>, legacy_single_exe: Option<&str>) -> Result<Self, String> {
        let legacy = legacy_single_exe
            .map(str::trim)
            .is_some_and(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"));
        if legacy {
            return Ok(ExecutionModeKind::Sync);
        }

        match mode.map(str::trim).filter(|m| !m.is_empty()) {
            Some(mode) => mode.parse(),
            None => Ok(ExecutionModeKind::default()),
        }
    }
}

impl fmt::Display for ExecutionModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionModeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" | "queue" => Ok(ExecutionModeKind::Queued),
            "sync" | "synchronous" | "local" => Ok(ExecutionModeKind::Sync),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

#[async_trait]
pub trait ExecutionMode: Send + Sync {
    fn kind(&self) -> ExecutionModeKind;

    async fn run_pipeline(&self, region: &str) -> Result<RunResult, PipelineError>;
}

/// Executes the whole run before returning
pub struct SyncMode {
    ledger: RunLedger,
    executor: StageExecutor,
    cancel: CancellationToken,
}

impl SyncMode {
    pub fn new(ledger: RunLedger, executor: StageExecutor, cancel: CancellationToken) -> Self {
        Self {
            ledger,
            executor,
            cancel,
        }
    }
}

#[async_trait]
impl ExecutionMode for SyncMode {
    fn kind(&self) -> ExecutionModeKind {
        ExecutionModeKind::Sync
    }

    async fn run_pipeline(&self, region: &str) -> Result<RunResult, PipelineError> {
        let run = self.ledger.start_run(region).await?;
        let run = self.executor.execute(run, self.cancel.child_token()).await?;
        Ok(RunResult::Completed(run))
    }
}

/// Records the run as queued; a [`super::RunWorker`] executes it
pub struct QueuedMode {
    ledger: RunLedger,
}

impl QueuedMode {
    pub fn new(ledger: RunLedger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ExecutionMode for QueuedMode {
    fn kind(&self) -> ExecutionModeKind {
        ExecutionModeKind::Queued
    }

    async fn run_pipeline(&self, region: &str) -> Result<RunResult, PipelineError> {
        let run = self.ledger.enqueue_run(region).await?;
        Ok(RunResult::Pending {
            run_id: run.id,
            ticket: run.id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_mode() {
        assert_eq!(ExecutionModeKind::resolve(None, None), Ok(ExecutionModeKind::Queued));
        assert_eq!(
            ExecutionModeKind::resolve(Some("SYNC"), None),
            Ok(ExecutionModeKind::Sync)
        );
        assert_eq!(
            ExecutionModeKind::resolve(Some("queued"), Some("1")),
            Ok(ExecutionModeKind::Sync)
        );
        assert_eq!(
            ExecutionModeKind::resolve(Some("queued"), Some("0")),
            Ok(ExecutionModeKind::Queued)
        );
        assert_eq!(
            ExecutionModeKind::resolve(Some(" "), Some("")),
            Ok(ExecutionModeKind::Queued)
        );
        assert!(ExecutionModeKind::resolve(Some("celery"), None).is_err());
    }
}
