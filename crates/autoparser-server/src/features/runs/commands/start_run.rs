//! Start run command
//!
//! Triggers a pipeline run for a region through the configured execution mode.
//! In sync mode the response carries the terminal run; in queued mode it carries
//! the pending run id and the queue ticket.

use mediator::Request;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Run, RunStatus};
use crate::pipeline::{ExecutionMode, ExecutionModeKind, LedgerError, PipelineError, RunResult};

/// Command to start a run
///
/// # Examples
///
/// ```rust,ignore
/// use autoparser_server::features::runs::commands::StartRunCommand;
///
/// let command = StartRunCommand {
///     region: "Татарстан".to_string(),
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRunCommand {
    /// Free-text region token handed to search
    pub region: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub mode: ExecutionModeKind,
    /// Queue entry handle, present in queued mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    /// Terminal run, present in sync mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<Run>,
}

impl From<RunResult> for StartRunResponse {
    fn from(result: RunResult) -> Self {
        match result {
            RunResult::Completed(run) => Self {
                run_id: run.id,
                status: run.status,
                mode: ExecutionModeKind::Sync,
                ticket: None,
                run: Some(run),
            },
            RunResult::Pending { run_id, ticket } => Self {
                run_id,
                status: RunStatus::Queued,
                mode: ExecutionModeKind::Queued,
                ticket: Some(ticket),
                run: None,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartRunError {
    #[error("Region must not be empty")]
    EmptyRegion,

    #[error("Failed to start run: {0}")]
    Pipeline(PipelineError),
}

impl From<PipelineError> for StartRunError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Ledger(LedgerError::EmptyRegion) => StartRunError::EmptyRegion,
            other => StartRunError::Pipeline(other),
        }
    }
}

impl Request<Result<StartRunResponse, StartRunError>> for StartRunCommand {}

impl StartRunCommand {
    pub fn validate(&self) -> Result<(), StartRunError> {
        if self.region.trim().is_empty() {
            return Err(StartRunError::EmptyRegion);
        }
        Ok(())
    }
}

#[tracing::instrument(skip(mode), fields(region = %command.region, mode = %mode.kind()))]
pub async fn handle(
    mode: &dyn ExecutionMode,
    command: StartRunCommand,
) -> Result<StartRunResponse, StartRunError> {
    command.validate()?;

    let result = mode.run_pipeline(&command.region).await?;
    tracing::info!(run_id = %result.run_id(), "Run started");

    Ok(result.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{QueuedMode, RunLedger};
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_queued_start_returns_ticket() {
        let store = Arc::new(MemoryStore::new());
        let mode = QueuedMode::new(RunLedger::new(store.clone()));

        let response = handle(
            &mode,
            StartRunCommand {
                region: "Татарстан".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(response.status, RunStatus::Queued);
        assert_eq!(response.ticket, Some(response.run_id.to_string()));
        assert!(response.run.is_none());

        let run = store.get_run(response.run_id).await.unwrap().unwrap();
        assert_eq!(run.region, "Татарстан");
    }

    #[tokio::test]
    async fn test_empty_region_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mode = QueuedMode::new(RunLedger::new(store.clone()));

        let result = handle(
            &mode,
            StartRunCommand {
                region: "   ".to_string(),
            },
        )
        .await;

        assert!(matches!(result, Err(StartRunError::EmptyRegion)));
        assert!(store.list_runs(10).await.unwrap().is_empty());
    }
}
