//! List steps query
//!
//! Step history of a run in the order the steps were opened, without payloads.
//! A step still open after its run finished is reported with an effective
//! status of `error`.

use mediator::Request;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::StepSummary;
use crate::store::{Store, StoreError};

/// Query to list the steps of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListStepsQuery {
    pub run_id: Uuid,
}

/// Response for list steps query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListStepsResponse {
    pub run_id: Uuid,
    pub steps: Vec<StepSummary>,
}

/// Error type for list steps query
#[derive(Debug, thiserror::Error)]
pub enum ListStepsError {
    #[error("Run not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl Request<Result<ListStepsResponse, ListStepsError>> for ListStepsQuery {}

pub async fn handle(
    store: &dyn Store,
    query: ListStepsQuery,
) -> Result<ListStepsResponse, ListStepsError> {
    let run = store
        .get_run(query.run_id)
        .await?
        .ok_or(ListStepsError::NotFound)?;

    let run_finished = run.is_finished();
    let steps = store
        .list_steps(run.id)
        .await?
        .iter()
        .map(|step| StepSummary::from_step(step, run_finished))
        .collect();

    Ok(ListStepsResponse {
        run_id: run.id,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, StepStatus};
    use crate::pipeline::Stage;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_step_of_finished_run_is_crashed() {
        let store = MemoryStore::new();
        let run = store.insert_run("Татарстан", RunStatus::Running).await.unwrap();

        let search = store.open_step(run.id, Stage::Search, None).await.unwrap();
        store
            .close_step(search.id, StepStatus::Ok, json!({ "urls": [] }))
            .await
            .unwrap();
        store.open_step(run.id, Stage::Fetch, None).await.unwrap();

        let response = handle(&store, ListStepsQuery { run_id: run.id }).await.unwrap();
        assert_eq!(response.steps.len(), 2);
        assert!(response.steps[1].is_open);
        assert!(!response.steps[1].is_crashed());

        store
            .finish_run(run.id, RunStatus::Error, Some("panicked: boom"))
            .await
            .unwrap();

        let response = handle(&store, ListStepsQuery { run_id: run.id }).await.unwrap();
        assert_eq!(response.steps[0].effective_status, StepStatus::Ok);
        assert_eq!(response.steps[1].status, StepStatus::Running);
        assert!(response.steps[1].is_crashed());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let store = MemoryStore::new();
        let result = handle(
            &store,
            ListStepsQuery {
                run_id: Uuid::new_v4(),
            },
        )
        .await;
        assert!(matches!(result, Err(ListStepsError::NotFound)));
    }
}
