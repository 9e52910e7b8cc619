//! Get step query
//!
//! A single step of a run, including its payload.

use mediator::Request;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Step;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStepQuery {
    pub run_id: Uuid,
    pub step_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum GetStepError {
    #[error("Step not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl Request<Result<Step, GetStepError>> for GetStepQuery {}

pub async fn handle(store: &dyn Store, query: GetStepQuery) -> Result<Step, GetStepError> {
    store
        .get_step(query.run_id, query.step_id)
        .await?
        .ok_or(GetStepError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, StepStatus};
    use crate::pipeline::Stage;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_step_is_scoped_to_its_run() {
        let store = MemoryStore::new();
        let run = store.insert_run("Татарстан", RunStatus::Running).await.unwrap();
        let other = store.insert_run("Чувашия", RunStatus::Running).await.unwrap();

        let step = store.open_step(run.id, Stage::Search, None).await.unwrap();
        store
            .close_step(step.id, StepStatus::Error, json!({ "error": "timeout" }))
            .await
            .unwrap();

        let found = handle(
            &store,
            GetStepQuery {
                run_id: run.id,
                step_id: step.id,
            },
        )
        .await
        .unwrap();
        assert_eq!(found.payload, Some(json!({ "error": "timeout" })));

        let result = handle(
            &store,
            GetStepQuery {
                run_id: other.id,
                step_id: step.id,
            },
        )
        .await;
        assert!(matches!(result, Err(GetStepError::NotFound)));
    }
}
