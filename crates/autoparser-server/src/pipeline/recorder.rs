//! Append-only audit trail of stage attempts

use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Step, StepStatus};
use crate::pipeline::stages::Stage;
use crate::store::{Store, StoreError};

/// An opened step; closing consumes it, so each attempt closes at most once
#[derive(Debug)]
#[must_use = "an opened step must be closed"]
pub struct OpenStep {
    id: Uuid,
    stage: Stage,
}

impl OpenStep {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }
}

#[derive(Clone)]
pub struct StepRecorder {
    store: Arc<dyn Store>,
}

impl StepRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn open(
        &self,
        run_id: Uuid,
        stage: Stage,
        source_id: Option<Uuid>,
    ) -> Result<OpenStep, StoreError> {
        let step = self.store.open_step(run_id, stage, source_id).await?;
        tracing::debug!(%run_id, step_id = %step.id, %stage, "Step opened");
        Ok(OpenStep { id: step.id, stage })
    }

    pub async fn close(
        &self,
        step: OpenStep,
        status: StepStatus,
        payload: Value,
    ) -> Result<Step, StoreError> {
        let closed = self.store.close_step(step.id, status, payload).await?;
        match status {
            StepStatus::Ok => {
                tracing::debug!(step_id = %step.id, stage = %step.stage, "Step ok")
            },
            StepStatus::Invalid | StepStatus::Error | StepStatus::Running => tracing::warn!(
                step_id = %step.id,
                stage = %step.stage,
                status = %status,
                "Step did not succeed"
            ),
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_then_close() {
        let store = Arc::new(MemoryStore::new());
        let run = store.insert_run("Татарстан", RunStatus::Running).await.unwrap();
        let recorder = StepRecorder::new(store.clone());

        let step = recorder.open(run.id, Stage::Search, None).await.unwrap();
        let id = step.id();

        let listed = store.list_steps(run.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_open());

        let closed = recorder
            .close(step, StepStatus::Ok, json!({"urls": []}))
            .await
            .unwrap();
        assert_eq!(closed.id, id);
        assert_eq!(closed.status, StepStatus::Ok);
        assert!(closed.finished_at.is_some());
    }
}
