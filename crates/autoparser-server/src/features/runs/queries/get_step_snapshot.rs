//! Get step snapshot query
//!
//! Resolves the page snapshot a FETCH step captured.

use mediator::Request;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Snapshot;
use crate::pipeline::Stage;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStepSnapshotQuery {
    pub run_id: Uuid,
    pub step_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub step_id: Uuid,
    pub snapshot: Snapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum GetStepSnapshotError {
    #[error("Step not found")]
    NotFound,
    #[error("Step is a {0} step; only FETCH steps capture snapshots")]
    NotAFetchStep(Stage),
    #[error("Step did not capture a snapshot")]
    NoSnapshot,
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl Request<Result<StepSnapshot, GetStepSnapshotError>> for GetStepSnapshotQuery {}

pub async fn handle(
    store: &dyn Store,
    query: GetStepSnapshotQuery,
) -> Result<StepSnapshot, GetStepSnapshotError> {
    let step = store
        .get_step(query.run_id, query.step_id)
        .await?
        .ok_or(GetStepSnapshotError::NotFound)?;

    if step.stage != Stage::Fetch {
        return Err(GetStepSnapshotError::NotAFetchStep(step.stage));
    }

    let snapshot_id = step
        .payload
        .as_ref()
        .and_then(|p| p.get("snapshot_id"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Uuid>().ok())
        .ok_or(GetStepSnapshotError::NoSnapshot)?;

    let snapshot = store
        .get_snapshot(snapshot_id)
        .await?
        .ok_or(GetStepSnapshotError::NoSnapshot)?;

    Ok(StepSnapshot {
        step_id: step.id,
        snapshot,
    })
}
