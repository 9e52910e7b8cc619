//! Get run query
//!
//! Query to get a single run with its counters.

use mediator::Request;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Run;
use crate::store::{Store, StoreError};

/// Query to get a run by ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRunQuery {
    pub run_id: Uuid,
}

/// Error type for get run query
#[derive(Debug, thiserror::Error)]
pub enum GetRunError {
    #[error("Run not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl Request<Result<Run, GetRunError>> for GetRunQuery {}

pub async fn handle(store: &dyn Store, query: GetRunQuery) -> Result<Run, GetRunError> {
    store
        .get_run(query.run_id)
        .await?
        .ok_or(GetRunError::NotFound)
}
