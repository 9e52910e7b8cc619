//! List runs query
//!
//! Most recently started runs first.

use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::models::Run;
use crate::store::{Store, StoreError};

/// Query to list runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRunsQuery {
    /// Limit number of results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// Response for list runs query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

/// Error type for list runs query
#[derive(Debug, thiserror::Error)]
pub enum ListRunsError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl Request<Result<ListRunsResponse, ListRunsError>> for ListRunsQuery {}

pub async fn handle(
    store: &dyn Store,
    query: ListRunsQuery,
) -> Result<ListRunsResponse, ListRunsError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000); // Max 1000

    let runs = store.list_runs(limit).await?;

    Ok(ListRunsResponse { runs })
}
