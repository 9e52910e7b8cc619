//! List measures for run query
//!
//! Measures a run saved, found through its successful SAVE steps.

use chrono::{DateTime, Utc};
use mediator::Request;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::StepStatus;
use crate::pipeline::merger::INTLID_KEY;
use crate::pipeline::Stage;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMeasuresForRunQuery {
    pub run_id: Uuid,
}

/// Measure list item, without the card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureSummary {
    pub intlid: String,
    /// SAVE step that wrote the measure in this run
    pub step_id: Uuid,
    pub region_code: String,
    pub prglvl: String,
    pub segmnt: String,
    pub typeid: String,
    pub source_id: Option<Uuid>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMeasuresForRunResponse {
    pub run_id: Uuid,
    pub measures: Vec<MeasureSummary>,
}

#[derive(Debug, thiserror::Error)]
pub enum ListMeasuresForRunError {
    #[error("Run not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl Request<Result<ListMeasuresForRunResponse, ListMeasuresForRunError>>
    for ListMeasuresForRunQuery
{
}

pub async fn handle(
    store: &dyn Store,
    query: ListMeasuresForRunQuery,
) -> Result<ListMeasuresForRunResponse, ListMeasuresForRunError> {
    let run = store
        .get_run(query.run_id)
        .await?
        .ok_or(ListMeasuresForRunError::NotFound)?;

    let mut seen = HashSet::new();
    let mut measures = Vec::new();

    for step in store.list_steps(run.id).await? {
        if step.stage != Stage::Save || step.status != StepStatus::Ok {
            continue;
        }
        let Some(intlid) = step
            .payload
            .as_ref()
            .and_then(|p| p.get(INTLID_KEY))
            .and_then(|v| v.as_str())
        else {
            continue;
        };
        if !seen.insert(intlid.to_string()) {
            continue;
        }

        match store.get_measure(intlid).await? {
            Some(measure) => measures.push(MeasureSummary {
                intlid: measure.intlid,
                step_id: step.id,
                region_code: measure.region_code,
                prglvl: measure.prglvl,
                segmnt: measure.segmnt,
                typeid: measure.typeid,
                source_id: measure.source_id,
                checked_at: measure.checked_at,
            }),
            None => tracing::warn!(%intlid, step_id = %step.id, "Saved measure is missing"),
        }
    }

    Ok(ListMeasuresForRunResponse {
        run_id: run.id,
        measures,
    })
}
