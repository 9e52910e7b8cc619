//! Get measure query
//!
//! Query to get a stored measure by its composite identifier.

use mediator::Request;
use serde::{Deserialize, Serialize};

use crate::models::Measure;
use crate::store::{Store, StoreError};

/// Query to get a measure by `msr_intlid`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMeasureQuery {
    pub intlid: String,
}

/// Error type for get measure query
#[derive(Debug, thiserror::Error)]
pub enum GetMeasureError {
    #[error("Measure not found")]
    NotFound,
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl Request<Result<Measure, GetMeasureError>> for GetMeasureQuery {}

pub async fn handle(store: &dyn Store, query: GetMeasureQuery) -> Result<Measure, GetMeasureError> {
    store
        .get_measure(query.intlid.trim())
        .await?
        .ok_or(GetMeasureError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMeasure;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_measure() {
        let store = MemoryStore::new();
        store
            .upsert_measure(&NewMeasure {
                intlid: "16_REG_MSP_GRANT_001".to_string(),
                card: json!({ "msr_intlid": "16_REG_MSP_GRANT_001" }),
                region_code: "16".to_string(),
                prglvl: "REG".to_string(),
                segmnt: "MSP".to_string(),
                typeid: "GRANT".to_string(),
                source_id: None,
            })
            .await
            .unwrap();

        let measure = handle(
            &store,
            GetMeasureQuery {
                intlid: "16_REG_MSP_GRANT_001".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(measure.typeid, "GRANT");

        let result = handle(
            &store,
            GetMeasureQuery {
                intlid: "16_REG_MSP_GRANT_002".to_string(),
            },
        )
        .await;
        assert!(matches!(result, Err(GetMeasureError::NotFound)));
    }
}
