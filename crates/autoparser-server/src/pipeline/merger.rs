//! Folding stage outputs into one measure card
//!
//! Outputs overlay each other in [`MERGE_ORDER`]; a later stage wins on key
//! collisions. The card is assembled from sorted maps, so the same inputs give
//! byte-identical JSON whatever order the stages finished in.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{Measure, NewMeasure};
use crate::pipeline::identifier::IdentityFacets;
use crate::pipeline::stages::ExtractionStage;
use crate::store::{Store, StoreError};

/// Overlay order of stage outputs; later entries overwrite earlier ones
pub const MERGE_ORDER: [ExtractionStage; 7] = [
    ExtractionStage::E1,
    ExtractionStage::E2,
    ExtractionStage::E3,
    ExtractionStage::E4,
    ExtractionStage::E5,
    ExtractionStage::E6,
    ExtractionStage::E7,
];

pub const INTLID_KEY: &str = "msr_intlid";
pub const PROVENANCE_KEY: &str = "provenance";

/// Everything a card is built from
#[derive(Debug, Clone)]
pub struct MergeInput<'a> {
    pub intlid: &'a str,
    pub region: &'a str,
    pub source_url: &'a str,
    /// Successful stage outputs, in any order
    pub outputs: &'a [(ExtractionStage, Map<String, Value>)],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRecord {
    pub card: Value,
    /// Keys of the final card each stage supplied
    pub contributions: BTreeMap<ExtractionStage, Vec<String>>,
}

#[derive(Clone)]
pub struct RecordMerger {
    store: Arc<dyn Store>,
}

impl RecordMerger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn merge(input: &MergeInput<'_>) -> MergedRecord {
        let mut fields: BTreeMap<String, Value> = BTreeMap::new();
        let mut owner: BTreeMap<String, ExtractionStage> = BTreeMap::new();
        let mut stages = Vec::new();

        for stage in MERGE_ORDER {
            let Some((_, output)) = input.outputs.iter().find(|(s, _)| *s == stage) else {
                continue;
            };
            stages.push(stage.as_str());
            for (key, value) in output {
                if key == INTLID_KEY || key == PROVENANCE_KEY {
                    continue;
                }
                fields.insert(key.clone(), value.clone());
                owner.insert(key.clone(), stage);
            }
        }

        let mut contributions: BTreeMap<ExtractionStage, Vec<String>> = BTreeMap::new();
        for (key, stage) in owner {
            contributions.entry(stage).or_default().push(key);
        }

        fields.insert(INTLID_KEY.to_string(), Value::String(input.intlid.to_string()));
        fields.insert(
            PROVENANCE_KEY.to_string(),
            json!({
                "region_input": input.region,
                "source_urls": [input.source_url],
                "stages": stages,
            }),
        );

        MergedRecord {
            card: Value::Object(fields.into_iter().collect()),
            contributions,
        }
    }

    /// Upsert the card under its identifier
    pub async fn save(
        &self,
        merged: &MergedRecord,
        intlid: &str,
        facets: &IdentityFacets,
        source_id: Uuid,
    ) -> Result<Measure, StoreError> {
        let measure = self
            .store
            .upsert_measure(&NewMeasure {
                intlid: intlid.to_string(),
                card: merged.card.clone(),
                region_code: facets.geocode.clone(),
                prglvl: facets.level.clone(),
                segmnt: facets.segment.clone(),
                typeid: facets.type_id.clone(),
                source_id: Some(source_id),
            })
            .await?;

        tracing::info!(intlid, %source_id, "Measure saved");
        Ok(measure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn outputs() -> Vec<(ExtractionStage, Map<String, Value>)> {
        vec![
            (
                ExtractionStage::E1,
                obj(json!({"msr_geocde": "16", "msr_prglvl": "REG", "msr_name": "Грант"})),
            ),
            (ExtractionStage::E2, obj(json!({"msr_amount_max": 500000, "msr_name": "Грант МСП"}))),
            (
                ExtractionStage::E4,
                obj(json!({"msr_segmnt": "MSP", "msr_typeid": "GRANT", "msr_intlid": "bogus"})),
            ),
            (ExtractionStage::E7, obj(json!({"msr_summary": "кратко"}))),
        ]
    }

    fn input(outputs: &[(ExtractionStage, Map<String, Value>)]) -> MergeInput<'_> {
        MergeInput {
            intlid: "16_REG_MSP_GRANT_001",
            region: "Татарстан",
            source_url: "https://mert.tatarstan.ru/grant",
            outputs,
        }
    }

    #[test]
    fn test_later_stage_wins_and_provenance_is_added() {
        let outputs = outputs();
        let merged = RecordMerger::merge(&input(&outputs));

        assert_eq!(merged.card["msr_name"], "Грант МСП");
        assert_eq!(merged.card["msr_intlid"], "16_REG_MSP_GRANT_001");
        assert_eq!(
            merged.card["provenance"],
            json!({
                "region_input": "Татарстан",
                "source_urls": ["https://mert.tatarstan.ru/grant"],
                "stages": ["E1", "E2", "E4", "E7"],
            })
        );
        assert_eq!(
            merged.contributions[&ExtractionStage::E2],
            vec!["msr_amount_max".to_string(), "msr_name".to_string()]
        );
        assert_eq!(
            merged.contributions[&ExtractionStage::E1],
            vec!["msr_geocde".to_string(), "msr_prglvl".to_string()]
        );
    }

    #[test]
    fn test_reserved_keys_are_not_overwritten_by_stages() {
        let outputs = outputs();
        let merged = RecordMerger::merge(&input(&outputs));
        assert!(!merged.contributions[&ExtractionStage::E4].contains(&"msr_intlid".to_string()));
    }

    proptest! {
        #[test]
        fn prop_merge_ignores_completion_order(seed in any::<u64>()) {
            let canonical = outputs();
            let mut shuffled = canonical.clone();
            // deterministic permutation from the seed
            let len = shuffled.len();
            let mut state = seed;
            for i in (1..len).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state % (i as u64 + 1)) as usize;
                shuffled.swap(i, j);
            }

            let a = serde_json::to_vec(&RecordMerger::merge(&input(&canonical)).card).unwrap();
            let b = serde_json::to_vec(&RecordMerger::merge(&input(&shuffled)).card).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
