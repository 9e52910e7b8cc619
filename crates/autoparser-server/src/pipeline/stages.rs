//! Stage identifiers and the extraction stage table
//!
//! Every extraction pass is an [`ExtractionStage`] with a fixed prompt key and
//! schema key. The table is enumerated exhaustively and verified at startup, so a
//! stage can never be dispatched to a handler that does not exist.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::models::StepStatus;

/// One of the seven independent structured-extraction passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExtractionStage {
    E1,
    E2,
    E3,
    E4,
    E5,
    E6,
    E7,
}

impl ExtractionStage {
    /// Execution and merge order
    pub const ALL: [ExtractionStage; 7] = [
        ExtractionStage::E1,
        ExtractionStage::E2,
        ExtractionStage::E3,
        ExtractionStage::E4,
        ExtractionStage::E5,
        ExtractionStage::E6,
        ExtractionStage::E7,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStage::E1 => "E1",
            ExtractionStage::E2 => "E2",
            ExtractionStage::E3 => "E3",
            ExtractionStage::E4 => "E4",
            ExtractionStage::E5 => "E5",
            ExtractionStage::E6 => "E6",
            ExtractionStage::E7 => "E7",
        }
    }

    /// Prompt the extraction collaborator renders for this stage
    pub fn prompt_key(&self) -> &'static str {
        match self {
            ExtractionStage::E1 => "E1_Passport",
            ExtractionStage::E2 => "E2_Finance_Legal",
            ExtractionStage::E3 => "E3_Operations",
            ExtractionStage::E4 => "E4_DNA",
            ExtractionStage::E5 => "E5_Applicant_Profile",
            ExtractionStage::E6 => "E6_Scoring",
            ExtractionStage::E7 => "E7_Strategic_Insights",
        }
    }

    /// Schema document the validation gate checks this stage's output against
    pub fn schema_key(&self) -> &'static str {
        match self {
            ExtractionStage::E1 => "e1.json",
            ExtractionStage::E2 => "e2.json",
            ExtractionStage::E3 => "e3.json",
            ExtractionStage::E4 => "e4.json",
            ExtractionStage::E5 => "e5.json",
            ExtractionStage::E6 => "e6.json",
            ExtractionStage::E7 => "e7.json",
        }
    }
}

impl fmt::Display for ExtractionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExtractionStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown extraction stage '{}'", s))
    }
}

/// A named unit of pipeline work, as recorded on a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "SEARCH")]
    Search,
    #[serde(rename = "FETCH")]
    Fetch,
    #[serde(rename = "CLEAN")]
    Clean,
    #[serde(rename = "BUILD_ID")]
    BuildId,
    #[serde(rename = "SAVE")]
    Save,
    #[serde(untagged)]
    Extract(ExtractionStage),
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Search => "SEARCH",
            Stage::Fetch => "FETCH",
            Stage::Clean => "CLEAN",
            Stage::Extract(stage) => stage.as_str(),
            Stage::BuildId => "BUILD_ID",
            Stage::Save => "SAVE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SEARCH" => Ok(Stage::Search),
            "FETCH" => Ok(Stage::Fetch),
            "CLEAN" => Ok(Stage::Clean),
            "BUILD_ID" => Ok(Stage::BuildId),
            "SAVE" => Ok(Stage::Save),
            other => other
                .parse::<ExtractionStage>()
                .map(Stage::Extract)
                .map_err(|_| format!("unknown stage '{}'", other)),
        }
    }
}

impl From<ExtractionStage> for Stage {
    fn from(stage: ExtractionStage) -> Self {
        Stage::Extract(stage)
    }
}

/// Row of the extraction stage table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageEntry {
    pub stage: ExtractionStage,
    pub prompt_key: &'static str,
    pub schema_key: &'static str,
}

/// Fixed mapping from extraction stage to prompt and schema
#[derive(Debug, Clone)]
pub struct StageTable {
    entries: Vec<StageEntry>,
}

impl StageTable {
    pub fn standard() -> Self {
        Self {
            entries: ExtractionStage::ALL
                .into_iter()
                .map(|stage| StageEntry {
                    stage,
                    prompt_key: stage.prompt_key(),
                    schema_key: stage.schema_key(),
                })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[StageEntry] {
        &self.entries
    }

    /// Check the table covers exactly the seven stages, in order, with distinct keys
    pub fn verify(&self) -> Result<(), String> {
        let stages: Vec<_> = self.entries.iter().map(|e| e.stage).collect();
        if stages != ExtractionStage::ALL {
            return Err(format!(
                "stage table must list {:?} in order, found {:?}",
                ExtractionStage::ALL,
                stages
            ));
        }

        let mut prompts = HashSet::new();
        let mut schemas = HashSet::new();
        for entry in &self.entries {
            if entry.prompt_key.is_empty() || !prompts.insert(entry.prompt_key) {
                return Err(format!("stage {} has an empty or shared prompt key", entry.stage));
            }
            if entry.schema_key.is_empty() || !schemas.insert(entry.schema_key) {
                return Err(format!("stage {} has an empty or shared schema key", entry.stage));
            }
        }

        Ok(())
    }
}

/// Classified result of one stage attempt
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T = Map<String, Value>> {
    /// Collaborator produced usable output that passed validation
    Ok(T),
    /// Output failed schema validation; kept for inspection, excluded from the merge
    Invalid { reason: String, raw: Value },
    /// Collaborator failed or returned unusable data
    Error(String),
}

impl<T> StageOutcome<T> {
    pub fn status(&self) -> StepStatus {
        match self {
            StageOutcome::Ok(_) => StepStatus::Ok,
            StageOutcome::Invalid { .. } => StepStatus::Invalid,
            StageOutcome::Error(_) => StepStatus::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StageOutcome::Ok(_))
    }
}

impl StageOutcome {
    /// Step payload recorded for this outcome
    pub fn payload(&self) -> Value {
        match self {
            StageOutcome::Ok(output) => Value::Object(output.clone()),
            StageOutcome::Invalid { reason, raw } => {
                serde_json::json!({ "error": reason, "raw": raw })
            },
            StageOutcome::Error(message) => serde_json::json!({ "error": message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trips_through_text() {
        for text in ["SEARCH", "FETCH", "CLEAN", "E1", "E7", "BUILD_ID", "SAVE"] {
            let stage: Stage = text.parse().unwrap();
            assert_eq!(stage.as_str(), text);
        }
        assert!("E8".parse::<Stage>().is_err());
        assert!("save".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_serializes_as_plain_name() {
        let json = serde_json::to_string(&Stage::Extract(ExtractionStage::E4)).unwrap();
        assert_eq!(json, "\"E4\"");
        let json = serde_json::to_string(&Stage::BuildId).unwrap();
        assert_eq!(json, "\"BUILD_ID\"");
    }

    #[test]
    fn test_standard_table_is_complete() {
        let table = StageTable::standard();
        assert!(table.verify().is_ok());
        assert_eq!(table.entries().len(), 7);
        assert_eq!(table.entries()[3].prompt_key, "E4_DNA");
    }

    #[test]
    fn test_incomplete_table_is_rejected() {
        let mut table = StageTable::standard();
        table.entries.pop();
        assert!(table.verify().is_err());

        let mut table = StageTable::standard();
        table.entries[1].schema_key = "e1.json";
        assert!(table.verify().is_err());
    }

    #[test]
    fn test_outcome_status() {
        let ok: StageOutcome = StageOutcome::Ok(Map::new());
        assert_eq!(ok.status(), StepStatus::Ok);
        let invalid: StageOutcome = StageOutcome::Invalid {
            reason: "missing msr_segmnt".into(),
            raw: Value::Null,
        };
        assert_eq!(invalid.status(), StepStatus::Invalid);
        assert!(!invalid.is_ok());
    }
}
