//! Validation collaborator backed by JSON Schema documents
//!
//! One draft 2020-12 schema per extraction stage is compiled into the binary and
//! compiled into a validator once, at startup.

use autoparser_common::AutoparserError;
use serde_json::Value;
use std::collections::HashMap;

use super::Validator;
use crate::pipeline::stages::{ExtractionStage, StageTable};

/// Violations listed in one error description
const MAX_REPORTED_ERRORS: usize = 5;

fn embedded_schema(schema_key: &str) -> Option<&'static str> {
    match schema_key {
        "e1.json" => Some(include_str!("../../schemas/e1.json")),
        "e2.json" => Some(include_str!("../../schemas/e2.json")),
        "e3.json" => Some(include_str!("../../schemas/e3.json")),
        "e4.json" => Some(include_str!("../../schemas/e4.json")),
        "e5.json" => Some(include_str!("../../schemas/e5.json")),
        "e6.json" => Some(include_str!("../../schemas/e6.json")),
        "e7.json" => Some(include_str!("../../schemas/e7.json")),
        _ => None,
    }
}

pub struct SchemaValidator {
    validators: HashMap<ExtractionStage, jsonschema::Validator>,
}

impl SchemaValidator {
    /// Compile the built-in schema of every stage in the table
    pub fn embedded(table: &StageTable) -> Result<Self, AutoparserError> {
        let mut validators = HashMap::new();

        for entry in table.entries() {
            let text = embedded_schema(entry.schema_key).ok_or_else(|| {
                AutoparserError::Schema(format!(
                    "no schema '{}' for stage {}",
                    entry.schema_key, entry.stage
                ))
            })?;
            let schema: Value = serde_json::from_str(text)?;
            let validator = jsonschema::validator_for(&schema).map_err(|e| {
                AutoparserError::Schema(format!("schema '{}' does not compile: {}", entry.schema_key, e))
            })?;
            validators.insert(entry.stage, validator);
        }

        tracing::debug!(count = validators.len(), "Stage schemas compiled");
        Ok(Self { validators })
    }
}

impl Validator for SchemaValidator {
    fn validate(&self, stage: &str, output: &Value) -> Result<(), String> {
        let Some(validator) = stage
            .parse::<ExtractionStage>()
            .ok()
            .and_then(|s| self.validators.get(&s))
        else {
            return Ok(());
        };

        let errors: Vec<String> = validator
            .iter_errors(output)
            .take(MAX_REPORTED_ERRORS)
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> SchemaValidator {
        SchemaValidator::embedded(&StageTable::standard()).unwrap()
    }

    #[test]
    fn test_all_embedded_schemas_compile() {
        assert_eq!(validator().validators.len(), 7);
    }

    #[test]
    fn test_e1_requires_identifying_fields() {
        let validator = validator();
        assert!(validator
            .validate("E1", &json!({"msr_geocde": "16", "msr_prglvl": "REG", "msr_name": "Грант"}))
            .is_ok());

        let err = validator
            .validate("E1", &json!({"msr_geocde": "16"}))
            .unwrap_err();
        assert!(err.contains("msr_prglvl"));
    }

    #[test]
    fn test_e4_rejects_empty_segment() {
        let err = validator()
            .validate("E4", &json!({"msr_segmnt": "", "msr_typeid": "GRANT"}))
            .unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_unknown_stage_passes() {
        assert!(validator().validate("E9", &json!("anything")).is_ok());
        assert!(validator().validate("SAVE", &json!(null)).is_ok());
    }

    #[test]
    fn test_non_object_output_is_invalid() {
        assert!(validator().validate("E3", &json!([1, 2, 3])).is_err());
    }
}
