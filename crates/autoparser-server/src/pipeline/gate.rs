//! Classification of extraction results into tagged stage outcomes

use serde_json::Value;
use std::sync::Arc;

use crate::collaborators::{CollaboratorError, Validator};
use crate::pipeline::stages::{ExtractionStage, StageOutcome};

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Clone)]
pub struct ValidationGate {
    validator: Arc<dyn Validator>,
}

impl ValidationGate {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self { validator }
    }

    /// `Ok` only for a JSON object that passes the stage schema
    pub fn classify(
        &self,
        stage: ExtractionStage,
        result: Result<Value, CollaboratorError>,
    ) -> StageOutcome {
        let output = match result {
            Ok(output) => output,
            Err(e) => return StageOutcome::Error(e.to_string()),
        };

        if !output.is_object() {
            return StageOutcome::Error(format!(
                "unusable output: expected a JSON object, got {}",
                json_kind(&output)
            ));
        }

        if let Err(reason) = self.validator.validate(stage.as_str(), &output) {
            return StageOutcome::Invalid { reason, raw: output };
        }

        match output {
            Value::Object(map) => StageOutcome::Ok(map),
            _ => StageOutcome::Error("unusable output".into()),
        }
    }
}
