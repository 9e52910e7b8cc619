//! Variable bag handed to every extraction stage

use autoparser_common::AutoparserError;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Name → value map rendered into the stage prompt by the extraction collaborator
pub type VariableBag = Map<String, Value>;

/// Tatarstan in the two-digit region numbering used by measure identifiers
pub const DEFAULT_REGION_CODE: &str = "16";
pub const DEFAULT_PROGRAM_LEVEL: &str = "REG";

/// Region-wide defaults that seed every variable bag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDefaults {
    pub region_code: String,
    pub program_level: String,
    /// Region code → human-readable region name
    pub geo_directory: BTreeMap<String, String>,
}

impl Default for VariableDefaults {
    fn default() -> Self {
        Self {
            region_code: DEFAULT_REGION_CODE.to_string(),
            program_level: DEFAULT_PROGRAM_LEVEL.to_string(),
            geo_directory: default_geo_directory(),
        }
    }
}

pub fn default_geo_directory() -> BTreeMap<String, String> {
    BTreeMap::from([(DEFAULT_REGION_CODE.to_string(), "Республика Татарстан".to_string())])
}

/// Read a `{"<code>": "<name>"}` JSON file
pub fn load_geo_directory(path: &Path) -> Result<BTreeMap<String, String>, AutoparserError> {
    let text = std::fs::read_to_string(path)?;
    let directory: BTreeMap<String, String> = serde_json::from_str(&text)?;
    if directory.is_empty() {
        return Err(AutoparserError::Config(format!(
            "geo directory {} is empty",
            path.display()
        )));
    }
    Ok(directory)
}

impl VariableDefaults {
    pub fn region_name(&self) -> &str {
        self.geo_directory
            .get(&self.region_code)
            .map(String::as_str)
            .unwrap_or("Регион")
    }

    /// Bag for one source of a run triggered for `region`
    pub fn bag(&self, region: &str, url: &str, source_text: &str, today: NaiveDate) -> VariableBag {
        let mut bag = VariableBag::new();
        bag.insert("TODAY".into(), today.format("%d.%m.%Y").to_string().into());
        bag.insert("REGION".into(), region.into());
        bag.insert("msr_geocde".into(), self.region_code.clone().into());
        bag.insert("msr_geonme".into(), self.region_name().into());
        bag.insert("msr_prglvl".into(), self.program_level.clone().into());
        bag.insert("msr_srclnk".into(), url.into());
        bag.insert("SOURCE_TEXT".into(), source_text.into());
        bag
    }
}
