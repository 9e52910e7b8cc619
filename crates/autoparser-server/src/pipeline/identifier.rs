//! Composite identifier allocation
//!
//! A measure is identified by `<geo>_<level>_<segment>_<type>_<NNN>`. The first four
//! parts come from the two identifying extraction stages; the numeric suffix is
//! allocated by the store, serialized per prefix.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::Allocation;
use crate::pipeline::stages::ExtractionStage;
use crate::store::{scrub, Store, StoreError};

/// Default zero-pad width of the numeric suffix
pub const DEFAULT_SUFFIX_WIDTH: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// An identifying stage did not succeed or lacks a facet field
    #[error("identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("failed to allocate identifier: {0}")]
    Store(#[from] StoreError),
}

/// Where one facet is read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetField {
    pub stage: ExtractionStage,
    pub field: String,
}

impl FacetField {
    fn new(stage: ExtractionStage, field: &str) -> Self {
        Self {
            stage,
            field: field.to_string(),
        }
    }
}

/// Which stage outputs and fields make up the identifier prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierScheme {
    pub geocode: FacetField,
    pub level: FacetField,
    pub segment: FacetField,
    pub type_id: FacetField,
    pub width: usize,
}

impl Default for IdentifierScheme {
    fn default() -> Self {
        Self {
            geocode: FacetField::new(ExtractionStage::E1, "msr_geocde"),
            level: FacetField::new(ExtractionStage::E1, "msr_prglvl"),
            segment: FacetField::new(ExtractionStage::E4, "msr_segmnt"),
            type_id: FacetField::new(ExtractionStage::E4, "msr_typeid"),
            width: DEFAULT_SUFFIX_WIDTH,
        }
    }
}

impl IdentifierScheme {
    /// Stages whose successful output is required to build an identifier
    pub fn identifying_stages(&self) -> Vec<ExtractionStage> {
        let mut stages = vec![
            self.geocode.stage,
            self.level.stage,
            self.segment.stage,
            self.type_id.stage,
        ];
        stages.sort();
        stages.dedup();
        stages
    }

    /// Read the four facets from the successful stage outputs
    pub fn facets(
        &self,
        outputs: &[(ExtractionStage, &Map<String, Value>)],
    ) -> Result<IdentityFacets, AllocationError> {
        let read = |facet: &FacetField| -> Result<String, AllocationError> {
            let (_, output) = outputs
                .iter()
                .find(|(stage, _)| *stage == facet.stage)
                .ok_or_else(|| {
                    AllocationError::IdentityUnavailable(format!(
                        "stage {} produced no usable output",
                        facet.stage
                    ))
                })?;

            facet_value(output.get(&facet.field)).ok_or_else(|| {
                AllocationError::IdentityUnavailable(format!(
                    "{}.{} is missing or empty",
                    facet.stage, facet.field
                ))
            })
        };

        Ok(IdentityFacets {
            geocode: read(&self.geocode)?,
            level: read(&self.level)?,
            segment: read(&self.segment)?,
            type_id: read(&self.type_id)?,
        })
    }
}

/// Facet values are trimmed strings or integers; anything else is absent
fn facet_value(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => scrub::text(s).trim().to_string(),
        Value::Number(n) if n.is_i64() || n.is_u64() => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// The identifying values of one measure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFacets {
    pub geocode: String,
    pub level: String,
    pub segment: String,
    pub type_id: String,
}

impl IdentityFacets {
    pub fn prefix(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.geocode, self.level, self.segment, self.type_id
        )
    }
}

/// Numeric suffix of `intlid` if it is `<prefix>_<digits>`
pub fn parse_suffix(prefix: &str, intlid: &str) -> Option<i64> {
    let digits = intlid.strip_prefix(prefix)?.strip_prefix('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn format_intlid(prefix: &str, sequence: i64, width: usize) -> String {
    format!("{}_{:0width$}", prefix, sequence, width = width)
}

/// Next sequence after the counter and every identifier already issued
pub fn sequence_after<'a>(
    prefix: &str,
    last_seq: i64,
    existing: impl IntoIterator<Item = &'a str>,
) -> i64 {
    existing
        .into_iter()
        .filter_map(|intlid| parse_suffix(prefix, intlid))
        .fold(last_seq, i64::max)
        + 1
}

/// Turns identifying stage outputs into a reserved identifier
#[derive(Clone)]
pub struct IdentifierAllocator {
    store: Arc<dyn Store>,
    scheme: IdentifierScheme,
}

impl IdentifierAllocator {
    pub fn new(store: Arc<dyn Store>, scheme: IdentifierScheme) -> Self {
        Self { store, scheme }
    }

    pub fn scheme(&self) -> &IdentifierScheme {
        &self.scheme
    }

    pub async fn allocate(
        &self,
        facets: &IdentityFacets,
        source_id: Uuid,
    ) -> Result<Allocation, AllocationError> {
        let allocation = self
            .store
            .allocate_intlid(&facets.prefix(), source_id, self.scheme.width)
            .await?;

        tracing::debug!(
            intlid = %allocation.intlid,
            reused = allocation.reused,
            %source_id,
            "Identifier allocated"
        );

        Ok(allocation)
    }
}
