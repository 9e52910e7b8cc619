//! Contracts for the external services the pipeline drives
//!
//! The executor only sees these traits. HTTP-backed implementations live in the
//! submodules; tests substitute scripted ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::stages::ExtractionStage;
use crate::pipeline::variables::VariableBag;

pub mod extract;
pub mod fetch;
pub mod search;
pub mod validate;

pub use extract::HttpExtractor;
pub use fetch::HttpFetcher;
pub use search::HttpSearch;
pub use validate::SchemaValidator;

/// Failure of a collaborator call; always recorded as a step `error`
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("unusable response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

/// A candidate source page returned by search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub is_official: bool,
}

/// Page content as captured by the fetch collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub http_status: u16,
    pub raw_content: String,
    pub clean_text: String,
    pub content_hash: String,
    pub charset: Option<String>,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        self.http_status < 400
    }
}

/// Region token to candidate URLs, best first
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        region: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, CollaboratorError>;
}

/// URL to page content
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, CollaboratorError>;
}

/// One structured-extraction pass over the variable bag
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        stage: ExtractionStage,
        prompt_key: &str,
        variables: &VariableBag,
    ) -> Result<Value, CollaboratorError>;
}

/// Schema check of one stage output
///
/// Unknown stage names pass; the error string describes the first violations.
pub trait Validator: Send + Sync {
    fn validate(&self, stage: &str, output: &Value) -> Result<(), String>;
}
