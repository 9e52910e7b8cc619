//! Common test utilities for autoparser integration tests
//!
//! Scripted collaborators let pipeline scenarios run against [`MemoryStore`]
//! without any network access. [`TestPostgres`] spins up a PostgreSQL container
//! for the storage tests that need the real backend.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::Harness;
//!
//! #[tokio::test]
//! async fn test_scenario() {
//!     let harness = Harness::new(&["https://mert.tatarstan.ru/grant"]);
//!     let run = harness.run_sync("Татарстан").await;
//!     assert_eq!(run.ok, 1);
//! }
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use autoparser_common::checksum::content_hash;
use autoparser_server::collaborators::{
    CollaboratorError, Extractor, FetchedPage, Fetcher, SchemaValidator, SearchHit,
    SearchProvider,
};
use autoparser_server::models::Run;
use autoparser_server::pipeline::{
    ExecutionModeKind, ExtractionStage, PipelineSettings, RunResult, StageTable, VariableBag,
};
use autoparser_server::store::{MemoryStore, Store};
use autoparser_server::{Collaborators, Pipeline};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted collaborators
// ============================================================================

/// Returns a fixed hit list, or fails
pub struct ScriptedSearch {
    hits: Vec<SearchHit>,
    failure: Option<String>,
}

impl ScriptedSearch {
    pub fn new(urls: &[&str]) -> Self {
        Self {
            hits: urls
                .iter()
                .map(|url| SearchHit {
                    url: url.to_string(),
                    is_official: true,
                })
                .collect(),
            failure: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            hits: Vec::new(),
            failure: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    async fn search(
        &self,
        _region: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, CollaboratorError> {
        match self.failure {
            Some(ref message) => Err(CollaboratorError::Other(message.clone())),
            None => Ok(self.hits.iter().take(max_results).cloned().collect()),
        }
    }
}

pub fn page(status: u16, text: &str) -> FetchedPage {
    let raw = format!("<html><body><p>{}</p></body></html>", text);
    FetchedPage {
        http_status: status,
        content_hash: content_hash(&raw),
        raw_content: raw,
        clean_text: text.to_string(),
        charset: Some("utf-8".to_string()),
    }
}

/// A PDF served as text, with the NUL bytes binary content carries
pub fn pdf_page(text: &str) -> FetchedPage {
    let raw = format!("%PDF-1.4\0\0\n1 0 obj\n({})\nendobj", text);
    FetchedPage {
        http_status: 200,
        content_hash: content_hash(&raw),
        raw_content: raw,
        clean_text: format!("{}\0", text),
        charset: None,
    }
}

/// Serves a grant page for every URL unless told otherwise
#[derive(Default)]
pub struct ScriptedFetcher {
    pages: Mutex<HashMap<String, Result<FetchedPage, String>>>,
    /// Cancelled by the first fetch, so only the first source runs
    cancel_after_first: Mutex<Option<CancellationToken>>,
}

impl ScriptedFetcher {
    pub fn set(&self, url: &str, page: Result<FetchedPage, String>) {
        self.pages.lock().unwrap().insert(url.to_string(), page);
    }

    pub fn cancel_after_first(&self, token: CancellationToken) {
        *self.cancel_after_first.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, CollaboratorError> {
        if let Some(token) = self.cancel_after_first.lock().unwrap().take() {
            token.cancel();
        }

        match self.pages.lock().unwrap().get(url) {
            Some(Ok(page)) => Ok(page.clone()),
            Some(Err(message)) => Err(CollaboratorError::Other(message.clone())),
            None => Ok(page(
                200,
                "Грант для субъектов малого и среднего предпринимательства Республики Татарстан",
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Output(Value),
    Fail(String),
    Panic(String),
}

/// Default output of each stage for the Tatarstan grant page
pub fn default_output(stage: ExtractionStage) -> Value {
    match stage {
        ExtractionStage::E1 => json!({
            "msr_geocde": "16",
            "msr_prglvl": "REG",
            "msr_name": "Грант начинающим предпринимателям",
        }),
        ExtractionStage::E2 => json!({ "msr_amount_max": 500000, "msr_currency": "RUB" }),
        ExtractionStage::E3 => json!({ "msr_deadline": "2025-12-01", "msr_documents": ["заявление"] }),
        ExtractionStage::E4 => json!({ "msr_segmnt": "MSP", "msr_typeid": "GRANT" }),
        ExtractionStage::E5 => json!({ "msr_applicant_types": ["ИП", "ООО"] }),
        ExtractionStage::E6 => json!({ "msr_score": 7.5 }),
        ExtractionStage::E7 => json!({ "msr_summary": "Грант до 500 тыс. рублей" }),
    }
}

/// Replies per (source URL, stage), falling back to [`default_output`]
#[derive(Default)]
pub struct ScriptedExtractor {
    replies: Mutex<HashMap<(String, ExtractionStage), Reply>>,
    calls: Mutex<Vec<(String, ExtractionStage)>>,
}

impl ScriptedExtractor {
    pub fn set(&self, url: &str, stage: ExtractionStage, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert((url.to_string(), stage), reply);
    }

    pub fn calls(&self) -> Vec<(String, ExtractionStage)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        stage: ExtractionStage,
        _prompt_key: &str,
        variables: &VariableBag,
    ) -> Result<Value, CollaboratorError> {
        let url = variables
            .get("msr_srclnk")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.calls.lock().unwrap().push((url.clone(), stage));

        let reply = self.replies.lock().unwrap().get(&(url, stage)).cloned();
        match reply {
            None => Ok(default_output(stage)),
            Some(Reply::Output(value)) => Ok(value),
            Some(Reply::Fail(message)) => Err(CollaboratorError::Other(message)),
            Some(Reply::Panic(message)) => panic!("{}", message),
        }
    }
}

// ============================================================================
// Pipeline harness
// ============================================================================

/// Pipeline over an in-memory store with scripted collaborators
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub extractor: Arc<ScriptedExtractor>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub fn new(urls: &[&str]) -> Self {
        Self::with_search(ScriptedSearch::new(urls), PipelineSettings::default())
    }

    pub fn with_search(search: ScriptedSearch, settings: PipelineSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_store(store, search, settings)
    }

    /// Share `store` with another harness, e.g. to run twice against one database
    pub fn with_store(
        store: Arc<MemoryStore>,
        search: ScriptedSearch,
        settings: PipelineSettings,
    ) -> Self {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let extractor = Arc::new(ScriptedExtractor::default());
        let validator = SchemaValidator::embedded(&StageTable::standard()).unwrap();

        let collaborators = Collaborators {
            search: Arc::new(search),
            fetcher: fetcher.clone(),
            extractor: extractor.clone(),
            validator: Arc::new(validator),
        };
        let dyn_store: Arc<dyn Store> = store.clone();
        let pipeline = Pipeline::new(dyn_store, collaborators, settings).unwrap();

        Self {
            store,
            fetcher,
            extractor,
            pipeline,
        }
    }

    /// Trigger in sync mode and return the terminal run
    pub async fn run_sync(&self, region: &str) -> Run {
        self.run_sync_with(region, CancellationToken::new()).await
    }

    pub async fn run_sync_with(&self, region: &str, cancel: CancellationToken) -> Run {
        let mode = self.pipeline.mode(ExecutionModeKind::Sync, cancel);
        match mode.run_pipeline(region).await.unwrap() {
            RunResult::Completed(run) => run,
            other => panic!("sync mode returned {:?}", other),
        }
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL test container with migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }
}

/// Initialize tracing for test debugging
///
/// Safe to call more than once.
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,autoparser_server=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
