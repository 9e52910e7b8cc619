//! Support-measure extraction pipeline
//!
//! # Overview
//!
//! A run discovers candidate pages for a region and pushes each one through a
//! fixed stage sequence:
//!
//! ```text
//! SEARCH (once)
//!   └─ per URL: FETCH → CLEAN → E1 … E7 → BUILD_ID → SAVE
//! ```
//!
//! - [`ledger`]: run lifecycle and counters
//! - [`recorder`]: one step row per stage attempt
//! - [`gate`]: classifies extraction output as ok, invalid or error
//! - [`identifier`]: composite identifier allocation
//! - [`merger`]: folds stage outputs into the stored card
//! - [`executor`]: drives the sequence for one run
//! - [`mode`]: synchronous or queued execution behind one contract
//! - [`worker`]: claims and executes queued runs
//!
//! # Example
//!
//! ```rust,ignore
//! let pipeline = Pipeline::new(store, collaborators, PipelineSettings::default())?;
//! let mode = pipeline.mode(ExecutionModeKind::Sync, CancellationToken::new());
//! let result = mode.run_pipeline("Татарстан").await?;
//! ```

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{Extractor, Fetcher, SearchProvider, Validator};
use crate::store::{Store, StoreError};

pub mod executor;
pub mod gate;
pub mod identifier;
pub mod ledger;
pub mod merger;
pub mod mode;
pub mod recorder;
pub mod stages;
pub mod variables;
pub mod worker;

pub use executor::{ExecutorSettings, SourceOutcome, StageExecutor};
pub use identifier::{IdentifierAllocator, IdentifierScheme};
pub use ledger::{LedgerError, RunLedger};
pub use mode::{ExecutionMode, ExecutionModeKind, QueuedMode, RunResult, SyncMode};
pub use stages::{ExtractionStage, Stage, StageOutcome, StageTable};
pub use variables::{VariableBag, VariableDefaults};
pub use worker::{RunWorker, WorkerSettings};

/// Failure that ends a run with status `error`
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("invalid stage table: {0}")]
    StageTable(String),
}

/// External services a pipeline drives
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn Fetcher>,
    pub extractor: Arc<dyn Extractor>,
    pub validator: Arc<dyn Validator>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub executor: ExecutorSettings,
    pub defaults: VariableDefaults,
    pub scheme: IdentifierScheme,
}

/// Wired pipeline components sharing one store
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn Store>,
    ledger: RunLedger,
    executor: StageExecutor,
}

impl Pipeline {
    /// Verify the stage table and wire every component to `store`
    pub fn new(
        store: Arc<dyn Store>,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        let table = StageTable::standard();
        table.verify().map_err(PipelineError::StageTable)?;

        let ledger = RunLedger::new(store.clone());
        let executor = StageExecutor::new(store.clone(), collaborators, table, settings);

        Ok(Self {
            store,
            ledger,
            executor,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Strategy for triggering runs; chosen once at startup
    pub fn mode(&self, kind: ExecutionModeKind, cancel: CancellationToken) -> Arc<dyn ExecutionMode> {
        match kind {
            ExecutionModeKind::Sync => Arc::new(SyncMode::new(
                self.ledger.clone(),
                self.executor.clone(),
                cancel,
            )),
            ExecutionModeKind::Queued => Arc::new(QueuedMode::new(self.ledger.clone())),
        }
    }

    pub fn worker(&self, settings: WorkerSettings) -> RunWorker {
        RunWorker::new(self.ledger.clone(), self.executor.clone(), settings)
    }
}
