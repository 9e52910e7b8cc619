//! Drives the fixed stage sequence for one run
//!
//! Collaborator failures only close the current step as `error`; the run moves on
//! to the next stage or source. Storage failures while recording are fatal and
//! end the run. Whatever happens inside, including a panic, the run reaches
//! [`RunLedger::finish_run`] before [`StageExecutor::execute`] returns.

use chrono::Utc;
use futures::{stream, FutureExt, TryStreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::gate::ValidationGate;
use super::identifier::IdentifierAllocator;
use super::ledger::RunLedger;
use super::merger::{MergeInput, RecordMerger};
use super::recorder::StepRecorder;
use super::stages::{ExtractionStage, Stage, StageOutcome, StageTable};
use super::variables::VariableDefaults;
use super::{Collaborators, PipelineError, PipelineSettings};
use crate::collaborators::{FetchedPage, SearchHit};
use crate::models::{NewSnapshot, NewSource, Run, RunCounter, RunStatus, Source, StepStatus};
use crate::store::Store;

/// Default cap on URLs taken from search
pub const DEFAULT_MAX_RESULTS: usize = 6;

/// Default number of sources processed at once within a run
pub const DEFAULT_SOURCE_CONCURRENCY: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub max_results: usize,
    pub source_concurrency: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            source_concurrency: DEFAULT_SOURCE_CONCURRENCY,
        }
    }
}

/// How processing of one source ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Saved { intlid: String },
    /// A stage failed and the source produced no measure
    Abandoned { stage: Stage, reason: String },
    /// The identifying stages did not yield all facets
    IdentityUnavailable { reason: String },
}

impl SourceOutcome {
    fn counter(&self) -> RunCounter {
        match self {
            SourceOutcome::Saved { .. } => RunCounter::Ok,
            SourceOutcome::Abandoned { .. } | SourceOutcome::IdentityUnavailable { .. } => {
                RunCounter::Errors
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Clone)]
pub struct StageExecutor {
    store: Arc<dyn Store>,
    ledger: RunLedger,
    recorder: StepRecorder,
    gate: ValidationGate,
    allocator: IdentifierAllocator,
    merger: RecordMerger,
    collaborators: Collaborators,
    table: StageTable,
    defaults: VariableDefaults,
    settings: ExecutorSettings,
}

impl StageExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        collaborators: Collaborators,
        table: StageTable,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger: RunLedger::new(store.clone()),
            recorder: StepRecorder::new(store.clone()),
            gate: ValidationGate::new(collaborators.validator.clone()),
            allocator: IdentifierAllocator::new(store.clone(), settings.scheme),
            merger: RecordMerger::new(store.clone()),
            store,
            collaborators,
            table,
            defaults: settings.defaults,
            settings: settings.executor,
        }
    }

    /// Execute a `running` run to completion and return it in its terminal state
    #[tracing::instrument(skip_all, fields(run_id = %run.id, region = %run.region))]
    pub async fn execute(&self, run: Run, cancel: CancellationToken) -> Result<Run, PipelineError> {
        let outcome = AssertUnwindSafe(self.drive(&run, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(&*payload))));

        let (status, message) = match outcome {
            Ok(()) => (RunStatus::Done, None),
            Err(e) => {
                tracing::error!(error = %e, "Run failed");
                (RunStatus::Error, Some(e.to_string()))
            },
        };

        Ok(self
            .ledger
            .finish_run(run.id, status, message.as_deref())
            .await?)
    }

    async fn drive(&self, run: &Run, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let Some(hits) = self.search(run).await? else {
            return Ok(());
        };

        stream::iter(hits.into_iter().map(Ok))
            .try_for_each_concurrent(self.settings.source_concurrency.max(1), move |hit| async move {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }

                let outcome = self.process_source(run, &hit).await?;
                tracing::info!(url = %hit.url, outcome = ?outcome, "Source processed");

                self.ledger.increment(run.id, outcome.counter()).await?;
                self.ledger.increment(run.id, RunCounter::Processed).await?;
                Ok(())
            })
            .await
    }

    /// `None` when search failed; the failure is already recorded
    async fn search(&self, run: &Run) -> Result<Option<Vec<SearchHit>>, PipelineError> {
        let step = self.recorder.open(run.id, Stage::Search, None).await?;

        match self
            .collaborators
            .search
            .search(&run.region, self.settings.max_results)
            .await
        {
            Ok(mut hits) => {
                hits.truncate(self.settings.max_results);
                let urls: Vec<&str> = hits.iter().map(|h| h.url.as_str()).collect();
                self.recorder
                    .close(step, StepStatus::Ok, json!({ "urls": urls }))
                    .await?;
                self.ledger
                    .increment_by(run.id, RunCounter::Found, hits.len() as i64)
                    .await?;
                Ok(Some(hits))
            },
            Err(e) => {
                self.recorder
                    .close(step, StepStatus::Error, json!({ "error": e.to_string() }))
                    .await?;
                self.ledger.increment(run.id, RunCounter::Errors).await?;
                Ok(None)
            },
        }
    }

    #[tracing::instrument(skip_all, fields(url = %hit.url))]
    async fn process_source(
        &self,
        run: &Run,
        hit: &SearchHit,
    ) -> Result<SourceOutcome, PipelineError> {
        let source = self
            .store
            .resolve_source(&NewSource::new(
                hit.url.clone(),
                Some(self.defaults.region_code.clone()),
                hit.is_official,
            ))
            .await?;

        let page = match self.fetch(run, &source).await? {
            Ok(page) => page,
            Err(reason) => {
                return Ok(SourceOutcome::Abandoned {
                    stage: Stage::Fetch,
                    reason,
                })
            },
        };

        let text = match self.clean(run, &source, &page).await? {
            Ok(text) => text,
            Err(reason) => {
                return Ok(SourceOutcome::Abandoned {
                    stage: Stage::Clean,
                    reason,
                })
            },
        };

        let outputs = self.extract_all(run, &source, &text).await?;
        self.build_and_save(run, &source, &outputs).await
    }

    /// Inner `Err` is a recorded fetch failure
    async fn fetch(
        &self,
        run: &Run,
        source: &Source,
    ) -> Result<Result<FetchedPage, String>, PipelineError> {
        let step = self.recorder.open(run.id, Stage::Fetch, Some(source.id)).await?;

        let page = match self.collaborators.fetcher.fetch(&source.url).await {
            Ok(page) => page,
            Err(e) => {
                let reason = e.to_string();
                self.store.touch_source(source.id, "failed").await?;
                self.recorder
                    .close(step, StepStatus::Error, json!({ "error": reason }))
                    .await?;
                return Ok(Err(reason));
            },
        };

        let snapshot = self
            .store
            .insert_snapshot(&NewSnapshot {
                source_id: source.id,
                content_hash: page.content_hash.clone(),
                raw_content: page.raw_content.clone(),
                clean_text: page.clean_text.clone(),
                http_status: Some(i32::from(page.http_status)),
                charset: page.charset.clone(),
            })
            .await?;

        let mut payload = json!({
            "snapshot_id": snapshot.id,
            "http_status": page.http_status,
            "content_hash": page.content_hash,
            "bytes": page.raw_content.len(),
        });

        if !page.is_success() {
            let reason = format!("unusable response: HTTP {}", page.http_status);
            payload["error"] = Value::String(reason.clone());
            self.store.touch_source(source.id, "failed").await?;
            self.recorder.close(step, StepStatus::Error, payload).await?;
            return Ok(Err(reason));
        }

        self.store.touch_source(source.id, "fetched").await?;
        self.recorder.close(step, StepStatus::Ok, payload).await?;
        Ok(Ok(page))
    }

    async fn clean(
        &self,
        run: &Run,
        source: &Source,
        page: &FetchedPage,
    ) -> Result<Result<String, String>, PipelineError> {
        let step = self.recorder.open(run.id, Stage::Clean, Some(source.id)).await?;
        let text = page.clean_text.trim();

        if text.is_empty() {
            let reason = "cleaned text is empty".to_string();
            self.recorder
                .close(step, StepStatus::Error, json!({ "chars": 0, "error": reason }))
                .await?;
            return Ok(Err(reason));
        }

        self.recorder
            .close(step, StepStatus::Ok, json!({ "chars": text.chars().count() }))
            .await?;
        Ok(Ok(text.to_string()))
    }

    /// Run every extraction stage in table order; returns the `ok` outputs
    async fn extract_all(
        &self,
        run: &Run,
        source: &Source,
        text: &str,
    ) -> Result<Vec<(ExtractionStage, Map<String, Value>)>, PipelineError> {
        let variables = self
            .defaults
            .bag(&run.region, &source.url, text, Utc::now().date_naive());
        let mut outputs = Vec::new();

        for entry in self.table.entries() {
            let step = self
                .recorder
                .open(run.id, Stage::Extract(entry.stage), Some(source.id))
                .await?;

            let result = self
                .collaborators
                .extractor
                .extract(entry.stage, entry.prompt_key, &variables)
                .await;
            let outcome = self.gate.classify(entry.stage, result);

            self.recorder
                .close(step, outcome.status(), outcome.payload())
                .await?;

            if let StageOutcome::Ok(output) = outcome {
                outputs.push((entry.stage, output));
            }
        }

        Ok(outputs)
    }

    async fn build_and_save(
        &self,
        run: &Run,
        source: &Source,
        outputs: &[(ExtractionStage, Map<String, Value>)],
    ) -> Result<SourceOutcome, PipelineError> {
        let refs: Vec<(ExtractionStage, &Map<String, Value>)> =
            outputs.iter().map(|(stage, output)| (*stage, output)).collect();

        let facets = match self.allocator.scheme().facets(&refs) {
            Ok(facets) => facets,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping identifier and save");
                return Ok(SourceOutcome::IdentityUnavailable {
                    reason: e.to_string(),
                });
            },
        };

        let step = self
            .recorder
            .open(run.id, Stage::BuildId, Some(source.id))
            .await?;
        let allocation = match self.allocator.allocate(&facets, source.id).await {
            Ok(allocation) => allocation,
            Err(e) => {
                let reason = e.to_string();
                self.recorder
                    .close(step, StepStatus::Error, json!({ "error": reason }))
                    .await?;
                return Ok(SourceOutcome::Abandoned {
                    stage: Stage::BuildId,
                    reason,
                });
            },
        };
        self.recorder
            .close(
                step,
                StepStatus::Ok,
                json!({
                    "msr_intlid": allocation.intlid,
                    "prefix": facets.prefix(),
                    "sequence": allocation.sequence,
                    "reused": allocation.reused,
                }),
            )
            .await?;

        let step = self.recorder.open(run.id, Stage::Save, Some(source.id)).await?;
        let merged = RecordMerger::merge(&MergeInput {
            intlid: &allocation.intlid,
            region: &run.region,
            source_url: &source.url,
            outputs,
        });

        match self
            .merger
            .save(&merged, &allocation.intlid, &facets, source.id)
            .await
        {
            Ok(_) => {
                self.recorder
                    .close(
                        step,
                        StepStatus::Ok,
                        json!({
                            "msr_intlid": allocation.intlid,
                            "contributions": merged.contributions,
                        }),
                    )
                    .await?;
                Ok(SourceOutcome::Saved {
                    intlid: allocation.intlid,
                })
            },
            Err(e) => {
                let reason = e.to_string();
                self.recorder
                    .close(
                        step,
                        StepStatus::Error,
                        json!({ "msr_intlid": allocation.intlid, "error": reason }),
                    )
                    .await?;
                Ok(SourceOutcome::Abandoned {
                    stage: Stage::Save,
                    reason,
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counters() {
        assert_eq!(
            SourceOutcome::Saved {
                intlid: "x_001".into()
            }
            .counter(),
            RunCounter::Ok
        );
        assert_eq!(
            SourceOutcome::IdentityUnavailable {
                reason: "E4 invalid".into()
            }
            .counter(),
            RunCounter::Errors
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(&*payload), "kaboom");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }
}
