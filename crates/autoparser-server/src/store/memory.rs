//! In-process store for tests and dry runs
//!
//! All state sits behind one mutex, which makes every operation atomic and
//! serializes identifier allocation the same way the row lock does in Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{scrub, Store, StoreError, StoreResult};
use crate::models::{
    Allocation, Measure, NewMeasure, NewSnapshot, NewSource, Run, RunCounter, RunStatus,
    Snapshot, Source, Step, StepStatus,
};
use crate::pipeline::identifier::{format_intlid, sequence_after};
use crate::pipeline::stages::Stage;

#[derive(Default)]
struct State {
    runs: HashMap<Uuid, Run>,
    /// Insertion order, used for listings
    run_order: Vec<Uuid>,
    steps: Vec<Step>,
    sources: HashMap<Uuid, Source>,
    snapshots: HashMap<Uuid, Snapshot>,
    measures: BTreeMap<String, Measure>,
    sequences: HashMap<String, i64>,
    /// (prefix, source) -> (intlid, sequence)
    assignments: HashMap<(String, Uuid), (String, i64)>,
}

impl State {
    /// Unfinished run, with its heartbeat bumped
    fn live_run(&mut self, run_id: Uuid) -> StoreResult<&mut Run> {
        let run = self
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::not_found("run", run_id))?;
        if run.is_finished() {
            return Err(StoreError::RunFinished(run_id));
        }
        run.heartbeat_at = Utc::now();
        Ok(run)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Mutations are single writes, so a poisoned lock still guards consistent state
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of measures currently stored
    pub fn measure_count(&self) -> usize {
        self.state().measures.len()
    }

    /// Every stored measure, ordered by identifier
    pub fn measures(&self) -> Vec<Measure> {
        self.state().measures.values().cloned().collect()
    }

    /// Every source, ordered by URL
    pub fn sources(&self) -> Vec<Source> {
        let mut sources: Vec<_> = self.state().sources.values().cloned().collect();
        sources.sort_by(|a, b| a.url.cmp(&b.url));
        sources
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_run(&self, region: &str, status: RunStatus) -> StoreResult<Run> {
        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4(),
            region: scrub::text(region).into_owned(),
            status,
            started_at: now,
            finished_at: None,
            found: 0,
            processed: 0,
            ok: 0,
            errors: 0,
            error_message: None,
            claimed_by: None,
            heartbeat_at: now,
        };

        let mut state = self.state();
        state.run_order.push(run.id);
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn claim_queued_run(&self, worker: &str) -> StoreResult<Option<Run>> {
        let mut state = self.state();
        let next = state
            .run_order
            .iter()
            .copied()
            .find(|id| state.runs.get(id).is_some_and(|r| r.status == RunStatus::Queued));

        let Some(id) = next else {
            return Ok(None);
        };
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("run", id))?;
        let now = Utc::now();
        run.status = RunStatus::Running;
        run.started_at = now;
        run.heartbeat_at = now;
        run.claimed_by = Some(scrub::text(worker).into_owned());
        Ok(Some(run.clone()))
    }

    async fn increment_run_counter(
        &self,
        run_id: Uuid,
        counter: RunCounter,
        by: i64,
    ) -> StoreResult<Run> {
        let mut state = self.state();
        let run = state.live_run(run_id)?;
        match counter {
            RunCounter::Found => run.found += by,
            RunCounter::Processed => run.processed += by,
            RunCounter::Ok => run.ok += by,
            RunCounter::Errors => run.errors += by,
        }
        Ok(run.clone())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> StoreResult<Run> {
        let mut state = self.state();
        let run = state.live_run(run_id)?;
        run.status = status;
        run.finished_at = Some(Utc::now());
        run.error_message = scrub::opt_text(error_message).map(Cow::into_owned);
        Ok(run.clone())
    }

    async fn fail_stale_runs(
        &self,
        silent_since: DateTime<Utc>,
        error_message: &str,
    ) -> StoreResult<Vec<Uuid>> {
        let error_message = scrub::text(error_message);
        let mut state = self.state();
        let now = Utc::now();
        let mut failed = Vec::new();
        for run in state.runs.values_mut() {
            if run.status == RunStatus::Running
                && run.finished_at.is_none()
                && run.heartbeat_at < silent_since
            {
                run.status = RunStatus::Error;
                run.finished_at = Some(now);
                run.error_message = Some(error_message.to_string());
                failed.push(run.id);
            }
        }
        Ok(failed)
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<Option<Run>> {
        Ok(self.state().runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, limit: i64) -> StoreResult<Vec<Run>> {
        let state = self.state();
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state
            .run_order
            .iter()
            .rev()
            .filter_map(|id| state.runs.get(id).cloned())
            .take(limit)
            .collect())
    }

    async fn open_step(
        &self,
        run_id: Uuid,
        stage: Stage,
        source_id: Option<Uuid>,
    ) -> StoreResult<Step> {
        let mut state = self.state();
        state.live_run(run_id)?;

        let step = Step {
            id: Uuid::new_v4(),
            run_id,
            source_id,
            stage,
            status: StepStatus::Running,
            payload: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        state.steps.push(step.clone());
        Ok(step)
    }

    async fn close_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        payload: Value,
    ) -> StoreResult<Step> {
        if status == StepStatus::Running {
            return Err(StoreError::Corrupt(format!(
                "step {} cannot be closed as running",
                step_id
            )));
        }

        let payload = scrub::json(&payload).into_owned();

        let mut state = self.state();
        let step = state
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| StoreError::not_found("step", step_id))?;
        if !step.is_open() {
            return Err(StoreError::StepClosed(step_id));
        }
        step.status = status;
        step.payload = Some(payload);
        step.finished_at = Some(Utc::now());
        let closed = step.clone();

        if let Some(run) = state.runs.get_mut(&closed.run_id) {
            if !run.is_finished() {
                run.heartbeat_at = Utc::now();
            }
        }
        Ok(closed)
    }

    async fn list_steps(&self, run_id: Uuid) -> StoreResult<Vec<Step>> {
        Ok(self
            .state()
            .steps
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_step(&self, run_id: Uuid, step_id: Uuid) -> StoreResult<Option<Step>> {
        Ok(self
            .state()
            .steps
            .iter()
            .find(|s| s.run_id == run_id && s.id == step_id)
            .cloned())
    }

    async fn resolve_source(&self, source: &NewSource) -> StoreResult<Source> {
        let url = scrub::text(&source.url);
        let mut state = self.state();
        if let Some(existing) = state.sources.values().find(|s| s.url == url) {
            return Ok(existing.clone());
        }

        let created = Source {
            id: Uuid::new_v4(),
            url: url.into_owned(),
            domain: scrub::opt_text(source.domain.as_deref()).map(Cow::into_owned),
            region_code: scrub::opt_text(source.region_code.as_deref()).map(Cow::into_owned),
            is_official: source.is_official,
            first_seen_at: Utc::now(),
            last_checked_at: None,
            status: "new".to_string(),
        };
        state.sources.insert(created.id, created.clone());
        Ok(created)
    }

    async fn touch_source(&self, source_id: Uuid, status: &str) -> StoreResult<()> {
        let mut state = self.state();
        let source = state
            .sources
            .get_mut(&source_id)
            .ok_or_else(|| StoreError::not_found("source", source_id))?;
        source.last_checked_at = Some(Utc::now());
        source.status = scrub::text(status).into_owned();
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &NewSnapshot) -> StoreResult<Snapshot> {
        let mut state = self.state();
        if !state.sources.contains_key(&snapshot.source_id) {
            return Err(StoreError::not_found("source", snapshot.source_id));
        }

        let stored = Snapshot {
            id: Uuid::new_v4(),
            source_id: snapshot.source_id,
            content_hash: snapshot.content_hash.clone(),
            stored_at: Utc::now(),
            raw_content: scrub::text(&snapshot.raw_content).into_owned(),
            clean_text: scrub::text(&snapshot.clean_text).into_owned(),
            http_status: snapshot.http_status,
            charset: scrub::opt_text(snapshot.charset.as_deref()).map(Cow::into_owned),
        };
        state.snapshots.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_snapshot(&self, snapshot_id: Uuid) -> StoreResult<Option<Snapshot>> {
        Ok(self.state().snapshots.get(&snapshot_id).cloned())
    }

    async fn allocate_intlid(
        &self,
        prefix: &str,
        source_id: Uuid,
        width: usize,
    ) -> StoreResult<Allocation> {
        let mut state = self.state();
        let key = (prefix.to_string(), source_id);

        if let Some((intlid, sequence)) = state.assignments.get(&key) {
            return Ok(Allocation {
                intlid: intlid.clone(),
                sequence: *sequence,
                reused: true,
            });
        }

        let last_seq = state.sequences.get(prefix).copied().unwrap_or(0);
        let sequence = sequence_after(prefix, last_seq, state.measures.keys().map(String::as_str));
        let intlid = format_intlid(prefix, sequence, width);

        state.sequences.insert(prefix.to_string(), sequence);
        state.assignments.insert(key, (intlid.clone(), sequence));

        Ok(Allocation {
            intlid,
            sequence,
            reused: false,
        })
    }

    async fn upsert_measure(&self, measure: &NewMeasure) -> StoreResult<Measure> {
        let stored = Measure {
            intlid: scrub::text(&measure.intlid).into_owned(),
            card: scrub::json(&measure.card).into_owned(),
            region_code: scrub::text(&measure.region_code).into_owned(),
            prglvl: scrub::text(&measure.prglvl).into_owned(),
            segmnt: scrub::text(&measure.segmnt).into_owned(),
            typeid: scrub::text(&measure.typeid).into_owned(),
            source_id: measure.source_id,
            checked_at: Utc::now(),
        };
        self.state()
            .measures
            .insert(stored.intlid.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_measure(&self, intlid: &str) -> StoreResult<Option<Measure>> {
        Ok(self.state().measures.get(intlid).cloned())
    }
}
