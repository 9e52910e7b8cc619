//! Persisted records of the extraction pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::pipeline::stages::Stage;

// ============================================================================
// Runs
// ============================================================================

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "done" => Ok(RunStatus::Done),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// One pipeline execution for a region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub region: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub found: i64,
    pub processed: i64,
    pub ok: i64,
    pub errors: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// Last write made on behalf of the run; the stale reaper keys on it
    pub heartbeat_at: DateTime<Utc>,
}

impl Run {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn counter(&self, counter: RunCounter) -> i64 {
        match counter {
            RunCounter::Found => self.found,
            RunCounter::Processed => self.processed,
            RunCounter::Ok => self.ok,
            RunCounter::Errors => self.errors,
        }
    }
}

/// Aggregate counters kept on a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCounter {
    Found,
    Processed,
    Ok,
    Errors,
}

impl RunCounter {
    /// Column holding this counter in the `runs` table
    pub fn column(&self) -> &'static str {
        match self {
            RunCounter::Found => "found",
            RunCounter::Processed => "processed",
            RunCounter::Ok => "ok",
            RunCounter::Errors => "errors",
        }
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Status of a single stage attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Ok,
    Invalid,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Ok => "ok",
            StepStatus::Invalid => "invalid",
            StepStatus::Error => "error",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StepStatus::Running),
            "ok" => Ok(StepStatus::Ok),
            "invalid" => Ok(StepStatus::Invalid),
            "error" => Ok(StepStatus::Error),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// Audit record of one stage attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source_id: Option<Uuid>,
    pub stage: Stage,
    pub status: StepStatus,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// Step as shown in a run history listing, without its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub id: Uuid,
    pub stage: Stage,
    pub status: StepStatus,
    /// `error` for a step left open by a run that has already finished
    pub effective_status: StepStatus,
    pub is_open: bool,
    pub source_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepSummary {
    pub fn from_step(step: &Step, run_finished: bool) -> Self {
        let is_open = step.is_open();
        let effective_status = if is_open && run_finished {
            StepStatus::Error
        } else {
            step.status
        };

        Self {
            id: step.id,
            stage: step.stage,
            status: step.status,
            effective_status,
            is_open,
            source_id: step.source_id,
            created_at: step.created_at,
            finished_at: step.finished_at,
        }
    }

    /// Opened but never closed, and nothing will close it any more
    pub fn is_crashed(&self) -> bool {
        self.is_open && self.effective_status == StepStatus::Error
    }
}

// ============================================================================
// Sources and snapshots
// ============================================================================

/// A discovered page, shared across runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub url: String,
    pub domain: Option<String>,
    pub region_code: Option<String>,
    pub is_official: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub status: String,
}

/// Source fields known at discovery time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSource {
    pub url: String,
    pub domain: Option<String>,
    pub region_code: Option<String>,
    pub is_official: bool,
}

impl NewSource {
    pub fn new(url: impl Into<String>, region_code: Option<String>, is_official: bool) -> Self {
        let url = url.into();
        let domain = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase));

        Self {
            url,
            domain,
            region_code,
            is_official,
        }
    }
}

/// Content captured by one fetch attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub source_id: Uuid,
    pub content_hash: String,
    pub stored_at: DateTime<Utc>,
    pub raw_content: String,
    pub clean_text: String,
    pub http_status: Option<i32>,
    pub charset: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
    pub source_id: Uuid,
    pub content_hash: String,
    pub raw_content: String,
    pub clean_text: String,
    pub http_status: Option<i32>,
    pub charset: Option<String>,
}

// ============================================================================
// Measures
// ============================================================================

/// Durable merged record keyed by its composite identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub intlid: String,
    pub card: Value,
    pub region_code: String,
    pub prglvl: String,
    pub segmnt: String,
    pub typeid: String,
    pub source_id: Option<Uuid>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMeasure {
    pub intlid: String,
    pub card: Value,
    pub region_code: String,
    pub prglvl: String,
    pub segmnt: String,
    pub typeid: String,
    pub source_id: Option<Uuid>,
}

/// Result of reserving an identifier for a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub intlid: String,
    pub sequence: i64,
    /// The source already held this identifier from an earlier run
    pub reused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(finished: bool) -> Step {
        Step {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            source_id: None,
            stage: Stage::Fetch,
            status: if finished { StepStatus::Ok } else { StepStatus::Running },
            payload: None,
            created_at: Utc::now(),
            finished_at: finished.then(Utc::now),
        }
    }

    #[test]
    fn test_run_status_round_trip() {
        for status in [RunStatus::Queued, RunStatus::Running, RunStatus::Done, RunStatus::Error] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<RunStatus>().is_err());
        assert!(RunStatus::Done.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
    }

    #[test]
    fn test_open_step_of_finished_run_reports_error() {
        let open = step(false);

        let live = StepSummary::from_step(&open, false);
        assert!(live.is_open);
        assert_eq!(live.effective_status, StepStatus::Running);
        assert!(!live.is_crashed());

        let crashed = StepSummary::from_step(&open, true);
        assert_eq!(crashed.status, StepStatus::Running);
        assert_eq!(crashed.effective_status, StepStatus::Error);
        assert!(crashed.is_crashed());

        let closed = StepSummary::from_step(&step(true), true);
        assert_eq!(closed.effective_status, StepStatus::Ok);
        assert!(!closed.is_open);
    }

    #[test]
    fn test_new_source_extracts_domain() {
        let source = NewSource::new("https://MSP.Tatarstan.ru/grants/", Some("16".into()), true);
        assert_eq!(source.domain.as_deref(), Some("msp.tatarstan.ru"));

        let source = NewSource::new("not a url", None, false);
        assert!(source.domain.is_none());
    }
}
