pub mod get_run;
pub mod get_step;
pub mod get_step_snapshot;
pub mod list_runs;
pub mod list_steps;

pub use get_run::{GetRunError, GetRunQuery};
pub use get_step::{GetStepError, GetStepQuery};
pub use get_step_snapshot::{GetStepSnapshotError, GetStepSnapshotQuery, StepSnapshot};
pub use list_runs::{ListRunsError, ListRunsQuery, ListRunsResponse};
pub use list_steps::{ListStepsError, ListStepsQuery, ListStepsResponse};
