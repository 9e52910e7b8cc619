//! Application-level error type for the control surface

use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::db::DbError;
use crate::features::measures::queries::{GetMeasureError, ListMeasuresForRunError};
use crate::features::runs::commands::StartRunError;
use crate::features::runs::queries::{
    GetRunError, GetStepError, GetStepSnapshotError, ListRunsError, ListStepsError,
};
use crate::pipeline::PipelineError;
use crate::store::StoreError;

pub type AppResult<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Autoparser error: {0}")]
    Autoparser(#[from] autoparser_common::AutoparserError),
}

impl AppError {
    /// Process exit code for the CLI
    ///
    /// `2` for caller mistakes (unknown ids, bad input), `1` for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::NotFound(_) | AppError::Validation(_) => 2,
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                1
            },
            AppError::Store(ref e) => {
                tracing::error!("Storage error: {:?}", e);
                1
            },
            AppError::Pipeline(_)
            | AppError::Collaborator(_)
            | AppError::Config(_)
            | AppError::Autoparser(_) => 1,
        }
    }
}

impl From<StartRunError> for AppError {
    fn from(err: StartRunError) -> Self {
        match err {
            StartRunError::EmptyRegion => AppError::Validation(err.to_string()),
            StartRunError::Pipeline(e) => AppError::Pipeline(e),
        }
    }
}

impl From<GetRunError> for AppError {
    fn from(err: GetRunError) -> Self {
        match err {
            GetRunError::NotFound => AppError::NotFound("run".to_string()),
            GetRunError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<ListRunsError> for AppError {
    fn from(err: ListRunsError) -> Self {
        match err {
            ListRunsError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<ListStepsError> for AppError {
    fn from(err: ListStepsError) -> Self {
        match err {
            ListStepsError::NotFound => AppError::NotFound("run".to_string()),
            ListStepsError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<GetStepError> for AppError {
    fn from(err: GetStepError) -> Self {
        match err {
            GetStepError::NotFound => AppError::NotFound("step".to_string()),
            GetStepError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<GetStepSnapshotError> for AppError {
    fn from(err: GetStepSnapshotError) -> Self {
        match err {
            GetStepSnapshotError::NotFound => AppError::NotFound("step".to_string()),
            GetStepSnapshotError::NoSnapshot => AppError::NotFound("snapshot".to_string()),
            GetStepSnapshotError::NotAFetchStep(_) => AppError::Validation(err.to_string()),
            GetStepSnapshotError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<ListMeasuresForRunError> for AppError {
    fn from(err: ListMeasuresForRunError) -> Self {
        match err {
            ListMeasuresForRunError::NotFound => AppError::NotFound("run".to_string()),
            ListMeasuresForRunError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<GetMeasureError> for AppError {
    fn from(err: GetMeasureError) -> Self {
        match err {
            GetMeasureError::NotFound => AppError::NotFound("measure".to_string()),
            GetMeasureError::Store(e) => AppError::Store(e),
        }
    }
}
