pub mod get_measure;
pub mod list_measures_for_run;

pub use get_measure::{GetMeasureError, GetMeasureQuery};
pub use list_measures_for_run::{
    ListMeasuresForRunError, ListMeasuresForRunQuery, ListMeasuresForRunResponse, MeasureSummary,
};
