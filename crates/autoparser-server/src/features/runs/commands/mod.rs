pub mod start_run;

pub use start_run::{StartRunCommand, StartRunError, StartRunResponse};
