//! Runs feature module
//!
//! Starting runs and reading their history. Step listings surface steps left
//! open by a crashed run instead of hiding them.

pub mod commands;
pub mod queries;
