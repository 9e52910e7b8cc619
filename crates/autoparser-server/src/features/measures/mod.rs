//! Measures feature module
//!
//! Read-only access to stored measures, directly or through the run that saved them.

pub mod queries;
