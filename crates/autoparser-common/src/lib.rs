//! Autoparser Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the autoparser workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the workspace-wide [`AutoparserError`] and [`Result`] alias
//! - **Checksums**: content hashing for fetched page snapshots
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` environment variables
//!
//! # Example
//!
//! ```no_run
//! use autoparser_common::checksum::sha256_hex;
//!
//! let hash = sha256_hex(b"<html></html>");
//! assert_eq!(hash.len(), 64);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{AutoparserError, Result};
