//! Autoparser Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
//!
//! Extracts structured support-measure records from regional web sources.
//!
//! # Overview
//!
//! - **Pipeline**: search, fetch, clean, seven extraction passes, identifier
//!   allocation and merge, recorded step by step ([`pipeline`])
//! - **Storage**: PostgreSQL through SQLx, or in memory for tests ([`store`])
//! - **Collaborators**: HTTP clients for search, fetch and extraction, plus
//!   JSON Schema validation ([`collaborators`])
//! - **Control surface**: CQRS command and query slices ([`features`])
//! - **Configuration**: environment-based configuration ([`config`])
//!
//! # Architecture
//!
//! Every run is recorded as a row in `runs` with aggregate counters, and every
//! stage attempt as a row in `steps`. Runs execute either synchronously in the
//! caller's process or through the queue worker, which claims `queued` runs
//! with `FOR UPDATE SKIP LOCKED`.
//!
//! # Example
//!
//! ```no_run
//! use autoparser_server::{config::Config, db, store::PgStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     let store = PgStore::new(pool);
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod models;
pub mod pipeline;
pub mod store;

// Re-export commonly used types
pub use error::{AppError, AppResult};
pub use pipeline::{Collaborators, Pipeline, PipelineError, PipelineSettings};
