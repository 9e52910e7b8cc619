//! Control surface
//!
//! Each operation is a vertical slice: a request type implementing
//! [`mediator::Request`], a response type, a `thiserror` error enum and a
//! standalone `handle` function that works against any [`crate::store::Store`].
//!
//! # Features
//!
//! - **runs**: trigger runs and inspect their history (runs, steps, snapshots)
//! - **measures**: read the durable measure records a run produced
//!
//! # Architecture
//!
//! - `commands/` - write operations (start a run)
//! - `queries/` - read operations (get, list)

pub mod measures;
pub mod runs;
