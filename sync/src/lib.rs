//! Incremental synchronization engine.
//!
//! Pulls entity collections from the tracker and planner APIs, collapses
//! duplicate observations, resolves cross-source identities and merges the
//! result into warehouse tables through a staged, idempotent upsert.

pub mod concurrency;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod identity;
mod macros;
pub mod pipeline;
pub mod test_utils;
pub mod transform;
pub mod types;
pub mod warehouse;
pub mod writer;
