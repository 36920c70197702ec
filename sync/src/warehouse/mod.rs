//! Warehouse targets for the stage-and-merge writer.

mod base;
#[cfg(feature = "bigquery")]
pub mod bigquery;
mod memory;

pub use base::*;
pub use memory::*;
