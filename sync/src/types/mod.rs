//! Core data types flowing through the sync engine.

mod record;
mod report;
mod row;
mod schema;

pub use record::*;
pub use report::*;
pub use row::*;
pub use schema::*;
