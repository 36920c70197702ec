//! BigQuery warehouse target.

mod client;
mod destination;

pub use client::*;
pub use destination::*;
