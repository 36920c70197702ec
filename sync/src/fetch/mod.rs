//! Paginated source fetching with retry.
//!
//! A [`Fetcher`] drives any [`PagedSource`] to completion, materializing the
//! full record set for one resource. Page-numbered sources stop on the first
//! short page and may fetch pages in concurrent waves; cursor sources follow
//! `nextCursor` tokens sequentially. Every page request is wrapped in the
//! retry policy and throttled by the run-wide outbound permit pool.

mod fetcher;
mod pagination;
mod retry;
mod source;

pub use fetcher::*;
pub use pagination::*;
pub use retry::*;
pub use source::*;
