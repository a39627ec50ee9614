//! Feed client: one fetch-and-parse attempt per call.
//!
//! - [`client`] - HTTP retrieval and RSS/Atom normalization via `feed-rs`
//! - [`dtd`] - DOCTYPE policy enforcement on the raw document
//!
//! The client performs no retries and holds no state between calls; the
//! ingestion pipeline owns error containment and watermark bookkeeping.

mod client;
mod dtd;

pub use client::{Feed, FeedClient, FeedEntry, FetchError};
pub use dtd::DtdPolicy;
