//! tidemark — incremental RSS/Atom feed ingestion with per-source watermarks.
//!
//! Each source carries a `lastPull` watermark inside its metadata. A pass
//! fetches every enabled source's feed, emits entries published strictly
//! after the watermark (optionally keyword-filtered) as candidate documents,
//! and advances the watermark only after a successful fetch and parse. One
//! broken source never aborts the batch.
//!
//! - [`feed`] — HTTP fetch + RSS/Atom parse, DTD policy enforcement
//! - [`filter`] — pure per-entry inclusion decisions
//! - [`store`] — source/watermark persistence boundary
//! - [`pipeline`] — the orchestrating pass
//! - [`config`] — TOML configuration (transport, database)

pub mod config;
pub mod feed;
pub mod filter;
pub mod pipeline;
pub mod store;
