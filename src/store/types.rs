use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The metadata entry this core owns on each source.
pub const RSS_METADATA_KEY: &str = "rss";

// ============================================================================
// Error Types
// ============================================================================

/// Repository errors are fatal to an ingestion pass: losing watermark updates
/// silently is worse than stopping the run.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid source metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    /// An update matched no row — the source vanished between the read and
    /// the write, and the watermark it carried was not persisted.
    #[error("source {0} not found")]
    NotFound(String),
}

// ============================================================================
// Source & RSS Metadata
// ============================================================================

/// A syndication source as seen by this core.
///
/// The source itself is owned by the host; this core reads all fields and
/// writes only the `"rss"` entry of `metadata`.
#[derive(Debug, Clone)]
pub struct Source {
    /// Opaque unique identifier.
    pub id: String,
    /// Feed URL. May be empty, in which case the source is skipped entirely.
    pub feed_url: String,
    /// Named sub-configurations. Entries other than `"rss"` belong to other
    /// components and pass through untouched.
    pub metadata: Map<String, Value>,
}

/// The `"rss"` sub-configuration, strongly typed and validated here at the
/// store boundary instead of being cast out of an untyped dictionary per
/// access.
///
/// Stored as camelCase JSON inside `Source::metadata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RssMetadata {
    /// Entries are processed only when true.
    pub enabled: bool,

    /// Optional keyword filter. Empty or absent means "no filtering".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,

    /// High-water mark of previously ingested publish times. Absent means
    /// "never pulled". Only ever moves forward, and only after a feed has
    /// been successfully fetched and parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pull: Option<DateTime<Utc>>,
}

impl Source {
    pub fn new(id: impl Into<String>, feed_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            feed_url: feed_url.into(),
            metadata: Map::new(),
        }
    }

    /// Typed view of the `"rss"` metadata entry.
    ///
    /// `None` when the entry is absent or does not deserialize; the pipeline
    /// treats such sources as misconfigured and skips them.
    pub fn rss_metadata(&self) -> Option<RssMetadata> {
        let value = self.metadata.get(RSS_METADATA_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Writes the `"rss"` metadata entry back, leaving sibling entries alone.
    pub fn set_rss_metadata(&mut self, meta: &RssMetadata) -> Result<(), RepositoryError> {
        let value = serde_json::to_value(meta)?;
        self.metadata.insert(RSS_METADATA_KEY.to_string(), value);
        Ok(())
    }
}

// ============================================================================
// Repository Contract
// ============================================================================

/// Persistence boundary for sources and their watermarks.
///
/// The pipeline reads all sources once per pass and writes each source back
/// after its feed has been successfully processed. Writes are scoped to one
/// source at a time; implementations must not interleave two writers on the
/// same source.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn all_sources(&self) -> Result<Vec<Source>, RepositoryError>;

    async fn update_source(&self, source: &Source) -> Result<(), RepositoryError>;

    /// End-of-batch safety flush. Backends that commit on every update keep
    /// the default no-op.
    async fn flush(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn rss_metadata_roundtrip_preserves_sibling_entries() {
        let mut source = Source::new("s1", "https://example.com/feed");
        source
            .metadata
            .insert("other".to_string(), json!({"keep": true}));

        let meta = RssMetadata {
            enabled: true,
            keywords: Some(vec!["alpha".to_string()]),
            last_pull: Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()),
        };
        source.set_rss_metadata(&meta).unwrap();

        assert_eq!(source.rss_metadata(), Some(meta));
        assert_eq!(source.metadata["other"], json!({"keep": true}));
    }

    #[test]
    fn absent_rss_entry_yields_none() {
        let source = Source::new("s1", "https://example.com/feed");
        assert!(source.rss_metadata().is_none());
    }

    #[test]
    fn unparseable_rss_entry_yields_none() {
        let mut source = Source::new("s1", "https://example.com/feed");
        source
            .metadata
            .insert(RSS_METADATA_KEY.to_string(), json!("not an object"));
        assert!(source.rss_metadata().is_none());
    }

    #[test]
    fn optional_fields_default_when_absent() {
        let mut source = Source::new("s1", "https://example.com/feed");
        source
            .metadata
            .insert(RSS_METADATA_KEY.to_string(), json!({"enabled": true}));

        let meta = source.rss_metadata().unwrap();
        assert!(meta.enabled);
        assert!(meta.keywords.is_none());
        assert!(meta.last_pull.is_none());
    }

    #[test]
    fn serialized_field_names_are_camel_case() {
        let meta = RssMetadata {
            enabled: true,
            keywords: None,
            last_pull: Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()),
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert!(value.get("lastPull").is_some());
        assert!(value.get("keywords").is_none()); // skipped when None
    }
}
