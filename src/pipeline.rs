//! Ingestion pipeline: fetch → filter → emit → watermark-advance, one source
//! at a time.
//!
//! Error containment is the point of this module. A source that cannot be
//! fetched or parsed is logged and left exactly as it was — its watermark
//! untouched — and the pass moves on to the next source. Only two things are
//! fatal to a run: failing to enumerate sources at all, and failing to
//! persist a watermark (silently losing watermark updates would re-ingest or
//! drop entries on the next run).

use crate::feed::{Feed, FeedClient, FetchError};
use crate::filter::{self, Verdict};
use crate::store::{Source, SourceRepository};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Normalized record handed to downstream storage.
///
/// Carries no identity beyond `(source_id, url)`; deduplication against
/// already-stored documents is downstream's job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDocument {
    pub title: String,
    pub description: String,
    pub document_date: DateTime<Utc>,
    pub url: String,
    pub override_source: bool,
    pub source_id: String,
}

/// Outcome counts for one ingestion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub emitted: usize,
}

enum SourceOutcome {
    Skipped(SkipReason),
    FetchFailed,
    Completed { emitted: usize },
    /// Receiver dropped or document limit reached mid-source. The watermark
    /// stays untouched so unemitted entries surface on the next run.
    Interrupted { emitted: usize },
}

#[derive(Debug, Clone, Copy)]
enum SkipReason {
    NoFeedUrl,
    NoRssMetadata,
    Disabled,
}

/// Remaining document budget for a pass. A limit of zero means unlimited.
struct Budget {
    remaining: Option<usize>,
}

impl Budget {
    fn new(limit: usize) -> Self {
        Self {
            remaining: (limit > 0).then_some(limit),
        }
    }

    fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    fn take(&mut self) -> bool {
        match &mut self.remaining {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

/// One pass over all sources, strictly sequential.
///
/// Documents stream out through a bounded channel as each source is
/// processed; a source's watermark is persisted only after all of its
/// accepted entries have been handed to the consumer.
pub struct Pipeline<R> {
    repository: Arc<R>,
    client: FeedClient,
}

impl<R: SourceRepository> Pipeline<R> {
    pub fn new(repository: Arc<R>, client: FeedClient) -> Self {
        Self { repository, client }
    }

    /// Shape of this importer's per-instance settings: an empty object.
    /// All state lives on the sources themselves.
    pub fn settings_schema() -> serde_json::Value {
        serde_json::Value::Object(serde_json::Map::new())
    }

    /// Runs one ingestion pass.
    ///
    /// `last_pull_hint` is advisory: it serves as the cutoff only for sources
    /// that have never been pulled; a source's own `lastPull` is authoritative
    /// otherwise. `limit` caps the total documents emitted (0 = unlimited).
    ///
    /// Dropping the receiver cancels the pass cooperatively: the current
    /// source is abandoned without a watermark update, no further sources are
    /// fetched, and the run still returns cleanly.
    ///
    /// # Errors
    ///
    /// Only repository failures (enumeration, watermark persistence) abort
    /// the run. Per-source fetch and parse failures are contained and
    /// reported through logs and the returned [`RunSummary`].
    pub async fn run(
        &self,
        last_pull_hint: Option<DateTime<Utc>>,
        limit: usize,
        tx: mpsc::Sender<CandidateDocument>,
    ) -> Result<RunSummary> {
        let sources = self
            .repository
            .all_sources()
            .await
            .context("failed to enumerate sources")?;

        let mut summary = RunSummary::default();
        let mut budget = Budget::new(limit);

        for mut source in sources {
            if tx.is_closed() || budget.exhausted() {
                break;
            }

            let outcome = self
                .process_source(&mut source, last_pull_hint, &mut budget, &tx)
                .await
                .with_context(|| format!("failed to update metadata for source {}", source.id))?;

            match outcome {
                SourceOutcome::Skipped(reason) => {
                    tracing::debug!(source = %source.id, reason = ?reason, "source skipped");
                    summary.skipped += 1;
                }
                SourceOutcome::FetchFailed => {
                    summary.failed += 1;
                }
                SourceOutcome::Completed { emitted } => {
                    self.repository
                        .update_source(&source)
                        .await
                        .with_context(|| {
                            format!("failed to persist watermark for source {}", source.id)
                        })?;
                    tracing::info!(
                        source = %source.id,
                        emitted = emitted,
                        "source processed, watermark advanced"
                    );
                    summary.succeeded += 1;
                    summary.emitted += emitted;
                }
                SourceOutcome::Interrupted { emitted } => {
                    tracing::debug!(
                        source = %source.id,
                        emitted = emitted,
                        "pass interrupted mid-source, watermark untouched"
                    );
                    summary.emitted += emitted;
                    break;
                }
            }
        }

        self.repository
            .flush()
            .await
            .context("end-of-batch flush failed")?;

        tracing::info!(
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            emitted = summary.emitted,
            "ingestion pass complete"
        );
        Ok(summary)
    }

    /// Convenience wrapper: runs a pass and collects every emitted document.
    pub async fn run_collect(
        &self,
        last_pull_hint: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<CandidateDocument>> {
        let (tx, mut rx) = mpsc::channel(16);
        let run = self.run(last_pull_hint, limit, tx);
        let drain = async {
            let mut docs = Vec::new();
            while let Some(doc) = rx.recv().await {
                docs.push(doc);
            }
            docs
        };
        let (summary, docs) = tokio::join!(run, drain);
        summary?;
        Ok(docs)
    }

    /// Processes one source end to end. Mutates `source` in place with the
    /// advanced watermark on success; the caller persists it.
    ///
    /// The `Err` variant carries only metadata-serialization failures, which
    /// the caller treats as fatal persistence errors.
    async fn process_source(
        &self,
        source: &mut Source,
        last_pull_hint: Option<DateTime<Utc>>,
        budget: &mut Budget,
        tx: &mpsc::Sender<CandidateDocument>,
    ) -> Result<SourceOutcome, crate::store::RepositoryError> {
        if source.feed_url.is_empty() {
            return Ok(SourceOutcome::Skipped(SkipReason::NoFeedUrl));
        }
        let Some(mut meta) = source.rss_metadata() else {
            return Ok(SourceOutcome::Skipped(SkipReason::NoRssMetadata));
        };
        if !meta.enabled {
            return Ok(SourceOutcome::Skipped(SkipReason::Disabled));
        }

        let feed = match self.client.fetch(&source.feed_url).await {
            Ok(feed) => feed,
            Err(err) => {
                log_fetch_error(&source.id, &source.feed_url, &err);
                return Ok(SourceOutcome::FetchFailed);
            }
        };

        // The fetch has fully completed and released its connection; from
        // here on everything is in-memory except the channel sends.
        let cutoff = meta.last_pull.or(last_pull_hint);
        let keywords = meta.keywords.as_deref().unwrap_or(&[]);
        let mut emitted = 0usize;

        for entry in &feed.entries {
            match filter::evaluate(entry, cutoff, keywords) {
                Verdict::Include => {
                    let Some(url) = entry.link.clone() else {
                        // evaluate() excludes link-less entries
                        continue;
                    };
                    if !budget.take() {
                        return Ok(SourceOutcome::Interrupted { emitted });
                    }
                    let doc = CandidateDocument {
                        title: entry.title.clone(),
                        description: entry.summary.clone(),
                        document_date: entry.published.unwrap_or_else(Utc::now),
                        url,
                        override_source: true,
                        source_id: source.id.clone(),
                    };
                    if tx.send(doc).await.is_err() {
                        return Ok(SourceOutcome::Interrupted { emitted });
                    }
                    emitted += 1;
                }
                Verdict::Exclude(reason) => {
                    tracing::trace!(
                        source = %source.id,
                        link = entry.link.as_deref().unwrap_or(""),
                        reason = ?reason,
                        "entry excluded"
                    );
                }
            }
        }

        meta.last_pull = Some(next_watermark(meta.last_pull, &feed));
        source.set_rss_metadata(&meta)?;
        Ok(SourceOutcome::Completed { emitted })
    }
}

/// Computes the new watermark after a successfully processed feed.
///
/// The maximum publish date across all entries — accepted or not — so that
/// keyword-excluded entries are not re-evaluated forever. An empty feed, or
/// one whose entries all lack dates, counts as caught up to now. The previous
/// watermark clamps the result from below: it never moves backwards.
fn next_watermark(previous: Option<DateTime<Utc>>, feed: &Feed) -> DateTime<Utc> {
    let candidate = feed
        .entries
        .iter()
        .filter_map(|entry| entry.published)
        .max()
        .unwrap_or_else(Utc::now);
    match previous {
        Some(previous) => previous.max(candidate),
        None => candidate,
    }
}

fn log_fetch_error(source_id: &str, url: &str, err: &FetchError) {
    match err {
        // Policy problem rather than a broken source; remediation is in the
        // error text.
        FetchError::DtdProhibited => {
            tracing::warn!(source = %source_id, url = %url, "{err}");
        }
        _ => {
            tracing::error!(source = %source_id, url = %url, error = %err, "feed fetch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedEntry;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn dated_entry(day: u32) -> FeedEntry {
        FeedEntry {
            link: Some("https://example.com/e".to_string()),
            published: Some(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
            ..FeedEntry::default()
        }
    }

    #[test]
    fn watermark_takes_max_over_all_entries() {
        let feed = Feed {
            entries: vec![dated_entry(3), dated_entry(1), dated_entry(2)],
        };
        assert_eq!(
            next_watermark(None, &feed),
            Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn empty_feed_watermarks_to_now() {
        let before = Utc::now();
        let mark = next_watermark(None, &Feed { entries: vec![] });
        assert!(mark >= before && mark <= Utc::now());
    }

    #[test]
    fn dateless_entries_watermark_to_now() {
        let feed = Feed {
            entries: vec![FeedEntry {
                link: Some("u".to_string()),
                ..FeedEntry::default()
            }],
        };
        let before = Utc::now();
        assert!(next_watermark(None, &feed) >= before);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let previous = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let feed = Feed {
            entries: vec![dated_entry(3)],
        };
        assert_eq!(next_watermark(Some(previous), &feed), previous);
    }

    #[test]
    fn budget_zero_means_unlimited() {
        let mut budget = Budget::new(0);
        assert!(!budget.exhausted());
        for _ in 0..1000 {
            assert!(budget.take());
        }
    }

    #[test]
    fn budget_counts_down_and_stops() {
        let mut budget = Budget::new(2);
        assert!(budget.take());
        assert!(budget.take());
        assert!(!budget.take());
        assert!(budget.exhausted());
    }

    #[test]
    fn settings_schema_is_an_empty_object() {
        let schema = Pipeline::<crate::store::SqliteRepository>::settings_schema();
        assert_eq!(schema, serde_json::json!({}));
    }

    proptest! {
        // Out-of-order, duplicate and far-future publish dates must never
        // drag the watermark backwards.
        #[test]
        fn prop_watermark_is_monotonic(
            prev_secs in proptest::option::of(0i64..4_000_000_000),
            entry_secs in proptest::collection::vec(0i64..4_000_000_000, 0..8),
        ) {
            let previous = prev_secs.map(|s| Utc.timestamp_opt(s, 0).unwrap());
            let feed = Feed {
                entries: entry_secs
                    .iter()
                    .map(|&s| FeedEntry {
                        link: Some("u".to_string()),
                        published: Some(Utc.timestamp_opt(s, 0).unwrap()),
                        ..FeedEntry::default()
                    })
                    .collect(),
            };

            let next = next_watermark(previous, &feed);
            if let Some(previous) = previous {
                prop_assert!(next >= previous);
            }
            if let Some(&max) = entry_secs.iter().max() {
                prop_assert!(next >= Utc.timestamp_opt(max, 0).unwrap());
            }
        }
    }
}
