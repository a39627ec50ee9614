//! Entry filter: pure inclusion/exclusion decisions.
//!
//! Given an entry, the source's watermark and its optional keyword list, the
//! filter decides whether the entry becomes a candidate document and, when it
//! does not, why. It touches no I/O and no clock, so evaluating it twice on
//! the same input always yields the same verdict.

use crate::feed::FeedEntry;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Include,
    Exclude(ExcludeReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcludeReason {
    /// Entries without a link can never be stored downstream.
    MissingLink,
    /// Publish date missing or not strictly after the watermark.
    NotNewer,
    /// A keyword list is set and no keyword matched title + summary.
    KeywordMismatch,
}

/// Decides whether `entry` should be emitted.
///
/// Rules, in order:
/// - no link → excluded, always;
/// - with a watermark set, only entries published strictly after it pass
///   (equal-to-watermark entries were ingested by the run that set it, and a
///   missing publish date counts as not newer);
/// - a non-empty keyword list requires at least one case-sensitive whole-word
///   match against the whitespace-split tokens of title + summary.
pub fn evaluate(
    entry: &FeedEntry,
    watermark: Option<DateTime<Utc>>,
    keywords: &[String],
) -> Verdict {
    if entry.link.is_none() {
        return Verdict::Exclude(ExcludeReason::MissingLink);
    }

    if let Some(watermark) = watermark {
        match entry.published {
            Some(published) if published > watermark => {}
            _ => return Verdict::Exclude(ExcludeReason::NotNewer),
        }
    }

    if !keywords.is_empty() && !matches_any_keyword(entry, keywords) {
        return Verdict::Exclude(ExcludeReason::KeywordMismatch);
    }

    Verdict::Include
}

/// Case-sensitive whole-word match: tokens are split on whitespace and each
/// keyword is compared against both the raw token and the token with boundary
/// punctuation trimmed. "alpha," matches the keyword "alpha", "alphabet" does
/// not, and a keyword that itself carries punctuation ("C++", "$AAPL") still
/// matches its literal token.
fn matches_any_keyword(entry: &FeedEntry, keywords: &[String]) -> bool {
    entry
        .title
        .split_whitespace()
        .chain(entry.summary.split_whitespace())
        .any(|token| {
            let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric());
            keywords
                .iter()
                .any(|keyword| token == keyword || trimmed == keyword)
        })
}
