//! Segment discovery
//!
//! An [`IndexProvider`] lists the segments of a crawl in discovery order; a
//! [`SegmentPredicate`] narrows that list down before planning.

use crate::fetcher::decompress_gzip;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use tracing::{debug, info};
use wetcorpus_common::{CorpusError, Result, SegmentId};

/// Source of the ordered segment list
#[async_trait]
pub trait IndexProvider: Send + Sync {
    async fn segments(&self) -> Result<Vec<SegmentId>>;
}

/// Fixed, in-memory segment list
#[derive(Debug, Clone, Default)]
pub struct StaticIndex {
    segments: Vec<SegmentId>,
}

impl StaticIndex {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SegmentId>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl IndexProvider for StaticIndex {
    async fn segments(&self) -> Result<Vec<SegmentId>> {
        Ok(self.segments.clone())
    }
}

/// Reads `crawl-data/{crawl_id}/wet.paths.gz` from the archive host
#[derive(Debug, Clone)]
pub struct CrawlIndex {
    client: Client,
    base_url: String,
    crawl_id: String,
}

impl CrawlIndex {
    pub fn new(client: Client, base_url: impl Into<String>, crawl_id: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            crawl_id: crawl_id.into(),
        }
    }

    pub fn url(&self) -> String {
        format!(
            "{}/crawl-data/{}/wet.paths.gz",
            self.base_url.trim_end_matches('/'),
            self.crawl_id
        )
    }
}

#[async_trait]
impl IndexProvider for CrawlIndex {
    async fn segments(&self) -> Result<Vec<SegmentId>> {
        let url = self.url();
        debug!(url = %url, "Fetching segment index");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CorpusError::transport(&url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CorpusError::http_status(
                &url,
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown status"),
            ));
        }

        let compressed = response
            .bytes()
            .await
            .map_err(|e| CorpusError::transport(&url, e.to_string()))?;
        let listing = String::from_utf8(decompress_gzip(&compressed)?)
            .map_err(|e| CorpusError::parse(format!("Segment index is not UTF-8: {}", e)))?;

        let segments: Vec<SegmentId> = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(SegmentId::from)
            .collect();

        info!(crawl = %self.crawl_id, segments = segments.len(), "Loaded segment index");
        Ok(segments)
    }
}

/// Caller-supplied filter over segment ids
pub trait SegmentPredicate: Send + Sync {
    fn keep(&self, segment: &SegmentId) -> bool;
}

impl<F> SegmentPredicate for F
where
    F: Fn(&SegmentId) -> bool + Send + Sync,
{
    fn keep(&self, segment: &SegmentId) -> bool {
        self(segment)
    }
}

/// Keeps segments whose id matches a regular expression
#[derive(Debug, Clone)]
pub struct PatternPredicate {
    pattern: Regex,
}

impl PatternPredicate {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| CorpusError::config(format!("Invalid segment pattern '{}': {}", pattern, e)))?;
        Ok(Self { pattern })
    }
}

impl SegmentPredicate for PatternPredicate {
    fn keep(&self, segment: &SegmentId) -> bool {
        self.pattern.is_match(segment.as_str())
    }
}

/// Fetch the full list and keep entries accepted by `predicate`, in order
pub async fn select_segments(
    provider: &dyn IndexProvider,
    predicate: Option<&dyn SegmentPredicate>,
) -> Result<Vec<SegmentId>> {
    let segments = provider.segments().await?;
    let total = segments.len();
    let selected: Vec<SegmentId> = match predicate {
        Some(predicate) => segments.into_iter().filter(|s| predicate.keep(s)).collect(),
        None => segments,
    };
    debug!(total, selected = selected.len(), "Selected segments");
    Ok(selected)
}
