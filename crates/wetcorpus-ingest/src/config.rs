//! Ingestion configuration
//!
//! Settings for a corpus acquisition run, loaded from `WETCORPUS_*`
//! environment variables or assembled with [`IngestConfig::builder`].

use crate::extractor::{DecodeErrorPolicy, TextEncoding};
use crate::normalizer::InterruptPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use wetcorpus_common::{CorpusError, Result};

pub const DEFAULT_BASE_URL: &str = "https://data.commoncrawl.org";
pub const DEFAULT_CRAWL_ID: &str = "CC-MAIN-2023-23";

/// How the acquired corpus is meant to be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CrawlMode {
    /// Fetch and clean segments now, returning the corpus to the caller
    #[default]
    Immediate,
    /// Build an external dataset from the selected segments
    Dataset,
}

impl std::fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrawlMode::Immediate => write!(f, "immediate"),
            CrawlMode::Dataset => write!(f, "dataset"),
        }
    }
}

impl FromStr for CrawlMode {
    type Err = CorpusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "immediate" => Ok(CrawlMode::Immediate),
            "dataset" => Ok(CrawlMode::Dataset),
            other => Err(CorpusError::config(format!(
                "Invalid crawl mode: {}. Must be 'immediate' or 'dataset'",
                other
            ))),
        }
    }
}

/// Cleaning switches that can be expressed as plain configuration.
///
/// Hooks (custom stage, line filter) are attached to the dispatcher builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningSettings {
    pub remove_html: bool,
    pub strip_non_language_chars: bool,
    pub split_lines: bool,
    /// Regex character-class body of the characters to keep
    pub retained_chars: String,
}

impl Default for CleaningSettings {
    fn default() -> Self {
        Self {
            remove_html: true,
            strip_non_language_chars: true,
            split_lines: false,
            retained_chars: "a-zA-Z0-9 _".to_string(),
        }
    }
}

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub mode: CrawlMode,
    /// Requested number of segments
    pub unit_count: u64,
    /// Requested corpus size in MB
    pub target_size_mb: u64,
    /// Conservative upper bound of one segment in MB
    pub segment_estimate_mb: u64,
    /// Worker pool size (None = one worker per planned segment)
    pub max_concurrency: Option<usize>,
    /// Minimum spacing between segment requests
    pub inter_request_delay_ms: u64,
    /// Ceiling for the escalated request spacing
    pub max_request_delay_ms: u64,
    /// Retries for rate-limited (429/503) segment requests
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub base_url: String,
    pub crawl_id: String,
    /// Directory for transient segment files
    pub work_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub encoding: TextEncoding,
    pub decode_policy: DecodeErrorPolicy,
    pub interrupt_policy: InterruptPolicy,
    /// Keep decompressed segment files after processing
    pub keep_segments: bool,
    /// Feed `warcinfo` records through the cleaning pipeline too
    pub include_warcinfo: bool,
    pub show_progress: bool,
    pub user_agent: String,
    pub cleaning: CleaningSettings,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            mode: CrawlMode::Immediate,
            unit_count: 5,
            target_size_mb: 1500,
            segment_estimate_mb: crate::planner::DEFAULT_SEGMENT_ESTIMATE_MB,
            max_concurrency: None,
            inter_request_delay_ms: 1000,
            max_request_delay_ms: 60_000,
            max_retries: 3,
            retry_backoff_ms: 2000,
            base_url: DEFAULT_BASE_URL.to_string(),
            crawl_id: DEFAULT_CRAWL_ID.to_string(),
            work_dir: std::env::temp_dir().join("wetcorpus"),
            request_timeout_secs: 600, // segments are ~100-300MB
            encoding: TextEncoding::Utf8,
            decode_policy: DecodeErrorPolicy::Ignore,
            interrupt_policy: InterruptPolicy::KeepPartial,
            keep_segments: false,
            include_warcinfo: false,
            show_progress: false,
            user_agent: format!("wetcorpus/{}", env!("CARGO_PKG_VERSION")),
            cleaning: CleaningSettings::default(),
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when unset
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| CorpusError::config(format!("Invalid {}='{}': {}", key, raw, e))),
        _ => Ok(default),
    }
}

impl IngestConfig {
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Self::default().merge_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields with any `WETCORPUS_*` variables that are set
    pub fn merge_env(self) -> Result<Self> {
        let max_concurrency = match std::env::var("WETCORPUS_MAX_CONCURRENCY") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse().map_err(|_| {
                CorpusError::config(format!("Invalid WETCORPUS_MAX_CONCURRENCY='{}'", raw))
            })?),
            _ => self.max_concurrency,
        };

        Ok(Self {
            mode: env_or("WETCORPUS_MODE", self.mode)?,
            unit_count: env_or("WETCORPUS_UNITS", self.unit_count)?,
            target_size_mb: env_or("WETCORPUS_TARGET_MB", self.target_size_mb)?,
            segment_estimate_mb: env_or("WETCORPUS_SEGMENT_ESTIMATE_MB", self.segment_estimate_mb)?,
            max_concurrency,
            inter_request_delay_ms: env_or("WETCORPUS_REQUEST_DELAY_MS", self.inter_request_delay_ms)?,
            max_request_delay_ms: env_or("WETCORPUS_MAX_REQUEST_DELAY_MS", self.max_request_delay_ms)?,
            max_retries: env_or("WETCORPUS_MAX_RETRIES", self.max_retries)?,
            retry_backoff_ms: env_or("WETCORPUS_RETRY_BACKOFF_MS", self.retry_backoff_ms)?,
            base_url: env_or("WETCORPUS_BASE_URL", self.base_url)?,
            crawl_id: env_or("WETCORPUS_CRAWL_ID", self.crawl_id)?,
            work_dir: env_or("WETCORPUS_WORK_DIR", self.work_dir)?,
            request_timeout_secs: env_or("WETCORPUS_TIMEOUT_SECS", self.request_timeout_secs)?,
            encoding: env_or("WETCORPUS_ENCODING", self.encoding)?,
            decode_policy: env_or("WETCORPUS_DECODE_POLICY", self.decode_policy)?,
            interrupt_policy: env_or("WETCORPUS_INTERRUPT_POLICY", self.interrupt_policy)?,
            keep_segments: env_or("WETCORPUS_KEEP_SEGMENTS", self.keep_segments)?,
            include_warcinfo: env_or("WETCORPUS_INCLUDE_WARCINFO", self.include_warcinfo)?,
            show_progress: env_or("WETCORPUS_PROGRESS", self.show_progress)?,
            user_agent: env_or("WETCORPUS_USER_AGENT", self.user_agent)?,
            cleaning: self.cleaning,
        })
    }

    /// Validate the configuration
    ///
    /// Plan consistency (unit count vs target size) is checked by the planner.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(CorpusError::config("Base URL cannot be empty"));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(CorpusError::config(format!(
                "Base URL must be http(s): {}",
                self.base_url
            )));
        }
        if self.crawl_id.trim().is_empty() {
            return Err(CorpusError::config("Crawl id cannot be empty"));
        }
        if self.unit_count == 0 && self.target_size_mb == 0 {
            return Err(CorpusError::config(
                "Nothing to fetch: set a segment count or a target size above 0",
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(CorpusError::config("Timeout must be greater than 0"));
        }
        if self.max_concurrency == Some(0) {
            return Err(CorpusError::config("Max concurrency must be greater than 0"));
        }
        if self.max_request_delay_ms < self.inter_request_delay_ms {
            return Err(CorpusError::config(format!(
                "Max request delay ({}ms) is below the base delay ({}ms)",
                self.max_request_delay_ms, self.inter_request_delay_ms
            )));
        }
        if self.cleaning.strip_non_language_chars && self.cleaning.retained_chars.is_empty() {
            return Err(CorpusError::config("Retained character set cannot be empty"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }

    pub fn max_request_delay(&self) -> Duration {
        Duration::from_millis(self.max_request_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Builder for IngestConfig
#[derive(Debug, Default)]
pub struct IngestConfigBuilder {
    config: Option<IngestConfig>,
}

macro_rules! builder_setters {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(mut self, value: $ty) -> Self {
                self.inner().$name = value.into();
                self
            }
        )*
    };
}

impl IngestConfigBuilder {
    fn inner(&mut self) -> &mut IngestConfig {
        self.config.get_or_insert_with(IngestConfig::default)
    }

    builder_setters! {
        mode: CrawlMode,
        unit_count: u64,
        target_size_mb: u64,
        segment_estimate_mb: u64,
        inter_request_delay_ms: u64,
        max_request_delay_ms: u64,
        max_retries: u32,
        retry_backoff_ms: u64,
        request_timeout_secs: u64,
        encoding: TextEncoding,
        decode_policy: DecodeErrorPolicy,
        interrupt_policy: InterruptPolicy,
        keep_segments: bool,
        include_warcinfo: bool,
        show_progress: bool,
        cleaning: CleaningSettings,
    }

    pub fn max_concurrency(mut self, workers: usize) -> Self {
        self.inner().max_concurrency = Some(workers);
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.inner().base_url = url.into();
        self
    }

    pub fn crawl_id(mut self, crawl_id: impl Into<String>) -> Self {
        self.inner().crawl_id = crawl_id.into();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inner().work_dir = dir.into();
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.inner().user_agent = agent.into();
        self
    }

    pub fn build(self) -> IngestConfig {
        self.config.unwrap_or_default()
    }
}
