//! wetcorpus Ingest Library
//!
//! Builds text corpora from Common Crawl WET segments.
//!
//! # Components
//!
//! - **planner**: decides how many segments a target size needs
//! - **index**: lists the segments of a crawl and filters them
//! - **fetcher**: streams and gunzips one segment to disk
//! - **extractor**: iterates WARC records of a decompressed segment
//! - **normalizer**: HTML stripping, character filtering and line splitting
//! - **dispatcher**: runs the whole pipeline on a bounded worker pool
//!
//! # Example
//!
//! ```no_run
//! use wetcorpus_ingest::{IngestConfig, SegmentDispatcher, StageOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::builder().unit_count(1).target_size_mb(50).build();
//!     let dispatcher = SegmentDispatcher::builder(config).build()?;
//!     let corpus = dispatcher.run_batch(None, &StageOptions::new()).await?;
//!     println!("{} bytes", corpus.len_bytes());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod extractor;
pub mod fetcher;
pub mod index;
pub mod normalizer;
pub mod planner;
pub mod progress;
pub mod throttle;

pub use config::{CleaningSettings, CrawlMode, IngestConfig};
pub use dispatcher::{ExitTransform, Identity, SegmentDispatcher, SegmentDispatcherBuilder};
pub use extractor::{DecodeErrorPolicy, RawRecord, TextEncoding, WarcReader};
pub use fetcher::{FetchError, FetchedSegment, SegmentFetcher, SegmentPaths};
pub use index::{CrawlIndex, IndexProvider, PatternPredicate, SegmentPredicate, StaticIndex};
pub use normalizer::{CleaningConfig, InterruptPolicy, StageOptions, TextNormalizer};
pub use planner::{WorkloadPlan, WorkloadPlanner};
pub use wetcorpus_common::{Corpus, CorpusError, Result, SegmentId};
