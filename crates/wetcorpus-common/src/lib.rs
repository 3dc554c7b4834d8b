//! wetcorpus Common Library
//!
//! Shared types, logging and error handling for the wetcorpus workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CorpusError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by environment variables
//! - **Types**: segment identifiers and the corpus containers produced by a batch
//!
//! # Example
//!
//! ```no_run
//! use wetcorpus_common::types::{Corpus, CorpusBuffer};
//!
//! let mut buffer = CorpusBuffer::new(false);
//! buffer.push(Corpus::Text("Hello ".to_string()));
//! buffer.push(Corpus::Text("World".to_string()));
//! assert_eq!(buffer.finish(), Corpus::Text("Hello World".to_string()));
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CorpusError, Result};
pub use types::{Corpus, CorpusBuffer, SegmentId};
