//! Segment download and decompression
//!
//! Streams one remote `.warc.wet.gz` segment to a uniquely named file in the
//! work directory, then gunzips it next to it and removes the compressed copy.

use crate::config::IngestConfig;
use crate::progress::{format_bytes, ProgressDisplay};
use flate2::read::MultiGzDecoder;
use futures::StreamExt;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wetcorpus_common::{CorpusError, Result, SegmentId};

/// Failure of a single fetch attempt
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// 429 or 503; the caller may back off and retry
    #[error("Rate limited by {url} (HTTP {status})")]
    RateLimited {
        url: String,
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error(transparent)]
    Failed(#[from] CorpusError),
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Failed(err.into())
    }
}

impl From<FetchError> for CorpusError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { url, status, .. } => {
                let reason = StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("Rate limited");
                CorpusError::http_status(url, status, reason)
            },
            FetchError::Failed(err) => err,
        }
    }
}

/// Working files of one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPaths {
    pub compressed: PathBuf,
    pub decompressed: PathBuf,
}

impl SegmentPaths {
    /// `{stem}-{uuid}.warc.wet.gz` and `{stem}-{uuid}.warc.wet` inside `work_dir`
    pub fn new(work_dir: &Path, segment: &SegmentId) -> Self {
        let name = format!("{}-{}", segment.file_stem(), Uuid::new_v4().simple());
        Self {
            compressed: work_dir.join(format!("{}.warc.wet.gz", name)),
            decompressed: work_dir.join(format!("{}.warc.wet", name)),
        }
    }

    /// Working files that currently exist on disk
    pub fn leftovers(&self) -> Vec<&Path> {
        [self.compressed.as_path(), self.decompressed.as_path()]
            .into_iter()
            .filter(|p| p.exists())
            .collect()
    }

    /// Delete both working files, ignoring ones that are already gone
    pub fn remove(&self) -> Result<()> {
        for path in [&self.compressed, &self.decompressed] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed working file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// A downloaded and decompressed segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSegment {
    pub path: PathBuf,
    pub compressed_bytes: u64,
    pub decompressed_bytes: u64,
}

/// HTTP client for segment downloads
#[derive(Debug, Clone)]
pub struct SegmentFetcher {
    client: Client,
    work_dir: PathBuf,
    progress: ProgressDisplay,
}

/// Build the HTTP client shared by the fetcher and the crawl index
pub fn build_client(config: &IngestConfig) -> Result<Client> {
    Client::builder()
        .timeout(config.request_timeout())
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| CorpusError::config(format!("Failed to build HTTP client: {}", e)))
}

impl SegmentFetcher {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        Ok(Self::with_client(
            build_client(config)?,
            config.work_dir.clone(),
            ProgressDisplay::new(config.show_progress),
        ))
    }

    pub fn with_client(client: Client, work_dir: impl Into<PathBuf>, progress: ProgressDisplay) -> Self {
        Self {
            client,
            work_dir: work_dir.into(),
            progress,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn progress(&self) -> &ProgressDisplay {
        &self.progress
    }

    /// Fresh working file names for a segment
    pub fn paths_for(&self, segment: &SegmentId) -> SegmentPaths {
        SegmentPaths::new(&self.work_dir, segment)
    }

    /// Download `url` into `paths.compressed` and decompress it into
    /// `paths.decompressed`.
    ///
    /// On cancellation the partial compressed file stays on disk and the
    /// error carries its path.
    pub async fn fetch(
        &self,
        url: &str,
        paths: &SegmentPaths,
        cancel: &CancellationToken,
    ) -> std::result::Result<FetchedSegment, FetchError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        debug!(url, "Requesting segment");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(CorpusError::interrupted("download", None).into());
            }
            response = self.client.get(url).send() => {
                response.map_err(|e| CorpusError::transport(url, e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            if code == 429 || code == 503 {
                return Err(FetchError::RateLimited {
                    url: url.to_string(),
                    status: code,
                    retry_after: retry_after(response.headers()),
                });
            }
            return Err(CorpusError::http_status(
                url,
                code,
                status.canonical_reason().unwrap_or("Unknown status"),
            )
            .into());
        }

        let label = paths
            .compressed
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.to_string());
        let pb = self.progress.download(response.content_length(), &label);

        let mut file = tokio::fs::File::create(&paths.compressed).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    pb.abandon();
                    warn!(
                        path = %paths.compressed.display(),
                        downloaded,
                        "Download interrupted, partial file left in place"
                    );
                    return Err(CorpusError::interrupted("download", Some(paths.compressed.clone())).into());
                }
                next = stream.next() => next,
            };

            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| CorpusError::transport(url, e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }

        file.flush().await?;
        drop(file);
        pb.finish_and_clear();

        debug!(url, bytes = downloaded, "Segment downloaded");

        let decompressed_bytes = decompress_file(&paths.compressed, &paths.decompressed).await?;

        info!(
            url,
            compressed = %format_bytes(downloaded),
            decompressed = %format_bytes(decompressed_bytes),
            "Fetched segment"
        );

        Ok(FetchedSegment {
            path: paths.decompressed.clone(),
            compressed_bytes: downloaded,
            decompressed_bytes,
        })
    }
}

/// `Retry-After` in delay-seconds form; HTTP-date values are ignored
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Gunzip `src` into `dst` on a blocking thread, then delete `src`.
///
/// Handles multi-member gzip streams. Returns the decompressed size.
pub async fn decompress_file(src: &Path, dst: &Path) -> Result<u64> {
    let (source, target) = (src.to_path_buf(), dst.to_path_buf());
    let written = tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(&source)?));
        let mut writer = BufWriter::new(File::create(&target)?);
        let written = std::io::copy(&mut decoder, &mut writer)?;
        std::io::Write::flush(&mut writer)?;
        Ok(written)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Decompression task failed: {}", e))??;

    tokio::fs::remove_file(src).await?;
    debug!(src = %src.display(), dst = %dst.display(), bytes = written, "Decompressed segment");
    Ok(written)
}

/// Decompress gzip-compressed data held in memory
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).map_err(|e| {
        CorpusError::parse(format!("Failed to decompress gzip data: {}", e))
    })?;
    debug!("Decompressed {} -> {} bytes", data.len(), decompressed.len());
    Ok(decompressed)
}
