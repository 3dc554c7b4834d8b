//! Batch orchestration
//!
//! The dispatcher validates a workload plan, selects segments from the index
//! and runs fetch → extract → clean for each of them on a bounded worker pool.
//!
//! # Flow
//!
//! 1. Plan: `(unit_count, target_size_mb)` is validated (and possibly
//!    rebalanced) by the [`WorkloadPlanner`]
//! 2. Select: the index is listed and filtered by the optional predicate
//! 3. Dispatch: segment ids go onto a job queue, spaced by the
//!    [`RequestThrottle`]; workers report [`WorkerEvent`]s back
//! 4. Merge: cleaned outputs are appended in completion order until the
//!    planned segments are done or the target size is reached
//! 5. Exit: the merged [`Corpus`] goes through the exit transform

use crate::config::{CrawlMode, IngestConfig};
use crate::fetcher::{build_client, FetchError, FetchedSegment, SegmentFetcher, SegmentPaths};
use crate::index::{self, CrawlIndex, IndexProvider, SegmentPredicate};
use crate::normalizer::{CleaningConfig, InterruptPolicy, ProcessOptions, ProcessedSegment, StageOptions, TextNormalizer};
use crate::planner::{WorkloadPlan, WorkloadPlanner};
use crate::progress::{format_bytes, ProgressDisplay};
use crate::throttle::RequestThrottle;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wetcorpus_common::{Corpus, CorpusBuffer, CorpusError, Result, SegmentId};

/// Final reshaping of a batch's corpus
pub trait ExitTransform: Send + Sync {
    type Output;

    fn apply(&self, corpus: Corpus, options: &StageOptions) -> Result<Self::Output>;
}

/// Returns the corpus unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ExitTransform for Identity {
    type Output = Corpus;

    fn apply(&self, corpus: Corpus, _options: &StageOptions) -> Result<Corpus> {
        Ok(corpus)
    }
}

impl<F, T> ExitTransform for F
where
    F: Fn(Corpus, &StageOptions) -> Result<T> + Send + Sync,
{
    type Output = T;

    fn apply(&self, corpus: Corpus, options: &StageOptions) -> Result<T> {
        self(corpus, options)
    }
}

/// Message from a worker to the dispatcher
#[derive(Debug)]
pub enum WorkerEvent {
    /// A request was answered with 429/503; the worker backs off and retries
    RateLimited {
        segment: SegmentId,
        status: u16,
        retry_after: Option<Duration>,
    },
    /// The segment is done, successfully or not
    Finished {
        segment: SegmentId,
        result: Result<SegmentOutput>,
    },
}

#[derive(Debug)]
pub struct SegmentOutput {
    pub fetched: FetchedSegment,
    pub processed: ProcessedSegment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Accumulated output reached the target size
    TargetReached,
    /// The external cancellation token fired
    Interrupted,
}

#[derive(Debug, Default)]
struct BatchStats {
    segments: usize,
    records: usize,
    downloaded: u64,
    discarded: usize,
    rate_limited: usize,
}

/// Shared, read-only state of the workers of one batch
struct WorkerContext {
    fetcher: SegmentFetcher,
    normalizer: Arc<TextNormalizer>,
    options: ProcessOptions,
    base_url: String,
    max_retries: u32,
    retry_backoff: Duration,
    keep_segments: bool,
    /// Batch token: fires on external cancellation, early stop or failure
    cancel: CancellationToken,
    /// Caller's token: distinguishes interruption from internal stops
    external: CancellationToken,
}

impl WorkerContext {
    async fn run_segment(&self, segment: &SegmentId, events: &mpsc::Sender<WorkerEvent>) -> Result<SegmentOutput> {
        let paths = self.fetcher.paths_for(segment);
        let result = self.fetch_and_process(segment, &paths, events).await;

        let cleanup = match &result {
            Ok(_) if self.keep_segments => false,
            Ok(_) => true,
            // Stopped by the batch itself (target reached or sibling failure)
            Err(e) if e.is_interrupted() => !self.external.is_cancelled(),
            Err(_) => false,
        };

        if cleanup {
            if let Err(e) = paths.remove() {
                warn!(segment = %segment, error = %e, "Failed to remove working files");
            }
        } else if result.is_err() {
            for path in paths.leftovers() {
                warn!(segment = %segment, path = %path.display(), "Working file left behind");
            }
        }

        result
    }

    async fn fetch_and_process(
        &self,
        segment: &SegmentId,
        paths: &SegmentPaths,
        events: &mpsc::Sender<WorkerEvent>,
    ) -> Result<SegmentOutput> {
        let url = segment.url(&self.base_url);
        let mut attempt: u32 = 0;

        let fetched = loop {
            match self.fetcher.fetch(&url, paths, &self.cancel).await {
                Ok(fetched) => break fetched,
                Err(FetchError::RateLimited {
                    url,
                    status,
                    retry_after,
                }) => {
                    // The dispatcher may already be gone; that only matters for throttling
                    let _ = events
                        .send(WorkerEvent::RateLimited {
                            segment: segment.clone(),
                            status,
                            retry_after,
                        })
                        .await;

                    if attempt >= self.max_retries {
                        return Err(FetchError::RateLimited {
                            url,
                            status,
                            retry_after,
                        }
                        .into());
                    }

                    let backoff = retry_after.unwrap_or_else(|| {
                        self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt))
                    });
                    attempt += 1;
                    warn!(
                        segment = %segment,
                        status,
                        attempt,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Segment request rate limited, retrying"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(CorpusError::interrupted("download", None));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                },
                Err(FetchError::Failed(e)) => return Err(e),
            }
        };

        let normalizer = Arc::clone(&self.normalizer);
        let options = self.options.clone();
        let cancel = self.cancel.clone();
        let path = fetched.path.clone();
        let processed = tokio::task::spawn_blocking(move || normalizer.process(&path, &options, &cancel))
            .await
            .map_err(|e| anyhow::anyhow!("Extraction task failed: {}", e))??;

        debug!(
            segment = %segment,
            records = processed.records,
            bytes = processed.corpus.len_bytes(),
            "Segment cleaned"
        );

        Ok(SegmentOutput { fetched, processed })
    }
}

async fn run_worker(
    worker: usize,
    ctx: Arc<WorkerContext>,
    jobs: Arc<Mutex<mpsc::Receiver<SegmentId>>>,
    events: mpsc::Sender<WorkerEvent>,
) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some(segment) = next else {
            break;
        };

        debug!(worker, segment = %segment, "Worker picked up segment");
        let result = ctx.run_segment(&segment, &events).await;
        if events.send(WorkerEvent::Finished { segment, result }).await.is_err() {
            break;
        }
    }
    debug!(worker, "Worker exiting");
}

/// Runs batches of segment acquisition for one configuration
pub struct SegmentDispatcher<E = Identity> {
    config: Arc<IngestConfig>,
    planner: WorkloadPlanner,
    plan: WorkloadPlan,
    index: Arc<dyn IndexProvider>,
    predicate: Option<Arc<dyn SegmentPredicate>>,
    fetcher: SegmentFetcher,
    normalizer: Arc<TextNormalizer>,
    exit_transform: E,
    cancel: CancellationToken,
}

impl SegmentDispatcher<Identity> {
    pub fn builder(config: IngestConfig) -> SegmentDispatcherBuilder<Identity> {
        SegmentDispatcherBuilder {
            config,
            planner: None,
            index: None,
            predicate: None,
            cleaning: None,
            exit_transform: Identity,
            cancel: None,
        }
    }
}

impl<E: ExitTransform> SegmentDispatcher<E> {
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Plan validated at construction
    pub fn plan(&self) -> &WorkloadPlan {
        &self.plan
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ordered list of index entries accepted by the predicate
    pub async fn select_segments(&self) -> Result<Vec<SegmentId>> {
        index::select_segments(self.index.as_ref(), self.predicate.as_deref()).await
    }

    /// Acquire one corpus batch.
    ///
    /// `size_override` replaces the target size for this batch only; the
    /// base plan is left untouched. `options` reach the custom cleaning stage
    /// and the exit transform.
    pub async fn run_batch(&self, size_override: Option<u64>, options: &StageOptions) -> Result<E::Output> {
        let plan = match size_override {
            Some(size_mb) => self.planner.validate(self.plan.mode, self.plan.unit_count, size_mb)?,
            None => self.plan,
        };

        let segments = self.select_segments().await?;
        let corpus = self.collect(&plan, segments, options).await?;
        self.exit_transform.apply(corpus, options)
    }

    async fn collect(&self, plan: &WorkloadPlan, selected: Vec<SegmentId>, options: &StageOptions) -> Result<Corpus> {
        let started = Instant::now();
        let required = usize::try_from(plan.unit_count).unwrap_or(usize::MAX);
        let available = selected.len();
        let target_bytes = plan.target_bytes();
        let mut pending: VecDeque<SegmentId> = selected.into_iter().take(required).collect();

        let worker_count = self
            .config
            .max_concurrency
            .unwrap_or(required)
            .min(pending.len());

        info!(
            mode = %plan.mode,
            units = plan.unit_count,
            target_mb = plan.target_total_mb,
            available,
            workers = worker_count,
            "Starting batch"
        );

        let batch_cancel = self.cancel.child_token();
        let mut process_options = self.process_options();
        process_options.stage_options = options.clone();
        let ctx = Arc::new(WorkerContext {
            fetcher: self.fetcher.clone(),
            normalizer: Arc::clone(&self.normalizer),
            options: process_options,
            base_url: self.config.base_url.clone(),
            max_retries: self.config.max_retries,
            retry_backoff: self.config.retry_backoff(),
            keep_segments: self.config.keep_segments,
            cancel: batch_cancel.clone(),
            external: self.cancel.clone(),
        });

        let (job_tx, job_rx) = mpsc::channel::<SegmentId>(worker_count.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(worker_count.max(1) * 2);

        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            workers.spawn(run_worker(worker, Arc::clone(&ctx), Arc::clone(&job_rx), event_tx.clone()));
        }
        // Only workers hold senders, so the channel closes once they all exit
        drop(event_tx);

        let progress = self.fetcher.progress().batch(pending.len() as u64);
        let mut throttle = RequestThrottle::new(self.config.inter_request_delay(), self.config.max_request_delay());
        let mut job_tx = Some(job_tx);
        let mut buffer = CorpusBuffer::new(self.normalizer.split_lines());
        let mut stats = BatchStats::default();
        let mut busy = 0usize;
        let mut stop: Option<Stop> = None;
        let mut failure: Option<CorpusError> = None;

        loop {
            let halted = stop.is_some() || failure.is_some();
            if halted || pending.is_empty() {
                // Closing the queue lets idle workers exit
                job_tx = None;
            }
            let can_dispatch = !halted && busy < worker_count && !pending.is_empty();
            let slot = throttle.next_slot();

            tokio::select! {
                biased;

                _ = batch_cancel.cancelled(), if !halted => {
                    info!(in_flight = busy, "Batch interrupted");
                    stop = Some(Stop::Interrupted);
                }

                event = event_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    match event {
                        WorkerEvent::RateLimited { segment, status, retry_after } => {
                            stats.rate_limited += 1;
                            let delay = throttle.escalate(retry_after);
                            debug!(segment = %segment, status, delay_ms = delay.as_millis() as u64, "Throttle escalated");
                        },
                        WorkerEvent::Finished { segment, result } => {
                            busy = busy.saturating_sub(1);
                            progress.inc(1);
                            match result {
                                Ok(output) => {
                                    let keep = match stop {
                                        None => true,
                                        Some(Stop::Interrupted) => self.config.interrupt_policy == InterruptPolicy::KeepPartial,
                                        Some(Stop::TargetReached) => false,
                                    } && failure.is_none();

                                    if !keep {
                                        stats.discarded += 1;
                                        debug!(segment = %segment, "Discarding output of stopped segment");
                                        continue;
                                    }

                                    throttle.relax();
                                    stats.segments += 1;
                                    stats.records += output.processed.records;
                                    stats.downloaded += output.fetched.compressed_bytes;
                                    buffer.push(output.processed.corpus);

                                    if stop.is_none() && buffer.len_bytes() as u64 >= target_bytes {
                                        info!(
                                            bytes = buffer.len_bytes(),
                                            target_bytes,
                                            in_flight = busy,
                                            "Target size reached, stopping batch"
                                        );
                                        stop = Some(Stop::TargetReached);
                                        batch_cancel.cancel();
                                    }
                                },
                                Err(e) if e.is_interrupted() => {
                                    debug!(segment = %segment, "Segment interrupted");
                                },
                                Err(e) => {
                                    if failure.is_none() && stop != Some(Stop::TargetReached) {
                                        error!(segment = %segment, error = %e, "Segment failed, aborting batch");
                                        batch_cancel.cancel();
                                        failure = Some(e);
                                    } else {
                                        debug!(segment = %segment, error = %e, "Ignoring failure after batch stop");
                                    }
                                },
                            }
                        },
                    }
                }

                _ = tokio::time::sleep_until(slot), if can_dispatch => {
                    if let (Some(tx), Some(segment)) = (&job_tx, pending.pop_front()) {
                        debug!(segment = %segment, "Dispatching segment");
                        if tx.send(segment).await.is_ok() {
                            busy += 1;
                            throttle.mark_dispatched();
                        }
                    }
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() && failure.is_none() {
                    failure = Some(anyhow::anyhow!("Segment worker panicked: {}", e).into());
                }
            }
        }
        progress.finish_and_clear();

        if let Some(err) = failure {
            return Err(err);
        }

        let interrupted = match stop {
            Some(Stop::Interrupted) => {
                if self.config.interrupt_policy == InterruptPolicy::Abort {
                    warn!(segments = stats.segments, "Batch aborted by interruption");
                    return Err(CorpusError::interrupted("batch", None));
                }
                warn!(
                    segments = stats.segments,
                    bytes = buffer.len_bytes(),
                    "Returning partial corpus after interruption"
                );
                true
            },
            Some(Stop::TargetReached) => {
                let pruned = buffer.truncate_to(usize::try_from(target_bytes).unwrap_or(usize::MAX));
                if pruned > 0 {
                    debug!(pruned, "Pruned overshoot past target size");
                }
                false
            },
            None => {
                if available < required {
                    return Err(CorpusError::InsufficientData { required, available });
                }
                false
            },
        };

        info!(
            segments = stats.segments,
            records = stats.records,
            downloaded = %format_bytes(stats.downloaded),
            corpus = %format_bytes(buffer.len_bytes() as u64),
            discarded = stats.discarded,
            rate_limited = stats.rate_limited,
            interrupted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch complete"
        );

        Ok(buffer.finish())
    }

    fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            encoding: self.config.encoding,
            decode_policy: self.config.decode_policy,
            interrupt_policy: self.config.interrupt_policy,
            include_warcinfo: self.config.include_warcinfo,
            stage_options: StageOptions::new(),
        }
    }
}

/// Builder for [`SegmentDispatcher`]
pub struct SegmentDispatcherBuilder<E = Identity> {
    config: IngestConfig,
    planner: Option<WorkloadPlanner>,
    index: Option<Arc<dyn IndexProvider>>,
    predicate: Option<Arc<dyn SegmentPredicate>>,
    cleaning: Option<CleaningConfig>,
    exit_transform: E,
    cancel: Option<CancellationToken>,
}

impl<E: ExitTransform> SegmentDispatcherBuilder<E> {
    /// Planner with a custom estimate or mode set (default: 300MB, immediate only)
    pub fn planner(mut self, planner: WorkloadPlanner) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Segment source (default: the crawl's `wet.paths.gz`)
    pub fn index(mut self, index: impl IndexProvider + 'static) -> Self {
        self.index = Some(Arc::new(index));
        self
    }

    pub fn predicate(mut self, predicate: impl SegmentPredicate + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Cleaning pipeline with hooks (default: built from `config.cleaning`)
    pub fn cleaning(mut self, cleaning: CleaningConfig) -> Self {
        self.cleaning = Some(cleaning);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn exit_transform<T: ExitTransform>(self, exit_transform: T) -> SegmentDispatcherBuilder<T> {
        SegmentDispatcherBuilder {
            config: self.config,
            planner: self.planner,
            index: self.index,
            predicate: self.predicate,
            cleaning: self.cleaning,
            exit_transform,
            cancel: self.cancel,
        }
    }

    /// Validate configuration and plan; no network activity happens here
    pub fn build(self) -> Result<SegmentDispatcher<E>> {
        self.config.validate()?;

        let planner = match self.planner {
            Some(planner) => planner,
            None => WorkloadPlanner::new(self.config.segment_estimate_mb, [CrawlMode::Immediate])?,
        };
        let plan = planner.validate(self.config.mode, self.config.unit_count, self.config.target_size_mb)?;

        let cleaning = self
            .cleaning
            .unwrap_or_else(|| CleaningConfig::from(&self.config.cleaning));
        let normalizer = Arc::new(TextNormalizer::new(cleaning)?);

        let client = build_client(&self.config)?;
        let index: Arc<dyn IndexProvider> = match self.index {
            Some(index) => index,
            None => Arc::new(CrawlIndex::new(
                client.clone(),
                self.config.base_url.clone(),
                self.config.crawl_id.clone(),
            )),
        };
        let fetcher = SegmentFetcher::with_client(
            client,
            self.config.work_dir.clone(),
            ProgressDisplay::new(self.config.show_progress),
        );

        debug!(?plan, "Dispatcher ready");

        Ok(SegmentDispatcher {
            config: Arc::new(self.config),
            planner,
            plan,
            index,
            predicate: self.predicate,
            fetcher,
            normalizer,
            exit_transform: self.exit_transform,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::StaticIndex;

    fn config() -> IngestConfig {
        IngestConfig::builder()
            .unit_count(1)
            .target_size_mb(1)
            .inter_request_delay_ms(0)
            .work_dir(std::env::temp_dir().join("wetcorpus-unit"))
            .build()
    }

    #[test]
    fn test_build_rebalances_plan() {
        let config = IngestConfig::builder().unit_count(1).target_size_mb(1000).build();
        let dispatcher = SegmentDispatcher::builder(config)
            .index(StaticIndex::default())
            .build()
            .unwrap();
        assert_eq!(dispatcher.plan().unit_count, 4);
        assert!(dispatcher.plan().rebalanced);
    }

    #[test]
    fn test_build_rejects_unsupported_mode() {
        let config = IngestConfig::builder().mode(CrawlMode::Dataset).build();
        let err = SegmentDispatcher::builder(config).build().err().unwrap();
        assert!(matches!(err, CorpusError::Config(_)));
    }

    #[test]
    fn test_build_rejects_bad_cleaning_pattern() {
        let cleaning = CleaningConfig {
            retained_chars: "[".to_string(),
            ..CleaningConfig::default()
        };
        let result = SegmentDispatcher::builder(config()).cleaning(cleaning).build();
        assert!(matches!(result, Err(CorpusError::Config(_))));
    }

    #[test]
    fn test_identity_and_closure_transforms() {
        let options = StageOptions::new();
        let corpus = Corpus::Text("abc".to_string());
        assert_eq!(Identity.apply(corpus.clone(), &options).unwrap(), corpus);

        let count = |corpus: Corpus, _: &StageOptions| -> Result<usize> { Ok(corpus.len_bytes()) };
        assert_eq!(count.apply(corpus, &options).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_select_segments_applies_predicate() {
        let dispatcher = SegmentDispatcher::builder(config())
            .index(StaticIndex::new(["keep/a.warc.wet.gz", "drop/b.warc.wet.gz", "keep/c.warc.wet.gz"]))
            .predicate(|s: &SegmentId| s.as_str().starts_with("keep/"))
            .build()
            .unwrap();
        let selected = dispatcher.select_segments().await.unwrap();
        assert_eq!(
            selected,
            vec![SegmentId::from("keep/a.warc.wet.gz"), SegmentId::from("keep/c.warc.wet.gz")]
        );
    }

    #[tokio::test]
    async fn test_empty_index_is_insufficient() {
        let dispatcher = SegmentDispatcher::builder(config())
            .index(StaticIndex::default())
            .build()
            .unwrap();
        let err = dispatcher.run_batch(None, &StageOptions::new()).await.unwrap_err();
        assert!(matches!(
            err,
            CorpusError::InsufficientData {
                required: 1,
                available: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_returns_partial() {
        let token = CancellationToken::new();
        token.cancel();
        let dispatcher = SegmentDispatcher::builder(config())
            .index(StaticIndex::new(["http://127.0.0.1:9/never.warc.wet.gz"]))
            .cancellation(token)
            .build()
            .unwrap();
        let corpus = dispatcher.run_batch(None, &StageOptions::new()).await.unwrap();
        assert!(corpus.is_empty());
    }
}
