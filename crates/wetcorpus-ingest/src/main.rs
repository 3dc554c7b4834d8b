//! wetcorpus Ingest - corpus acquisition tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wetcorpus_common::logging::{init_logging, LogConfig, LogLevel};
use wetcorpus_ingest::{
    IngestConfig, PatternPredicate, SegmentDispatcher, SegmentDispatcherBuilder, StageOptions,
};

#[derive(Parser, Debug)]
#[command(name = "wetcorpus-ingest")]
#[command(author, version, about = "Build text corpora from Common Crawl WET segments")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the segments a batch would draw from
    Segments {
        /// Regular expression the segment path must match
        #[arg(short, long)]
        pattern: Option<String>,

        /// Crawl to read the index of (e.g. CC-MAIN-2023-23)
        #[arg(long)]
        crawl: Option<String>,
    },

    /// Fetch segments and write the cleaned corpus
    Fetch {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of segments to fetch
        #[arg(short, long)]
        units: Option<u64>,

        /// Target corpus size in MB
        #[arg(short, long = "size-mb")]
        size_mb: Option<u64>,

        /// Regular expression the segment path must match
        #[arg(short, long)]
        pattern: Option<String>,

        /// Crawl to read the index of (e.g. CC-MAIN-2023-23)
        #[arg(long)]
        crawl: Option<String>,

        /// Emit one cleaned line per output line
        #[arg(long)]
        split_lines: bool,

        /// Do not strip HTML tags
        #[arg(long)]
        keep_html: bool,

        /// Do not filter characters
        #[arg(long)]
        keep_all_chars: bool,

        /// Character-class body of the characters to keep
        #[arg(long)]
        retain: Option<String>,

        /// Minimum delay between segment requests in milliseconds
        #[arg(long = "delay-ms")]
        delay_ms: Option<u64>,

        /// Show download progress bars
        #[arg(long)]
        progress: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("wetcorpus-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::default().merge_env()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Segments { pattern, crawl } => {
            if let Some(crawl) = crawl {
                config.crawl_id = crawl;
            }
            let dispatcher = with_pattern(SegmentDispatcher::builder(config), pattern.as_deref())?
                .cancellation(cancel)
                .build()?;
            let segments = dispatcher.select_segments().await?;
            for segment in &segments {
                println!("{}", segment);
            }
            info!(count = segments.len(), "Listed segments");
        },
        Command::Fetch {
            output,
            units,
            size_mb,
            pattern,
            crawl,
            split_lines,
            keep_html,
            keep_all_chars,
            retain,
            delay_ms,
            progress,
        } => {
            if let Some(units) = units {
                config.unit_count = units;
            }
            if let Some(size_mb) = size_mb {
                config.target_size_mb = size_mb;
            }
            if let Some(crawl) = crawl {
                config.crawl_id = crawl;
            }
            if let Some(delay_ms) = delay_ms {
                config.inter_request_delay_ms = delay_ms;
                config.max_request_delay_ms = config.max_request_delay_ms.max(delay_ms);
            }
            if let Some(retain) = retain {
                config.cleaning.retained_chars = retain;
            }
            config.cleaning.split_lines |= split_lines;
            config.cleaning.remove_html &= !keep_html;
            config.cleaning.strip_non_language_chars &= !keep_all_chars;
            config.show_progress |= progress;

            let dispatcher = with_pattern(SegmentDispatcher::builder(config), pattern.as_deref())?
                .cancellation(cancel)
                .build()?;

            info!(
                units = dispatcher.plan().unit_count,
                target_mb = dispatcher.plan().target_total_mb,
                "Fetching corpus"
            );

            let corpus = dispatcher.run_batch(None, &StageOptions::new()).await?;
            let bytes = corpus.len_bytes();
            let mut text = corpus.into_text();
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }

            match output {
                Some(path) => {
                    tokio::fs::write(&path, text)
                        .await
                        .with_context(|| format!("Failed to write corpus to {}", path.display()))?;
                    info!(path = %path.display(), bytes, "Corpus written");
                },
                None => print!("{}", text),
            }
        },
    }

    Ok(())
}

fn with_pattern(builder: SegmentDispatcherBuilder, pattern: Option<&str>) -> Result<SegmentDispatcherBuilder> {
    Ok(match pattern {
        Some(pattern) => builder.predicate(PatternPredicate::new(pattern)?),
        None => builder,
    })
}
