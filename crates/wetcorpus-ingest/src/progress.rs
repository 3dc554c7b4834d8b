//! Progress indicators for segment downloads and batch runs

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const DOWNLOAD_TEMPLATE: &str =
    "{msg:30!} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})";
const STREAM_TEMPLATE: &str = "{spinner:.green} {msg:30!} [{elapsed_precise}] {bytes} ({bytes_per_sec})";
const BATCH_TEMPLATE: &str = "{msg} [{elapsed_precise}] [{wide_bar:.green}] {pos}/{len} segments";

/// Shared progress area; every concurrent download gets its own bar.
///
/// When disabled all bars are hidden, so callers never branch on it.
#[derive(Debug, Clone)]
pub struct ProgressDisplay {
    multi: MultiProgress,
    enabled: bool,
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new(false)
    }
}

fn style(template: &str, fallback: ProgressStyle) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or(fallback)
}

impl ProgressDisplay {
    pub fn new(enabled: bool) -> Self {
        let multi = if enabled {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self { multi, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bar for one segment download; a spinner when the size is unknown
    pub fn download(&self, size: Option<u64>, message: &str) -> ProgressBar {
        let pb = match size {
            Some(size) => ProgressBar::new(size)
                .with_style(style(DOWNLOAD_TEMPLATE, ProgressStyle::default_bar())),
            None => ProgressBar::new_spinner()
                .with_style(style(STREAM_TEMPLATE, ProgressStyle::default_spinner())),
        };
        let pb = self.multi.add(pb);
        pb.set_message(message.to_string());
        pb
    }

    /// Bar counting finished segments of a batch
    pub fn batch(&self, segments: u64) -> ProgressBar {
        let pb = self.multi.add(
            ProgressBar::new(segments).with_style(style(BATCH_TEMPLATE, ProgressStyle::default_bar())),
        );
        pb.set_message("batch");
        pb
    }
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
