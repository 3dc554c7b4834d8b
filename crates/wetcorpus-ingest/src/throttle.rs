//! Request spacing for segment downloads
//!
//! Segment requests start at least `current` apart. Rate-limit responses
//! double the spacing (or jump to `Retry-After`) up to a ceiling; clean
//! completions halve it back toward the configured base.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const MIN_ESCALATED_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RequestThrottle {
    base: Duration,
    current: Duration,
    max: Duration,
    last_dispatch: Option<Instant>,
}

impl RequestThrottle {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            current: base,
            max,
            last_dispatch: None,
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }

    /// Earliest instant the next request may start
    pub fn next_slot(&self) -> Instant {
        match self.last_dispatch {
            Some(last) => last + self.current,
            None => Instant::now(),
        }
    }

    pub fn mark_dispatched(&mut self) {
        self.last_dispatch = Some(Instant::now());
    }

    /// Widen the spacing after a 429/503; returns the new delay
    pub fn escalate(&mut self, retry_after: Option<Duration>) -> Duration {
        let doubled = if self.current.is_zero() {
            MIN_ESCALATED_DELAY
        } else {
            self.current.saturating_mul(2)
        };
        let next = doubled.max(retry_after.unwrap_or_default()).min(self.max);
        if next > self.current {
            warn!(
                from_ms = self.current.as_millis() as u64,
                to_ms = next.as_millis() as u64,
                "Rate limited, increasing request delay"
            );
            self.current = next;
        }
        self.current
    }

    /// Step back toward the base delay after a successful segment
    pub fn relax(&mut self) {
        if self.current > self.base {
            self.current = (self.current / 2).max(self.base);
            debug!(delay_ms = self.current.as_millis() as u64, "Relaxed request delay");
        }
    }
}
