//! Run statistics
//!
//! One [`StatsReporter`] per worker owns the run counters. The manager feeds
//! it after every round; readers (the CLI progress display, tests) observe it
//! through a cloneable [`StatsHandle`].
//!
//! Every report interval, and whenever a range finishes, the reporter logs the
//! current range, the overall totals and the processing rate. It can also
//! write the latest snapshot as JSON for external dashboards.

use crate::progress::format_duration;
use crate::store::TokenRange;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default interval between periodic log reports
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Default)]
struct Counters {
    total_items: AtomicU64,
    processed_items: AtomicU64,
    errors: AtomicU64,
    ranges_completed: AtomicU64,
    ranges_requeued: AtomicU64,
    ranges_failed: AtomicU64,
}

/// Run totals at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    pub total_items: u64,
    pub processed_items: u64,
    pub errors: u64,
    pub ranges_completed: u64,
    pub ranges_requeued: u64,
    pub ranges_failed: u64,
}

impl RunTotals {
    /// Items neither processed nor failed
    pub fn skipped(&self) -> u64 {
        self.total_items
            .saturating_sub(self.processed_items + self.errors)
    }
}

/// Latest report, as written to the stats file
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub identity: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub range_id: Option<i64>,
    pub start_token: String,
    pub end_token: String,
    pub range_first_key: String,
    pub range_last_key: String,
    pub range_elapsed_secs: f64,
    pub range_total: u64,
    pub range_processed: u64,
    pub range_errors: u64,
    pub range_skipped: u64,
    pub current_rate: u64,
    pub totals: RunTotals,
    pub total_skipped: u64,
    pub total_duration_secs: f64,
    pub average_rate: u64,
    pub last_key: String,
}

/// Progress of the range being processed
#[derive(Debug, Clone, Copy)]
pub struct RangeProgress<'a> {
    pub range: &'a TokenRange,
    pub total: u64,
    pub processed: u64,
    pub errors: u64,
    pub started: Instant,
    pub last_key: &'a str,
}

/// Read-only view of a reporter
#[derive(Debug, Clone)]
pub struct StatsHandle {
    counters: Arc<Counters>,
    snapshot: Arc<Mutex<StatsSnapshot>>,
}

impl StatsHandle {
    pub fn totals(&self) -> RunTotals {
        let c = &self.counters;
        RunTotals {
            total_items: c.total_items.load(Ordering::Relaxed),
            processed_items: c.processed_items.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            ranges_completed: c.ranges_completed.load(Ordering::Relaxed),
            ranges_requeued: c.ranges_requeued.load(Ordering::Relaxed),
            ranges_failed: c.ranges_failed.load(Ordering::Relaxed),
        }
    }

    /// Latest report snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot.lock().clone()
    }
}

/// Per-worker statistics owner
#[derive(Debug)]
pub struct StatsReporter {
    identity: String,
    counters: Arc<Counters>,
    snapshot: Arc<Mutex<StatsSnapshot>>,
    started: Instant,
    report_interval: Duration,
    last_report: Option<(Instant, u64)>,
    stats_file: Option<PathBuf>,
}

impl StatsReporter {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            counters: Arc::new(Counters::default()),
            snapshot: Arc::new(Mutex::new(StatsSnapshot::default())),
            started: Instant::now(),
            report_interval: DEFAULT_REPORT_INTERVAL,
            last_report: None,
            stats_file: None,
        }
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Also write every snapshot to this JSON file
    pub fn with_stats_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_file = Some(path.into());
        self
    }

    pub fn handle(&self) -> StatsHandle {
        StatsHandle {
            counters: Arc::clone(&self.counters),
            snapshot: Arc::clone(&self.snapshot),
        }
    }

    pub fn totals(&self) -> RunTotals {
        self.handle().totals()
    }

    /// Zero the counters and restart the run clock
    pub fn reset_counters(&mut self) {
        let c = &self.counters;
        for counter in [
            &c.total_items,
            &c.processed_items,
            &c.errors,
            &c.ranges_completed,
            &c.ranges_requeued,
            &c.ranges_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.started = Instant::now();
        self.last_report = None;
    }

    /// Add the results of one round
    pub fn add_items(&self, total: u64, processed: u64, errors: u64) {
        self.counters.total_items.fetch_add(total, Ordering::Relaxed);
        self.counters.processed_items.fetch_add(processed, Ordering::Relaxed);
        self.counters.errors.fetch_add(errors, Ordering::Relaxed);
    }

    pub fn range_completed(&self) {
        self.counters.ranges_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn range_requeued(&self) {
        self.counters.ranges_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn range_failed(&self) {
        self.counters.ranges_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the snapshot; log it when forced or when the interval elapsed
    pub fn report(&mut self, force: bool, progress: &RangeProgress<'_>) {
        let now = Instant::now();
        let totals = self.totals();

        let (last_time, last_total) = self.last_report.unwrap_or((progress.started, totals.total_items));
        let since_last = now.duration_since(last_time).as_secs_f64();
        let current_rate = if since_last > 0.0 {
            (totals.total_items.saturating_sub(last_total) as f64 / since_last).round() as u64
        } else {
            0
        };
        let run_secs = now.duration_since(self.started).as_secs_f64();
        let average_rate = if run_secs > 0.0 {
            (totals.total_items as f64 / run_secs).round() as u64
        } else {
            0
        };

        let snapshot = StatsSnapshot {
            identity: self.identity.clone(),
            timestamp: Some(Utc::now()),
            range_id: Some(progress.range.id),
            start_token: progress.range.start_token.clone(),
            end_token: progress.range.end_token.clone(),
            range_first_key: progress.range.first_key.clone(),
            range_last_key: progress.range.last_key.clone(),
            range_elapsed_secs: now.duration_since(progress.started).as_secs_f64(),
            range_total: progress.total,
            range_processed: progress.processed,
            range_errors: progress.errors,
            range_skipped: progress.total.saturating_sub(progress.processed + progress.errors),
            current_rate,
            totals,
            total_skipped: totals.skipped(),
            total_duration_secs: run_secs,
            average_rate,
            last_key: progress.last_key.to_string(),
        };

        let due = self
            .last_report
            .map(|(at, _)| now.duration_since(at) >= self.report_interval)
            .unwrap_or(true);
        if force || due {
            self.last_report = Some((now, totals.total_items));
            log_report(&snapshot);
        }

        if let Some(path) = &self.stats_file {
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    if let Err(e) = fs::write(path, json) {
                        warn!(path = %path.display(), error = %e, "Failed to write stats file");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize stats"),
            }
        }

        *self.snapshot.lock() = snapshot;
    }
}

fn log_report(s: &StatsSnapshot) {
    info!(
        range_id = s.range_id,
        "CURRENT RANGE: Run time {}, Processed {} of {} items, {} errors",
        format_duration(Duration::from_secs_f64(s.range_elapsed_secs)),
        s.range_processed,
        s.range_total,
        s.range_errors
    );
    info!(
        "OVERALL: Run time {}, Processed {} of {} items, {} errors",
        format_duration(Duration::from_secs_f64(s.total_duration_secs)),
        s.totals.processed_items,
        s.totals.total_items,
        s.totals.errors
    );
    info!(
        last_key = %s.last_key,
        "Current rate: {} items/second, Average rate: {} items/second",
        s.current_rate,
        s.average_rate
    );
}
