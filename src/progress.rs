//! Terminal output for the CLI
//!
//! Provides a live spinner fed from the workers' stats handles and the
//! summaries printed by the admin commands.

use crate::stats::{RunTotals, StatsHandle};
use crate::store::{RangeStatus, StatusSummary, TokenRange};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner showing the combined progress of all local workers
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Refresh the message from the workers' handles
    pub fn update(&self, handles: &[StatsHandle], elapsed: Duration) {
        let totals = sum_totals(handles.iter().map(StatsHandle::totals));
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            totals.total_items as f64 / secs
        } else {
            0.0
        };

        let current: Vec<String> = handles
            .iter()
            .filter_map(|h| h.snapshot().range_id)
            .map(|id| id.to_string())
            .collect();

        let msg = format!(
            "Items: {} | Processed: {} | Errors: {} | Ranges done: {} | Requeued: {} | Rate: {:.0}/s | Current: [{}]",
            format_number(totals.total_items),
            format_number(totals.processed_items),
            format_number(totals.errors),
            format_number(totals.ranges_completed),
            format_number(totals.ranges_requeued),
            rate,
            current.join(","),
        );

        self.bar.set_message(msg);
    }

    /// Show a plain status line until the next update
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Add up several workers' totals
pub fn sum_totals(totals: impl IntoIterator<Item = RunTotals>) -> RunTotals {
    totals.into_iter().fold(RunTotals::default(), |acc, t| RunTotals {
        total_items: acc.total_items + t.total_items,
        processed_items: acc.processed_items + t.processed_items,
        errors: acc.errors + t.errors,
        ranges_completed: acc.ranges_completed + t.ranges_completed,
        ranges_requeued: acc.ranges_requeued + t.ranges_requeued,
        ranges_failed: acc.ranges_failed + t.ranges_failed,
    })
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Format a duration as `1h 02m 03s`, `4m 05s` or `6s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Print the result of a `work` run
pub fn print_summary(totals: &RunTotals, duration: Duration, workers: usize) {
    let secs = duration.as_secs_f64();
    let rate = if secs > 0.0 {
        totals.total_items as f64 / secs
    } else {
        0.0
    };

    println!();
    println!("{}", style("Processing Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Workers:").bold(), workers);
    println!(
        "  {} {}",
        style("Ranges processed:").bold(),
        format_number(totals.ranges_completed)
    );
    println!(
        "  {} {} of {}",
        style("Items processed:").bold(),
        format_number(totals.processed_items),
        format_number(totals.total_items)
    );
    println!(
        "  {} {} ({:.0} items/sec)",
        style("Duration:").bold(),
        format_duration(duration),
        rate
    );
    if totals.ranges_requeued > 0 {
        println!(
            "  {} {}",
            style("Requeued:").yellow().bold(),
            format_number(totals.ranges_requeued)
        );
    }
    if totals.errors > 0 || totals.ranges_failed > 0 {
        println!(
            "  {} {} items, {} ranges failed",
            style("Errors:").red().bold(),
            format_number(totals.errors),
            format_number(totals.ranges_failed)
        );
    }
    println!();
}

/// Print the per-status table of `status`
pub fn print_status(summary: &StatusSummary) {
    println!();
    println!("{}", style("Range Status").cyan().bold());
    println!("{}", style("─".repeat(78)).dim());
    println!(
        "  {:<12} {:>10} {:>14} {:>14} {:>11} {:>11}",
        style("Status").bold(),
        style("Ranges").bold(),
        style("Total items").bold(),
        style("Processed").bold(),
        style("Max time").bold(),
        style("Avg time").bold()
    );
    for status in RangeStatus::ALL {
        let Some(entry) = summary.by_status.get(&status) else {
            continue;
        };
        println!(
            "  {:<12} {:>10} {:>14} {:>14} {:>11} {:>11}",
            status.as_str(),
            format_number(entry.ranges),
            format_number(entry.total_items),
            format_number(entry.processed_items),
            format_duration(Duration::from_secs_f64(entry.max_processing_time)),
            format_duration(Duration::from_secs_f64(entry.avg_processing_time)),
        );
    }
    println!("{}", style("─".repeat(78)).dim());
    println!(
        "  {} {}",
        style("Total ranges:").bold(),
        format_number(summary.total_ranges)
    );
    println!(
        "  {} {}",
        style("Total requeues:").bold(),
        format_number(summary.total_requeues)
    );
    if !summary.processing_hosts.is_empty() {
        println!(
            "  {} {}",
            style("Processing on:").bold(),
            summary.processing_hosts.join(", ")
        );
    }
    println!();
}

/// Print a table of ranges (failed or requeued listings)
pub fn print_ranges(title: &str, ranges: &[TokenRange]) {
    println!("{}", style(title).bold());
    println!(
        "  {:>8}  {:<24} {:>8}  {}",
        style("id").bold(),
        style("host").bold(),
        style("requeues").bold(),
        style("error").bold()
    );
    for range in ranges {
        println!(
            "  {:>8}  {:<24} {:>8}  {}",
            range.id,
            range.host(),
            range.requeue_count,
            range.error.as_deref().unwrap_or("")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(6)), "6s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4m 05s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn test_sum_totals() {
        let a = RunTotals {
            total_items: 2,
            processed_items: 1,
            ..Default::default()
        };
        let b = RunTotals {
            total_items: 3,
            ranges_completed: 1,
            ..Default::default()
        };
        let sum = sum_totals([a, b]);
        assert_eq!(sum.total_items, 5);
        assert_eq!(sum.processed_items, 1);
        assert_eq!(sum.ranges_completed, 1);
    }

    #[test]
    fn test_status_replaced_by_update() {
        let reporter = ProgressReporter::new();
        reporter.set_status("Connecting 2 worker(s)...");
        assert_eq!(reporter.bar.message(), "Connecting 2 worker(s)...");

        reporter.update(&[], Duration::from_secs(1));
        assert!(reporter.bar.message().starts_with("Items: 0"));
        reporter.finish_and_clear();
    }
}
