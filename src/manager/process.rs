//! The batch loop
//!
//! Each round fetches the next batch of keys from the last key seen up to the
//! range's last key, hands it to the processor, records progress and a
//! heartbeat, and lets the tuner time the round.
//!
//! The data store returns both boundary keys inclusively:
//! - every round after the first starts with the previous round's final key,
//!   so one extra key is requested and the leading duplicate dropped
//! - the range's last key belongs to the next range and is never dispatched
//!
//! A round that reports any error ends the range. Processor errors and
//! transient data-store errors requeue it; fatal processor errors and
//! non-transient data-store errors fail it.

use super::refresh::reconnect;
use super::{RangeManager, RangeOutcome};
use crate::error::{Result, RingError, SourceError, SourceResult};
use crate::processor::{ProcessMode, ProcessorError, RangeContext, RangeProcessor};
use crate::source::{ColumnSelection, Item, Keyspace};
use crate::stats::{RangeProgress, RunTotals};
use crate::store::{RangeCounters, RequeueOutcome, TokenRange};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a round ended the range early
#[derive(Debug, Clone, PartialEq, Eq)]
enum RoundFailure {
    /// Processor errors; the range is requeued
    Errors(String),
    /// The processor stops on errors; requeue and stop the worker
    Halted(String),
    /// The range cannot be processed
    Fatal(String),
}

/// Result of dispatching one batch
#[derive(Debug, Default)]
struct RoundResult {
    total: u64,
    processed: u64,
    errors: u64,
    failure: Option<RoundFailure>,
}

impl RoundResult {
    /// Count an error; returns true when the rest of the batch must be skipped
    fn record_error(&mut self, err: ProcessorError, stop_on_errors: bool) -> bool {
        self.errors += err.error_count();
        let message = err.to_string();
        error!(error = %message, "Error processing batch");

        if err.is_fatal() {
            self.failure = Some(RoundFailure::Fatal(message));
            return true;
        }
        if stop_on_errors {
            self.failure = Some(RoundFailure::Halted(message));
            return true;
        }
        if self.failure.is_none() {
            self.failure = Some(RoundFailure::Errors(message));
        }
        false
    }
}

/// Hand a batch to the processor through the handler its mode exposes
fn dispatch(processor: &mut dyn RangeProcessor, items: &[Item], stop_on_errors: bool) -> RoundResult {
    let mut round = RoundResult::default();

    match processor.mode() {
        ProcessMode::Batch(handler) => {
            round.total = items.len() as u64;
            match handler.process_batch(items) {
                Ok(processed) => round.processed = processed.min(round.total),
                Err(e) => {
                    round.record_error(e, stop_on_errors);
                }
            }
        }
        ProcessMode::PerItem(handler) => {
            for item in items {
                round.total += 1;
                match handler.process_item(item) {
                    Ok(true) => round.processed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        if round.record_error(e, stop_on_errors) {
                            break;
                        }
                    }
                }
            }
        }
    }

    round
}

impl<K: Keyspace> RangeManager<K> {
    /// Claim and process ranges until the store is drained or shutdown is
    /// requested. Returns this run's totals.
    pub fn process_all(&mut self) -> Result<RunTotals> {
        self.stats.reset_counters();

        loop {
            if self.shutdown_requested() {
                info!("Shutdown requested, not claiming more ranges");
                break;
            }

            let Some(range) = self.claim_next_range()? else {
                info!("Ran out of ranges to process");
                break;
            };

            let range_id = range.id;
            if let RangeOutcome::Halted { message } = self.run_range(range)? {
                return Err(RingError::Halted { range_id, message });
            }
        }

        Ok(self.stats.totals())
    }

    /// Resolve a claimed range's keys, then process it or requeue it
    pub fn run_range(&mut self, mut range: TokenRange) -> Result<RangeOutcome> {
        match self.refresh_keys_for_range(&mut range) {
            Ok(true) => self.process_range(&range),
            Ok(false) => {
                error!(range_id = range.id, "No usable keys for range");
                self.requeue(&range, "No usable boundary keys")
            }
            Err(RingError::Source(e)) => {
                error!(range_id = range.id, error = %e, "Error getting the keys for range");
                self.requeue(&range, &format!("Key refresh failed: {}", e))
            }
            Err(e) => Err(e),
        }
    }

    /// Run the batch loop over a claimed range with resolved keys
    pub fn process_range(&mut self, range: &TokenRange) -> Result<RangeOutcome> {
        info!(
            range_id = range.id,
            first_key = %range.first_key,
            last_key = %range.last_key,
            "Processing range"
        );

        self.tuner.reset();
        let started = Instant::now();
        let columns = self.processor.required_columns();
        let stop_on_errors = self.processor.stop_on_errors();
        let checkpointing = self.processor.should_checkpoint();
        let mut counters = RangeCounters::default();

        let ctx = RangeContext {
            range,
            dry_run: self.config.dry_run,
        };
        if let Err(e) = self.processor.begin_range(&ctx) {
            return if e.is_fatal() {
                self.fail_range(range, &counters, &e.to_string())
            } else {
                self.requeue(range, &e.to_string())
            };
        }

        let mut last_seen = range.first_key.clone();
        let mut resuming = false;

        loop {
            let batch_size = self.tuner.next_batch();
            let requested = if resuming { batch_size + 1 } else { batch_size };

            let fetched = match self.fetch_batch(&last_seen, &range.last_key, requested, &columns) {
                Ok(items) => items,
                Err(e) => {
                    counters.processing_time = started.elapsed().as_secs_f64();
                    error!(range_id = range.id, error = %e, "Error processing range");
                    return if e.is_transient() {
                        self.requeue(range, &e.to_string())
                    } else {
                        self.fail_range(range, &counters, &e.to_string())
                    };
                }
            };
            let fetched_count = fetched.len();
            let mut items = fetched;

            if resuming && items.first().is_some_and(|item| item.key == last_seen) {
                items.remove(0);
            }

            // The range's last key is the first key of the next range
            let mut reached_end = false;
            if !range.last_key.is_empty() && items.last().is_some_and(|item| item.key == range.last_key) {
                items.pop();
                reached_end = true;
            }

            let Some(last_item) = items.last() else {
                debug!(range_id = range.id, "Found no more items in range");
                break;
            };
            let round_last = last_item.key.clone();

            let round = dispatch(self.processor.as_mut(), &items, stop_on_errors);
            counters.total_items += round.total;
            counters.processed_items += round.processed;
            counters.error_count += round.errors;
            counters.processing_time = started.elapsed().as_secs_f64();
            self.stats.add_items(round.total, round.processed, round.errors);

            last_seen = round_last;
            resuming = true;

            if checkpointing {
                if let Some(sink) = self.checkpoint.as_mut() {
                    if let Err(e) = sink.save(&range.first_key, &last_seen) {
                        warn!(range_id = range.id, error = %e, "Failed to save checkpoint");
                    }
                }
            }

            let finished = reached_end || fetched_count < requested;

            if !self.store.record_progress(range, &self.config.identity, &counters)? {
                warn!(range_id = range.id, "Range was reset while processing; dropping it");
                return Ok(RangeOutcome::Released);
            }

            self.stats.report(
                finished || round.failure.is_some(),
                &RangeProgress {
                    range,
                    total: counters.total_items,
                    processed: counters.processed_items,
                    errors: counters.error_count,
                    started,
                    last_key: &last_seen,
                },
            );

            match round.failure {
                Some(RoundFailure::Fatal(message)) => return self.fail_range(range, &counters, &message),
                Some(RoundFailure::Halted(message)) => {
                    self.requeue(range, &message)?;
                    return Ok(RangeOutcome::Halted { message });
                }
                Some(RoundFailure::Errors(message)) => {
                    warn!(
                        range_id = range.id,
                        errors = counters.error_count,
                        "Errors in range, requeueing"
                    );
                    return self.requeue(range, &message);
                }
                None => {}
            }

            if finished {
                break;
            }
        }

        counters.processing_time = started.elapsed().as_secs_f64();
        let range_data = self.processor.range_data();
        if !self
            .store
            .complete(range, &self.config.identity, &counters, range_data.as_ref())?
        {
            warn!(range_id = range.id, "Range was reset before completion");
            return Ok(RangeOutcome::Released);
        }

        self.stats.range_completed();
        info!(
            range_id = range.id,
            total = counters.total_items,
            processed = counters.processed_items,
            secs = format!("{:.2}", counters.processing_time),
            "Range completed"
        );
        Ok(RangeOutcome::Completed {
            total: counters.total_items,
            processed: counters.processed_items,
        })
    }

    /// Next batch of keys with columns, retrying transient failures
    fn fetch_batch(
        &mut self,
        from: &str,
        to: &str,
        limit: usize,
        columns: &ColumnSelection,
    ) -> SourceResult<Vec<Item>> {
        let retry = self.config.retry;
        retry.run_with(
            "get keys",
            &mut self.keyspace,
            |ks| ks.get_keys_between(from, to, limit, columns),
            SourceError::is_transient,
            reconnect,
        )
    }

    /// Return a range to the pool, or fail it when its budget is spent
    fn requeue(&mut self, range: &TokenRange, reason: &str) -> Result<RangeOutcome> {
        let outcome = self
            .store
            .requeue(range, &self.config.identity, reason, self.config.max_requeues)?;

        Ok(match outcome {
            RequeueOutcome::Requeued { requeue_count } => {
                info!(range_id = range.id, requeue_count, "Re-queued range to process later");
                self.stats.range_requeued();
                RangeOutcome::Requeued { requeue_count }
            }
            RequeueOutcome::Failed => {
                warn!(
                    range_id = range.id,
                    max_requeues = self.config.max_requeues,
                    "Range exceeded its requeue limit and was marked failed"
                );
                self.stats.range_failed();
                RangeOutcome::Failed
            }
            RequeueOutcome::NotOwned => {
                warn!(range_id = range.id, "Range no longer owned; not requeued");
                RangeOutcome::Released
            }
        })
    }

    fn fail_range(&mut self, range: &TokenRange, counters: &RangeCounters, message: &str) -> Result<RangeOutcome> {
        error!(range_id = range.id, error = message, "Range failed");
        if self.store.fail(range, &self.config.identity, counters, message)? {
            self.stats.range_failed();
            Ok(RangeOutcome::Failed)
        } else {
            Ok(RangeOutcome::Released)
        }
    }
}
