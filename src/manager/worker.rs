//! Worker threads
//!
//! Each worker runs one [`RangeManager`] on a named thread inside a `worker`
//! tracing span. Workers share nothing but the range store, so a thread
//! behaves exactly like a separate process with the same identity.

use super::RangeManager;
use crate::error::{Result, RingError};
use crate::source::Keyspace;
use crate::stats::{RunTotals, StatsHandle};
use std::thread::{self, JoinHandle};
use tracing::{error, info, info_span};

/// A running worker thread
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<Result<RunTotals>>>,
    stats: StatsHandle,
}

impl Worker {
    /// Spawn a thread that runs `manager.process_all()`
    pub fn spawn<K>(name: impl Into<String>, mut manager: RangeManager<K>) -> Result<Self>
    where
        K: Keyspace + 'static,
    {
        let name = name.into();
        let stats = manager.stats().handle();
        let span_name = name.clone();

        let handle = thread::Builder::new()
            .name(format!("ring-{}", name))
            .spawn(move || {
                let span = info_span!("worker", instance = %span_name);
                let _guard = span.enter();

                info!(identity = %manager.identity(), "Worker started");
                let result = manager.process_all();
                match &result {
                    Ok(totals) => info!(
                        ranges = totals.ranges_completed,
                        items = totals.total_items,
                        "Worker finished"
                    ),
                    Err(e) => error!(error = %e, "Worker stopped"),
                }
                result
            })?;

        Ok(Self {
            name,
            handle: Some(handle),
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live view of the worker's counters
    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<RunTotals> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| RingError::WorkerPanicked {
                name: self.name.clone(),
            })?,
            None => Ok(self.stats.totals()),
        }
    }
}
