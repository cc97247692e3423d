//! Range lifecycle orchestration
//!
//! A [`RangeManager`] is one worker. It owns its own store connection, its own
//! keyspace connection, a processor and a stats reporter, and drives ranges
//! through `claim → refresh keys → batch loop → complete | requeue | fail`.
//!
//! Workers never talk to each other. The range store is the only shared
//! state, and every claim is a single conditional update, so any number of
//! managers (threads or processes) can run against one store.
//!
//! - `claim`: resumption and windowed claiming
//! - `refresh`: boundary key resolution
//! - `process`: the batch loop and outcome routing
//! - `admin`: operator commands and data-store tools
//! - `worker`: named worker threads for multi-instance runs

mod admin;
mod claim;
mod process;
mod refresh;
mod worker;

pub use admin::{count_range, get_keys, KeysNearTokens, RangeAdmin};
pub use worker::Worker;

use crate::error::{ConfigError, Result};
use crate::processor::{CheckpointSink, FileCheckpoint, RangeProcessor};
use crate::retry::RetryPolicy;
use crate::source::Keyspace;
use crate::stats::{StatsReporter, DEFAULT_REPORT_INTERVAL};
use crate::store::{RangeStore, DEFAULT_MAX_REQUEUES};
use crate::token::{Partitioner, TokenBounds};
use crate::tuner::{BatchSizeTuner, TunerSettings};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Settings of one worker
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Claim owner identity (`host|instN`)
    pub identity: String,

    /// Ring bounds used when building ranges
    pub bounds: TokenBounds,

    /// Requeues allowed before a range is failed
    pub max_requeues: u32,

    /// Batch size tuning; a processor's declared size bounds override these
    pub tuner: TunerSettings,

    /// Passed to processors, which must not write anything when set
    pub dry_run: bool,

    /// Retry policy for data-store calls
    pub retry: RetryPolicy,

    /// Directory for the stats file and checkpoints
    pub stats_dir: Option<PathBuf>,

    /// Interval between periodic stats reports
    pub report_interval: Duration,
}

impl ManagerConfig {
    pub fn new(identity: impl Into<String>, bounds: TokenBounds) -> Self {
        Self {
            identity: identity.into(),
            bounds,
            max_requeues: DEFAULT_MAX_REQUEUES,
            tuner: TunerSettings::default(),
            dry_run: false,
            retry: RetryPolicy::default(),
            stats_dir: None,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    /// Config with the bounds of a partitioner
    pub fn for_partitioner(identity: impl Into<String>, partitioner: Partitioner) -> Self {
        Self::new(identity, partitioner.bounds())
    }

    /// File-name-safe form of the identity
    pub fn file_safe_identity(&self) -> String {
        self.identity
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    /// Stats reporter for this worker, writing `stats-{identity}.json` into
    /// the stats directory when one is configured
    pub fn stats_reporter(&self) -> Result<StatsReporter> {
        let stats = StatsReporter::new(self.identity.clone()).with_report_interval(self.report_interval);
        match &self.stats_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(stats.with_stats_file(dir.join(format!("stats-{}.json", self.file_safe_identity()))))
            }
            None => Ok(stats),
        }
    }
}

/// How a claimed range left the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeOutcome {
    /// Processed with no errors
    Completed { total: u64, processed: u64 },
    /// Returned to the pool
    Requeued { requeue_count: u32 },
    /// Terminal failure (fatal error or requeue budget exhausted)
    Failed,
    /// An operator reset the range while it was being processed
    Released,
    /// The processor stopped on an error; the range was requeued
    Halted { message: String },
}

/// One worker: claims ranges and processes them until the store is drained
pub struct RangeManager<K: Keyspace> {
    config: ManagerConfig,
    store: RangeStore,
    keyspace: K,
    processor: Box<dyn RangeProcessor>,
    tuner: BatchSizeTuner,
    stats: StatsReporter,
    checkpoint: Option<Box<dyn CheckpointSink>>,
    claim_cursor: Option<i64>,
    shutdown: Arc<AtomicBool>,
    #[cfg(test)]
    before_read_back: Option<Box<dyn FnOnce(&mut RangeStore) + Send>>,
}

impl<K: Keyspace> RangeManager<K> {
    /// Create a manager.
    ///
    /// With a stats directory configured, the stats file and (for processors
    /// that checkpoint) the checkpoint file are placed there.
    pub fn new(
        config: ManagerConfig,
        store: RangeStore,
        keyspace: K,
        processor: Box<dyn RangeProcessor>,
    ) -> Result<Self> {
        if config.identity.is_empty() {
            return Err(ConfigError::MissingRequired("worker identity".into()).into());
        }

        let settings = match processor.batch_size_bounds() {
            Some((min, max)) => config.tuner.with_size_bounds(min, max),
            None => config.tuner,
        };
        let tuner = BatchSizeTuner::new(settings)?;

        let stats = config.stats_reporter()?;
        let checkpoint: Option<Box<dyn CheckpointSink>> = match &config.stats_dir {
            Some(dir) if processor.should_checkpoint() => {
                Some(Box::new(FileCheckpoint::for_identity(dir, &config.identity)))
            }
            _ => None,
        };

        debug!(
            identity = %config.identity,
            min_batch = settings.min_size,
            max_batch = settings.max_size,
            "Range manager created"
        );

        Ok(Self {
            config,
            store,
            keyspace,
            processor,
            tuner,
            stats,
            checkpoint,
            claim_cursor: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            #[cfg(test)]
            before_read_back: None,
        })
    }

    /// Replace the checkpoint sink
    pub fn with_checkpoint(mut self, sink: Box<dyn CheckpointSink>) -> Self {
        self.checkpoint = Some(sink);
        self
    }

    /// Replace the stats reporter, e.g. one whose handle the caller already holds
    pub fn with_stats(mut self, stats: StatsReporter) -> Self {
        self.stats = stats;
        self
    }

    /// Share a shutdown flag (set by a signal handler)
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn store(&self) -> &RangeStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut RangeStore {
        &mut self.store
    }

    pub fn keyspace(&self) -> &K {
        &self.keyspace
    }

    pub fn stats(&self) -> &StatsReporter {
        &self.stats
    }

    pub fn tuner(&self) -> &BatchSizeTuner {
        &self.tuner
    }

    /// Get a clone of the shutdown flag
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Delete all ranges and build `count` new ones over the ring
    pub fn build_ranges(&mut self, count: usize) -> Result<usize> {
        let spans = self.config.bounds.split(count)?;
        Ok(self.store.build_ranges(&spans)?)
    }
}
