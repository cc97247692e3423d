//! Processor contract
//!
//! A [`RangeProcessor`] declares, through [`RangeProcessor::mode`], whether it
//! consumes whole batches or single items. The manager only ever calls the
//! handler the mode hands back, so a batch processor never sees per-item
//! calls and vice versa.
//!
//! Processors must be idempotent per key: a requeued range is processed again
//! from its first key.

pub mod checkpoint;
pub mod key_count;

pub use checkpoint::{CheckpointSink, FileCheckpoint};
pub use key_count::KeyCountProcessor;

use crate::source::{ColumnSelection, Item};
use crate::store::TokenRange;
use thiserror::Error;

/// Errors reported while processing a batch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({count} errors)")]
pub struct BatchError {
    /// Number of items that failed
    pub count: u64,
    pub message: String,
    /// Keys that failed, when known
    pub keys: Vec<String>,
}

impl BatchError {
    pub fn new(count: u64, message: impl Into<String>) -> Self {
        Self {
            count,
            message: message.into(),
            keys: Vec::new(),
        }
    }
}

/// Error reported while processing one item
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{key}: {message}")]
pub struct ItemError {
    pub key: String,
    pub message: String,
}

impl ItemError {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Processor failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Some items of a batch failed; processing may continue
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// One item failed; processing may continue
    #[error("Item error: {0}")]
    Item(#[from] ItemError),

    /// The range cannot be processed; it is marked failed
    #[error("Fatal processor error: {0}")]
    Fatal(String),
}

impl ProcessorError {
    /// Number of failed items this error stands for
    pub fn error_count(&self) -> u64 {
        match self {
            ProcessorError::Batch(e) => e.count.max(1),
            ProcessorError::Item(_) | ProcessorError::Fatal(_) => 1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessorError::Fatal(_))
    }
}

/// Consumes a whole batch at once
pub trait BatchHandler {
    /// Returns the number of items processed
    fn process_batch(&mut self, items: &[Item]) -> Result<u64, ProcessorError>;
}

/// Consumes one item at a time
pub trait ItemHandler {
    /// Returns whether the item was processed (false means skipped)
    fn process_item(&mut self, item: &Item) -> Result<bool, ProcessorError>;
}

/// The handler a processor exposes
pub enum ProcessMode<'a> {
    Batch(&'a mut dyn BatchHandler),
    PerItem(&'a mut dyn ItemHandler),
}

/// Passed to a processor before each range
#[derive(Debug, Clone, Copy)]
pub struct RangeContext<'a> {
    pub range: &'a TokenRange,
    /// Processors must not write anything when set
    pub dry_run: bool,
}

/// Pluggable unit of work
pub trait RangeProcessor: Send {
    /// Which handler to dispatch to
    fn mode(&mut self) -> ProcessMode<'_>;

    fn supports_batch(&mut self) -> bool {
        matches!(self.mode(), ProcessMode::Batch(_))
    }

    /// Columns to fetch for each key
    fn required_columns(&self) -> ColumnSelection {
        ColumnSelection::All
    }

    /// Stop the worker on the first processor error
    fn stop_on_errors(&self) -> bool {
        false
    }

    /// `(min, max)` batch size; equal values fix the size
    fn batch_size_bounds(&self) -> Option<(usize, usize)> {
        None
    }

    /// Save a checkpoint after every round
    fn should_checkpoint(&self) -> bool {
        false
    }

    /// Called after the range is claimed and its keys resolved
    fn begin_range(&mut self, _ctx: &RangeContext<'_>) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Data to persist with a completed range
    fn range_data(&self) -> Option<serde_json::Value> {
        None
    }
}
