//! Key counting processor
//!
//! Counts the keys of each range without fetching columns and stores the
//! count with the completed range.

use crate::processor::{BatchHandler, ProcessMode, ProcessorError, RangeContext, RangeProcessor};
use crate::source::{ColumnSelection, Item};
use serde_json::json;

#[derive(Debug, Default)]
pub struct KeyCountProcessor {
    keys: u64,
    first_key: Option<String>,
    last_key: Option<String>,
    batch_size: Option<usize>,
}

impl KeyCountProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed batch size instead of tuning
    pub fn with_fixed_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Keys counted in the current range
    pub fn keys(&self) -> u64 {
        self.keys
    }
}

impl BatchHandler for KeyCountProcessor {
    fn process_batch(&mut self, items: &[Item]) -> Result<u64, ProcessorError> {
        if let Some(first) = items.first() {
            if self.first_key.is_none() {
                self.first_key = Some(first.key.clone());
            }
        }
        if let Some(last) = items.last() {
            self.last_key = Some(last.key.clone());
        }
        self.keys += items.len() as u64;
        Ok(items.len() as u64)
    }
}

impl RangeProcessor for KeyCountProcessor {
    fn mode(&mut self) -> ProcessMode<'_> {
        ProcessMode::Batch(self)
    }

    fn required_columns(&self) -> ColumnSelection {
        ColumnSelection::None
    }

    fn batch_size_bounds(&self) -> Option<(usize, usize)> {
        self.batch_size.map(|size| (size, size))
    }

    fn begin_range(&mut self, _ctx: &RangeContext<'_>) -> Result<(), ProcessorError> {
        self.keys = 0;
        self.first_key = None;
        self.last_key = None;
        Ok(())
    }

    fn range_data(&self) -> Option<serde_json::Value> {
        Some(json!({
            "keys": self.keys,
            "firstKey": self.first_key,
            "lastKey": self.last_key,
        }))
    }
}
