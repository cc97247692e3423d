//! Operator commands
//!
//! [`RangeAdmin`] wraps the store's bulk and single-range recovery
//! operations. All of them only reopen rows, so they are safe to run while
//! workers are live. The data-store tools ([`count_range`], [`get_keys`])
//! inspect a keyspace directly.

use super::refresh::reconnect;
use crate::error::{ConfigError, Result, SourceError};
use crate::retry::RetryPolicy;
use crate::source::Keyspace;
use crate::store::{RangeStore, StatusSummary, TokenRange};
use chrono::{TimeDelta, Utc};
use num_bigint::BigInt;
use serde::Serialize;
use tracing::{debug, info};

/// Batch size used when counting keys
const COUNT_BATCH: usize = 1000;

/// Administrative access to a range store
pub struct RangeAdmin {
    store: RangeStore,
}

impl RangeAdmin {
    pub fn new(store: RangeStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RangeStore {
        &self.store
    }

    /// Reopen every range on every shard
    pub fn reset_ranges(&mut self) -> Result<usize> {
        let reset = self.store.reset_ranges()?;
        info!(reset, "Reset all ranges");
        Ok(reset)
    }

    /// Reopen one range
    pub fn reset_range(&mut self, id: i64) -> Result<()> {
        self.store.reset_range(id)?;
        info!(range_id = id, "Reset range");
        Ok(())
    }

    /// Reopen failed ranges with a fresh requeue budget
    pub fn reset_failed(&mut self) -> Result<usize> {
        let reset = self.store.reset_failed()?;
        info!(reset, "Reset failed ranges");
        Ok(reset)
    }

    /// Reopen ranges stuck in processing.
    ///
    /// With `stale_mins`, only ranges without a heartbeat for that many
    /// minutes are reopened.
    pub fn reset_processing(&mut self, stale_mins: Option<i64>) -> Result<usize> {
        let cutoff = stale_mins.map(minutes_ago).transpose()?;
        let reset = self.store.reset_processing(cutoff)?;
        info!(reset, stale_mins, "Reset processing ranges");
        Ok(reset)
    }

    /// Total failed ranges and up to `limit` of them
    pub fn list_failed(&self, limit: usize) -> Result<(u64, Vec<TokenRange>)> {
        Ok(self.store.list_failed(limit)?)
    }

    /// Ranges requeued within the last `mins` minutes
    pub fn list_requeued(&self, mins: i64) -> Result<Vec<TokenRange>> {
        Ok(self.store.list_requeued(minutes_ago(mins)?)?)
    }

    /// Per-status summary across all shards
    pub fn status(&self) -> Result<StatusSummary> {
        Ok(self.store.status_summary()?)
    }

    /// Checkpoint data a processor stored with a range
    pub fn show_range_data(&self, id: i64) -> Result<Option<serde_json::Value>> {
        Ok(self.store.get(id)?.range_data)
    }
}

fn minutes_ago(mins: i64) -> Result<chrono::DateTime<Utc>> {
    let delta = TimeDelta::try_minutes(mins.max(0))
        .ok_or_else(|| ConfigError::MissingRequired(format!("a window of {} minutes is out of range", mins)))?;
    Ok(Utc::now() - delta)
}

/// Count the keys between two keys (an empty key is the ring start or end).
///
/// Keys are fetched in batches of 1000. Every batch after the first starts
/// with the previous batch's final key, which is not counted again.
pub fn count_range<K: Keyspace>(keyspace: &mut K, retry: RetryPolicy, start_key: &str, end_key: &str) -> Result<u64> {
    if start_key.is_empty() && end_key.is_empty() {
        return Err(ConfigError::MissingRequired("a start key or an end key".into()).into());
    }

    let mut total = 0u64;
    let mut from = start_key.to_string();
    let mut first = true;

    loop {
        let keys = retry.run_with(
            "count keys",
            &mut *keyspace,
            |ks| ks.keys_between(&from, end_key, COUNT_BATCH),
            SourceError::is_transient,
            reconnect,
        )?;

        let fetched = keys.len();
        let duplicate = !first && keys.first().is_some_and(|k| *k == from);
        total += (fetched - usize::from(duplicate)) as u64;
        first = false;

        let Some(last) = keys.last() else {
            break;
        };
        if fetched < COUNT_BATCH || (!end_key.is_empty() && *last == end_key) {
            break;
        }
        from = last.clone();
        debug!(total, "Counting keys");
    }

    Ok(total)
}

/// Keys nearest to a pair of tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysNearTokens {
    pub start_token: String,
    pub start_keys: Vec<String>,
    pub end_token: String,
    pub end_keys: Vec<String>,
}

/// The first `count` keys after each of two tokens
pub fn get_keys<K: Keyspace>(
    keyspace: &mut K,
    retry: RetryPolicy,
    start_token: &BigInt,
    end_token: &BigInt,
    count: usize,
) -> Result<KeysNearTokens> {
    let count = count.max(1);
    let mut nearest = |token: &BigInt| {
        retry.run_with(
            "nearest keys to token",
            &mut *keyspace,
            |ks| ks.nearest_keys_to_token(token, count),
            SourceError::is_transient,
            reconnect,
        )
    };

    let start_keys = nearest(start_token)?;
    let end_keys = nearest(end_token)?;
    Ok(KeysNearTokens {
        start_token: start_token.to_string(),
        start_keys,
        end_token: end_token.to_string(),
        end_keys,
    })
}
