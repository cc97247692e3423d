//! Range metadata store
//!
//! [`RangeStore`] persists [`TokenRange`] rows in SQLite, across one table or
//! a set of shard tables. Each worker opens its own store; the database is the
//! only thing workers share.
//!
//! # Concurrency
//!
//! - Every write runs in a `BEGIN IMMEDIATE` transaction, so writers serialize
//!   on the database lock instead of failing at commit
//! - Busy/locked errors are retried with the store's [`RetryPolicy`]
//! - State transitions made by a worker are conditional on
//!   `status = 'processing' AND owner = <self>`, so a worker that lost its
//!   claim to an operator reset cannot overwrite the row
//! - Bulk queries fan out over every shard; limits apply after merging

pub mod range;
pub mod schema;
pub mod shards;

pub use range::{RangeStatus, TokenRange};
pub use shards::{validate_table_name, ShardSet};

use crate::error::{StoreError, StoreResult};
use crate::retry::RetryPolicy;
use crate::token::TokenSpan;
use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, ToSql, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use range::RANGE_COLUMNS;

/// Default logical table name
pub const DEFAULT_TABLE: &str = "token_ranges";

/// `random_key` values are drawn from `[0, RANDOM_KEY_SPACE)`
pub const RANDOM_KEY_SPACE: i64 = 10_000;

/// Default maximum number of requeues before a range fails
pub const DEFAULT_MAX_REQUEUES: u32 = 10;

/// Draw a fresh claim-order key
pub fn random_key() -> i64 {
    rand::rng().random_range(0..RANDOM_KEY_SPACE)
}

/// SQL expression drawing a fresh claim-order key per row
const RANDOM_KEY_SQL: &str = "abs(random() % 10000)";

/// Store connection settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite database file
    pub path: PathBuf,

    /// Logical table name (`name` or `name_*` for shards)
    pub table: String,

    /// How long SQLite waits on a locked database before returning busy
    pub busy_timeout: Duration,

    /// Retry policy for busy/locked writes
    pub retry: RetryPolicy,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            table: DEFAULT_TABLE.to_string(),
            busy_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }
}

/// Progress counters of one processing attempt
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RangeCounters {
    pub total_items: u64,
    pub processed_items: u64,
    pub error_count: u64,
    /// Seconds
    pub processing_time: f64,
}

/// Result of a requeue request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Back in the unclaimed pool
    Requeued { requeue_count: u32 },
    /// Requeue budget exhausted; the range is now failed
    Failed,
    /// The caller no longer owns the range
    NotOwned,
}

/// Aggregates for one status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCount {
    pub ranges: u64,
    pub total_items: u64,
    pub processed_items: u64,
    pub max_processing_time: f64,
    pub avg_processing_time: f64,
}

/// Store-wide status summary
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub by_status: BTreeMap<RangeStatus, StatusCount>,
    pub total_ranges: u64,
    pub total_requeues: u64,
    pub processing_hosts: Vec<String>,
}

impl StatusSummary {
    /// Number of ranges in a status
    pub fn count(&self, status: RangeStatus) -> u64 {
        self.by_status.get(&status).map(|c| c.ranges).unwrap_or(0)
    }
}

/// SQLite-backed range store
pub struct RangeStore {
    conn: Connection,
    shards: ShardSet,
    config: StoreConfig,
}

impl RangeStore {
    /// Open an existing store; a single (unsharded) table is created if missing
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let conn = Connection::open(&config.path)?;
        schema::configure_connection(&conn, config.busy_timeout)?;
        let shards = ShardSet::discover(&conn, &config.table)?;
        debug!(
            path = %config.path.display(),
            table = %config.table,
            shards = shards.len(),
            "Opened range store"
        );
        Ok(Self {
            conn,
            shards,
            config,
        })
    }

    /// Create the range table(s), `shards` of them for a sharded name
    pub fn init(config: StoreConfig, shards: usize) -> StoreResult<Self> {
        let conn = Connection::open(&config.path)?;
        schema::configure_connection(&conn, config.busy_timeout)?;
        let shards = ShardSet::create(&conn, &config.table, shards)?;
        info!(table = %config.table, shards = shards.len(), "Initialized range tables");
        Ok(Self {
            conn,
            shards,
            config,
        })
    }

    pub fn shards(&self) -> &ShardSet {
        &self.shards
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Run `f` in an IMMEDIATE transaction, retrying while the database is busy
    fn write<T, F>(conn: &mut Connection, retry: RetryPolicy, what: &str, mut f: F) -> StoreResult<T>
    where
        F: FnMut(&Transaction<'_>) -> StoreResult<T>,
    {
        retry.run(
            what,
            || -> StoreResult<T> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            },
            StoreError::is_busy,
            || {},
        )
    }

    /// Run an UPDATE on every shard and return the total affected rows
    fn update_all(&mut self, what: &str, set_where: &str, params: &[&dyn ToSql]) -> StoreResult<usize> {
        let tables = self.shards.tables();
        Self::write(&mut self.conn, self.config.retry, what, |tx| {
            let mut affected = 0;
            for table in tables {
                let sql = format!("UPDATE {} SET {}", table, set_where);
                affected += tx.execute(&sql, params)?;
            }
            Ok(affected)
        })
    }

    /// Select rows from every shard
    fn select_all(&self, tail: &str, params: &[&dyn ToSql]) -> StoreResult<Vec<TokenRange>> {
        let mut ranges = Vec::new();
        for (shard, table) in self.shards.tables().iter().enumerate() {
            let sql = format!("SELECT {} FROM {} {}", RANGE_COLUMNS, table, tail);
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params, |row| TokenRange::from_row(row, shard))?;
            for row in rows {
                ranges.push(row?);
            }
        }
        Ok(ranges)
    }

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    /// Delete every range and insert one row per span.
    ///
    /// Ids run from 1 in span order; spans go to shards in contiguous chunks.
    pub fn build_ranges(&mut self, spans: &[TokenSpan]) -> StoreResult<usize> {
        let now = Utc::now();
        let shards = &self.shards;
        let chunk = spans.len().div_ceil(shards.len()).max(1);

        let inserted = Self::write(&mut self.conn, self.config.retry, "build ranges", |tx| {
            for table in shards.tables() {
                tx.execute(&format!("DELETE FROM {}", table), [])?;
            }

            for (i, span) in spans.iter().enumerate() {
                let sql = format!(
                    "INSERT INTO {} (id, start_token, end_token, status, random_key, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    shards.table(i / chunk)
                );
                let mut stmt = tx.prepare_cached(&sql)?;
                stmt.execute(params![
                    (i + 1) as i64,
                    span.start.to_string(),
                    span.end.to_string(),
                    RangeStatus::Unclaimed,
                    random_key(),
                    now,
                ])?;
            }
            Ok(spans.len())
        })?;

        info!(ranges = inserted, shards = shards.len(), "Built token ranges");
        Ok(inserted)
    }

    // ---------------------------------------------------------------------
    // Claiming
    // ---------------------------------------------------------------------

    /// Atomically claim one unclaimed row of a shard.
    ///
    /// With a window, only rows whose `random_key` lies in `[lo, hi)` are
    /// candidates. Returns true when a row was claimed.
    pub fn try_claim(&mut self, shard: usize, owner: &str, window: Option<(i64, i64)>) -> StoreResult<bool> {
        let table = self.shards.table(shard);
        let now = Utc::now();

        let filter = if window.is_some() {
            "AND random_key >= ?3 AND random_key < ?4"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE {t} SET status = 'processing', owner = ?1, last_owner = ?1, \
             claimed_at = ?2, heartbeat_at = ?2, updated_at = ?2 \
             WHERE id = (SELECT id FROM {t} WHERE status = 'unclaimed' {filter} \
                         ORDER BY random_key, id LIMIT 1) \
             AND status = 'unclaimed'",
            t = table,
            filter = filter
        );

        let affected = Self::write(&mut self.conn, self.config.retry, "claim range", |tx| {
            Ok(match window {
                Some((lo, hi)) => tx.execute(&sql, params![owner, now, lo, hi])?,
                None => tx.execute(&sql, params![owner, now])?,
            })
        })?;
        Ok(affected == 1)
    }

    /// The range currently held by `owner`, if any
    pub fn find_owned(&self, owner: &str) -> StoreResult<Option<TokenRange>> {
        let mut owned = self.select_all(
            "WHERE status = 'processing' AND owner = ?1 ORDER BY claimed_at, id",
            &[&owner],
        )?;
        if owned.len() > 1 {
            warn!(owner, count = owned.len(), "Owner holds more than one range");
        }
        Ok(if owned.is_empty() {
            None
        } else {
            Some(owned.swap_remove(0))
        })
    }

    // ---------------------------------------------------------------------
    // Single-range reads and worker transitions
    // ---------------------------------------------------------------------

    /// Load one range by id
    pub fn get(&self, id: i64) -> StoreResult<TokenRange> {
        for (shard, table) in self.shards.tables().iter().enumerate() {
            let sql = format!("SELECT {} FROM {} WHERE id = ?1", RANGE_COLUMNS, table);
            let found = self
                .conn
                .query_row(&sql, [id], |row| TokenRange::from_row(row, shard))
                .optional()?;
            if let Some(range) = found {
                return Ok(range);
            }
        }
        Err(StoreError::RangeNotFound { id })
    }

    /// Persist resolved boundary keys
    pub fn save_boundary_keys(&mut self, range: &TokenRange, first_key: &str, last_key: &str) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET first_key = ?1, last_key = ?2, updated_at = ?3 WHERE id = ?4",
            self.shards.table(range.shard)
        );
        let now = Utc::now();
        let affected = Self::write(&mut self.conn, self.config.retry, "save boundary keys", |tx| {
            Ok(tx.execute(&sql, params![first_key, last_key, now, range.id])?)
        })?;
        if affected == 0 {
            return Err(StoreError::RangeNotFound { id: range.id });
        }
        Ok(())
    }

    /// Record in-flight progress and refresh the heartbeat.
    /// Returns false when `owner` no longer holds the range.
    pub fn record_progress(&mut self, range: &TokenRange, owner: &str, counters: &RangeCounters) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {} SET total_items = ?1, processed_items = ?2, error_count = ?3, \
             processing_time = ?4, heartbeat_at = ?5, updated_at = ?5 \
             WHERE id = ?6 AND owner = ?7 AND status = 'processing'",
            self.shards.table(range.shard)
        );
        let now = Utc::now();
        let affected = Self::write(&mut self.conn, self.config.retry, "record progress", |tx| {
            Ok(tx.execute(
                &sql,
                params![
                    counters.total_items as i64,
                    counters.processed_items as i64,
                    counters.error_count as i64,
                    counters.processing_time,
                    now,
                    range.id,
                    owner,
                ],
            )?)
        })?;
        Ok(affected == 1)
    }

    /// Mark a range processed with its final counters and checkpoint data
    pub fn complete(
        &mut self,
        range: &TokenRange,
        owner: &str,
        counters: &RangeCounters,
        range_data: Option<&serde_json::Value>,
    ) -> StoreResult<bool> {
        let data = range_data.map(serde_json::to_string).transpose()?;
        let sql = format!(
            "UPDATE {} SET status = 'processed', owner = NULL, total_items = ?1, \
             processed_items = ?2, error_count = ?3, processing_time = ?4, \
             range_data = ?5, error = NULL, heartbeat_at = ?6, updated_at = ?6 \
             WHERE id = ?7 AND owner = ?8 AND status = 'processing'",
            self.shards.table(range.shard)
        );
        let now = Utc::now();
        let affected = Self::write(&mut self.conn, self.config.retry, "complete range", |tx| {
            Ok(tx.execute(
                &sql,
                params![
                    counters.total_items as i64,
                    counters.processed_items as i64,
                    counters.error_count as i64,
                    counters.processing_time,
                    data,
                    now,
                    range.id,
                    owner,
                ],
            )?)
        })?;
        Ok(affected == 1)
    }

    /// Mark a range failed with an error message
    pub fn fail(&mut self, range: &TokenRange, owner: &str, counters: &RangeCounters, message: &str) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {} SET status = 'failed', owner = NULL, total_items = ?1, \
             processed_items = ?2, error_count = ?3, processing_time = ?4, \
             error = ?5, updated_at = ?6 \
             WHERE id = ?7 AND owner = ?8 AND status = 'processing'",
            self.shards.table(range.shard)
        );
        let now = Utc::now();
        let affected = Self::write(&mut self.conn, self.config.retry, "fail range", |tx| {
            Ok(tx.execute(
                &sql,
                params![
                    counters.total_items as i64,
                    counters.processed_items as i64,
                    counters.error_count as i64,
                    counters.processing_time,
                    message,
                    now,
                    range.id,
                    owner,
                ],
            )?)
        })?;
        Ok(affected == 1)
    }

    /// Return a range to the unclaimed pool, or fail it once it has been
    /// requeued `max_requeues` times already.
    ///
    /// Progress counters, checkpoint data and resolved keys are discarded;
    /// `requeue_count` is kept.
    pub fn requeue(&mut self, range: &TokenRange, owner: &str, reason: &str, max_requeues: u32) -> StoreResult<RequeueOutcome> {
        let table = self.shards.table(range.shard);
        let now = Utc::now();

        Self::write(&mut self.conn, self.config.retry, "requeue range", |tx| {
            let current: Option<i64> = tx
                .query_row(
                    &format!(
                        "SELECT requeue_count FROM {} WHERE id = ?1 AND owner = ?2 AND status = 'processing'",
                        table
                    ),
                    params![range.id, owner],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(current) = current else {
                return Ok(RequeueOutcome::NotOwned);
            };

            let next = current as u32 + 1;
            if next > max_requeues {
                tx.execute(
                    &format!(
                        "UPDATE {} SET status = 'failed', owner = NULL, requeue_count = ?1, \
                         error = ?2, updated_at = ?3 WHERE id = ?4",
                        table
                    ),
                    params![
                        max_requeues as i64,
                        format!("Exceeded {} requeues: {}", max_requeues, reason),
                        now,
                        range.id,
                    ],
                )?;
                return Ok(RequeueOutcome::Failed);
            }

            tx.execute(
                &format!(
                    "UPDATE {} SET status = 'unclaimed', owner = NULL, requeue_count = ?1, \
                     random_key = ?2, total_items = 0, processed_items = 0, error_count = 0, \
                     processing_time = 0, range_data = NULL, first_key = '', last_key = '', \
                     error = ?3, requeued_at = ?4, updated_at = ?4 WHERE id = ?5",
                    table
                ),
                params![next as i64, random_key(), reason, now, range.id],
            )?;
            Ok(RequeueOutcome::Requeued { requeue_count: next })
        })
    }

    // ---------------------------------------------------------------------
    // Administrative operations
    // ---------------------------------------------------------------------

    /// Reopen every range.
    ///
    /// Clears ownership, progress and resolved keys on all shards. Timestamps
    /// other than the claim/heartbeat pair are left alone, so repeating the
    /// reset leaves rows unchanged.
    pub fn reset_ranges(&mut self) -> StoreResult<usize> {
        self.update_all("reset ranges", &format!("{} WHERE 1 = 1", RESET_COLUMNS), &[])
    }

    /// Reopen one range; errors when the id does not exist
    pub fn reset_range(&mut self, id: i64) -> StoreResult<()> {
        let affected = self.update_all("reset range", &format!("{} WHERE id = ?1", RESET_COLUMNS), &[&id])?;
        if affected == 0 {
            return Err(StoreError::RangeNotFound { id });
        }
        Ok(())
    }

    /// Reopen failed ranges with a full requeue budget
    pub fn reset_failed(&mut self) -> StoreResult<usize> {
        let now = Utc::now();
        self.update_all(
            "reset failed ranges",
            &format!(
                "status = 'unclaimed', owner = NULL, requeue_count = 0, error = NULL, \
                 random_key = {}, updated_at = ?1 WHERE status = 'failed'",
                RANDOM_KEY_SQL
            ),
            &[&now],
        )
    }

    /// Reopen ranges stuck in processing.
    ///
    /// With `stale_before`, only ranges whose heartbeat is older than it (or
    /// missing) are reopened; live workers keep their claims.
    pub fn reset_processing(&mut self, stale_before: Option<DateTime<Utc>>) -> StoreResult<usize> {
        let now = Utc::now();
        let set = "status = 'unclaimed', owner = NULL, claimed_at = NULL, updated_at = ?1 \
                   WHERE status = 'processing'";
        match stale_before {
            Some(cutoff) => self.update_all(
                "reset processing ranges",
                &format!("{} AND (heartbeat_at IS NULL OR heartbeat_at < ?2)", set),
                &[&now, &cutoff],
            ),
            None => self.update_all("reset processing ranges", set, &[&now]),
        }
    }

    /// Total number of failed ranges plus up to `limit` of them by id
    pub fn list_failed(&self, limit: usize) -> StoreResult<(u64, Vec<TokenRange>)> {
        let mut total = 0u64;
        for table in self.shards.tables() {
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE status = 'failed'", table),
                [],
                |row| row.get(0),
            )?;
            total += count as u64;
        }

        let limit = limit as i64;
        let mut ranges = self.select_all("WHERE status = 'failed' ORDER BY id LIMIT ?1", &[&limit])?;
        ranges.sort_by_key(|r| r.id);
        ranges.truncate(limit as usize);
        Ok((total, ranges))
    }

    /// Ranges that have been requeued at least once, most recent first,
    /// whose last requeue happened at or after `since`
    pub fn list_requeued(&self, since: DateTime<Utc>) -> StoreResult<Vec<TokenRange>> {
        let mut ranges = self.select_all(
            "WHERE requeue_count > 0 AND requeued_at >= ?1 ORDER BY requeued_at DESC",
            &[&since],
        )?;
        ranges.sort_by(|a, b| b.requeued_at.cmp(&a.requeued_at).then(a.id.cmp(&b.id)));
        Ok(ranges)
    }

    /// Every range ordered by id
    pub fn all_ranges(&self) -> StoreResult<Vec<TokenRange>> {
        let mut ranges = self.select_all("ORDER BY id", &[])?;
        ranges.sort_by_key(|r| r.id);
        Ok(ranges)
    }

    /// Number of ranges across all shards
    pub fn count(&self) -> StoreResult<u64> {
        let mut total = 0u64;
        for table in self.shards.tables() {
            let count: i64 =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            total += count as u64;
        }
        Ok(total)
    }

    /// Per-status aggregates merged across shards
    pub fn status_summary(&self) -> StoreResult<StatusSummary> {
        let mut summary = StatusSummary::default();
        let mut time_sums: BTreeMap<RangeStatus, f64> = BTreeMap::new();
        let mut hosts = BTreeSet::new();

        for table in self.shards.tables() {
            let sql = format!(
                "SELECT status, COUNT(*), COALESCE(SUM(total_items), 0), \
                 COALESCE(SUM(processed_items), 0), COALESCE(MAX(processing_time), 0), \
                 COALESCE(SUM(processing_time), 0), COALESCE(SUM(requeue_count), 0) \
                 FROM {} GROUP BY status",
                table
            );
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, RangeStatus>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?;

            for row in rows {
                let (status, ranges, total, processed, max_time, sum_time, requeues) = row?;
                let entry = summary.by_status.entry(status).or_default();
                entry.ranges += ranges as u64;
                entry.total_items += total as u64;
                entry.processed_items += processed as u64;
                entry.max_processing_time = entry.max_processing_time.max(max_time);
                *time_sums.entry(status).or_default() += sum_time;
                summary.total_ranges += ranges as u64;
                summary.total_requeues += requeues as u64;
            }

            let mut stmt = self.conn.prepare_cached(&format!(
                "SELECT DISTINCT owner FROM {} WHERE status = 'processing'",
                table
            ))?;
            for owner in stmt.query_map([], |row| row.get::<_, String>(0))? {
                hosts.insert(owner?);
            }
        }

        for (status, entry) in summary.by_status.iter_mut() {
            if entry.ranges > 0 {
                entry.avg_processing_time = time_sums.get(status).copied().unwrap_or(0.0) / entry.ranges as f64;
            }
        }
        summary.processing_hosts = hosts.into_iter().collect();
        Ok(summary)
    }
}

/// SET clause shared by the single and bulk range resets
const RESET_COLUMNS: &str = "status = 'unclaimed', owner = NULL, first_key = '', last_key = '', \
     total_items = 0, processed_items = 0, error_count = 0, processing_time = 0, \
     error = NULL, claimed_at = NULL, heartbeat_at = NULL";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenBounds;
    use num_bigint::BigInt;
    use tempfile::TempDir;

    fn store_with(table: &str, shards: usize, ranges: usize) -> (TempDir, RangeStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("ranges.db")).with_table(table);
        let mut store = RangeStore::init(config, shards).unwrap();
        let bounds = TokenBounds::new(BigInt::from(-100), BigInt::from(100)).unwrap();
        store.build_ranges(&bounds.split(ranges).unwrap()).unwrap();
        (dir, store)
    }

    fn claim(store: &mut RangeStore, owner: &str) -> TokenRange {
        for shard in 0..store.shards().len() {
            if store.try_claim(shard, owner, None).unwrap() {
                return store.find_owned(owner).unwrap().unwrap();
            }
        }
        panic!("nothing to claim");
    }

    #[test]
    fn test_build_ranges() {
        let (_dir, store) = store_with("token_ranges", 1, 4);
        let ranges = store.all_ranges().unwrap();
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].id, 1);
        assert_eq!(ranges[0].start_token, "-100");
        assert_eq!(ranges[3].end_token, "100");
        assert!(ranges.iter().all(|r| r.status == RangeStatus::Unclaimed));
        assert!(ranges.iter().all(|r| (0..RANDOM_KEY_SPACE).contains(&r.random_key)));
    }

    #[test]
    fn test_rebuild_replaces_rows() {
        let (_dir, mut store) = store_with("token_ranges", 1, 4);
        let bounds = TokenBounds::new(BigInt::from(0), BigInt::from(10)).unwrap();
        store.build_ranges(&bounds.split(2).unwrap()).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_sharded_build_distributes_chunks() {
        let (_dir, store) = store_with("ranges_*", 3, 7);
        let ranges = store.all_ranges().unwrap();
        assert_eq!(ranges.len(), 7);
        let shards: Vec<usize> = ranges.iter().map(|r| r.shard).collect();
        assert_eq!(shards, vec![0, 0, 0, 1, 1, 1, 2]);
        assert_eq!(store.get(5).unwrap().shard, 1);
    }

    #[test]
    fn test_claim_and_find_owned() {
        let (_dir, mut store) = store_with("token_ranges", 1, 2);
        let range = claim(&mut store, "host|a");
        assert_eq!(range.status, RangeStatus::Processing);
        assert_eq!(range.owner.as_deref(), Some("host|a"));
        assert!(range.claimed_at.is_some());
        assert!(store.find_owned("host|b").unwrap().is_none());

        let other = claim(&mut store, "host|b");
        assert_ne!(range.id, other.id);
        assert!(!store.try_claim(0, "host|c", None).unwrap());
    }

    #[test]
    fn test_claim_window() {
        let (_dir, mut store) = store_with("token_ranges", 1, 1);
        let key = store.get(1).unwrap().random_key;
        assert!(!store.try_claim(0, "w", Some((key + 1, key + 101))).unwrap());
        assert!(store.try_claim(0, "w", Some((key, key + 1))).unwrap());
    }

    #[test]
    fn test_complete() {
        let (_dir, mut store) = store_with("token_ranges", 1, 1);
        let range = claim(&mut store, "w");
        let counters = RangeCounters {
            total_items: 10,
            processed_items: 9,
            error_count: 0,
            processing_time: 1.5,
        };
        let data = serde_json::json!({"keys": 10});
        assert!(store.complete(&range, "w", &counters, Some(&data)).unwrap());

        let done = store.get(range.id).unwrap();
        assert_eq!(done.status, RangeStatus::Processed);
        assert!(done.owner.is_none());
        assert_eq!(done.last_owner.as_deref(), Some("w"));
        assert_eq!(done.total_items, 10);
        assert_eq!(done.range_data, Some(data));

        // Not owned any more
        assert!(!store.complete(&range, "w", &counters, None).unwrap());
    }

    #[test]
    fn test_requeue_then_fail() {
        let (_dir, mut store) = store_with("token_ranges", 1, 1);
        for expected in 1..=2 {
            let range = claim(&mut store, "w");
            assert_eq!(
                store.requeue(&range, "w", "boom", 2).unwrap(),
                RequeueOutcome::Requeued { requeue_count: expected }
            );
            let row = store.get(range.id).unwrap();
            assert_eq!(row.status, RangeStatus::Unclaimed);
            assert!(row.owner.is_none());
            assert_eq!(row.error.as_deref(), Some("boom"));
            assert!(row.requeued_at.is_some());
        }

        let range = claim(&mut store, "w");
        assert_eq!(store.requeue(&range, "w", "boom", 2).unwrap(), RequeueOutcome::Failed);
        let row = store.get(range.id).unwrap();
        assert_eq!(row.status, RangeStatus::Failed);
        assert_eq!(row.requeue_count, 2);
        assert!(!store.try_claim(0, "w", None).unwrap());
    }

    #[test]
    fn test_requeue_not_owned() {
        let (_dir, mut store) = store_with("token_ranges", 1, 1);
        let range = claim(&mut store, "w");
        assert_eq!(store.requeue(&range, "other", "x", 10).unwrap(), RequeueOutcome::NotOwned);
    }

    #[test]
    fn test_reset_range_idempotent() {
        let (_dir, mut store) = store_with("token_ranges", 1, 2);
        let range = claim(&mut store, "w");
        store.save_boundary_keys(&range, "a", "b").unwrap();

        store.reset_range(range.id).unwrap();
        let first = store.get(range.id).unwrap();
        store.reset_range(range.id).unwrap();
        let second = store.get(range.id).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, RangeStatus::Unclaimed);
        assert_eq!(first.first_key, "");
        assert!(matches!(store.reset_range(99), Err(StoreError::RangeNotFound { id: 99 })));
    }

    #[test]
    fn test_reset_failed_and_processing() {
        let (_dir, mut store) = store_with("ranges_*", 2, 4);
        let a = claim(&mut store, "a");
        store.fail(&a, "a", &RangeCounters::default(), "fatal").unwrap();
        let _b = claim(&mut store, "b");

        let (total, failed) = store.list_failed(10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(failed[0].host(), "a");

        // Heartbeat is fresh, so a staleness bound keeps the claim
        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(store.reset_processing(Some(cutoff)).unwrap(), 0);
        assert_eq!(store.reset_processing(None).unwrap(), 1);

        assert_eq!(store.reset_failed().unwrap(), 1);
        let summary = store.status_summary().unwrap();
        assert_eq!(summary.count(RangeStatus::Unclaimed), 4);
        assert_eq!(summary.total_requeues, 0);
    }

    #[test]
    fn test_list_requeued() {
        let (_dir, mut store) = store_with("token_ranges", 1, 3);
        let range = claim(&mut store, "w");
        store.requeue(&range, "w", "timeout", 10).unwrap();

        let recent = store.list_requeued(Utc::now() - chrono::Duration::minutes(1)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, range.id);
        let future = store.list_requeued(Utc::now() + chrono::Duration::minutes(1)).unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn test_status_summary() {
        let (_dir, mut store) = store_with("ranges_*", 2, 4);
        let range = claim(&mut store, "host|inst1");
        let counters = RangeCounters {
            total_items: 5,
            processed_items: 5,
            error_count: 0,
            processing_time: 2.0,
        };
        store.complete(&range, "host|inst1", &counters, None).unwrap();
        claim(&mut store, "host|inst2");

        let summary = store.status_summary().unwrap();
        assert_eq!(summary.total_ranges, 4);
        assert_eq!(summary.count(RangeStatus::Processed), 1);
        assert_eq!(summary.count(RangeStatus::Processing), 1);
        assert_eq!(summary.count(RangeStatus::Unclaimed), 2);
        assert_eq!(summary.by_status[&RangeStatus::Processed].avg_processing_time, 2.0);
        assert_eq!(summary.processing_hosts, vec!["host|inst2".to_string()]);
    }
}
