//! Range claiming
//!
//! 1. A range already held by this identity (a crashed run of the same
//!    worker) is resumed without a new claim.
//! 2. Otherwise the worker walks `random_key` windows of [`CLAIM_WINDOW`]
//!    keys, starting at its cursor, and tries one conditional single-row
//!    update per window. The first successful window becomes the new cursor.
//! 3. After a full scan of a shard, one unbounded attempt picks up rows whose
//!    key lies outside the window space.
//! 4. A claimed row that is gone by the time it is read back (an operator
//!    reset in between) does not end the scan; the shard is tried again.
//! 5. When no shard yields a row, the store is drained and the cursor resets.

use super::RangeManager;
use crate::error::Result;
use crate::source::Keyspace;
use crate::store::{TokenRange, RANDOM_KEY_SPACE};
use rand::Rng;
use std::hash::Hasher;
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

/// Width of one claim window over `random_key`
pub const CLAIM_WINDOW: i64 = 100;

/// Windows tried per shard before the unbounded attempt
pub const CLAIM_SCAN_WINDOWS: i64 = RANDOM_KEY_SPACE / CLAIM_WINDOW;

/// Shard a worker scans first, so workers spread over the shards
pub(crate) fn first_shard(identity: &str, shards: usize) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(identity.as_bytes());
    (hasher.finish() % shards.max(1) as u64) as usize
}

impl<K: Keyspace> RangeManager<K> {
    /// Claim the next range for this worker; `None` when nothing is left
    pub fn claim_next_range(&mut self) -> Result<Option<TokenRange>> {
        let identity = self.config.identity.clone();

        if let Some(range) = self.store.find_owned(&identity)? {
            info!(range_id = range.id, "Resuming range already claimed by this worker");
            return Ok(Some(range));
        }

        let first = first_shard(&identity, self.store.shards().len());
        let order: Vec<usize> = self.store.shards().rotation(first).collect();
        for shard in order {
            while self.claim_in_shard(shard, &identity)? {
                #[cfg(test)]
                if let Some(hook) = self.before_read_back.take() {
                    hook(&mut self.store);
                }

                match self.store.find_owned(&identity)? {
                    Some(range) => {
                        info!(
                            range_id = range.id,
                            shard,
                            requeues = range.requeue_count,
                            "Claimed range"
                        );
                        return Ok(Some(range));
                    }
                    // Reset by an operator between the claim and the read
                    None => warn!(shard, "Claimed range was released before it could be read"),
                }
            }
        }

        self.claim_cursor = None;
        debug!("No unclaimed ranges found");
        Ok(None)
    }

    fn claim_in_shard(&mut self, shard: usize, identity: &str) -> Result<bool> {
        let start = match self.claim_cursor {
            Some(cursor) => cursor,
            None => rand::rng().random_range(0..CLAIM_SCAN_WINDOWS) * CLAIM_WINDOW,
        };

        for i in 0..CLAIM_SCAN_WINDOWS {
            let lo = (start + i * CLAIM_WINDOW) % RANDOM_KEY_SPACE;
            if self.store.try_claim(shard, identity, Some((lo, lo + CLAIM_WINDOW)))? {
                self.claim_cursor = Some(lo);
                return Ok(true);
            }
        }

        Ok(self.store.try_claim(shard, identity, None)?)
    }
}
