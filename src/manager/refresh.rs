//! Boundary key resolution
//!
//! A range's first key is the first key after its start token and its last
//! key is the first key after its end token (the first key of the next
//! range). Keys equal to the ring's first key are stored as empty strings,
//! which the data store reads as "ring start" or "ring end".

use super::RangeManager;
use crate::error::{Result, SourceError, SourceResult};
use crate::source::Keyspace;
use crate::store::TokenRange;
use num_bigint::BigInt;
use tracing::{debug, info, warn};

/// Prefix some data stores return for a token with no live key
const EMPTY_MARKER: &str = "empty:";

/// Resolved boundaries of a range
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Boundary {
    pub first_key: String,
    pub last_key: String,
}

/// Retry hook for data-store calls
pub(super) fn reconnect<K: Keyspace>(keyspace: &mut K) {
    if let Err(e) = keyspace.reconnect() {
        warn!(error = %e, "Reconnect failed");
    }
}

impl<K: Keyspace> RangeManager<K> {
    /// Resolve and save the boundary keys of a range.
    ///
    /// Returns false (and saves nothing) when the range has no usable
    /// boundary: no key was found, the range holds no key, or the store
    /// returned an empty marker. Transient lookup failures are retried with a
    /// reconnect between attempts; an error is returned once retries run out.
    pub fn refresh_keys_for_range(&mut self, range: &mut TokenRange) -> Result<bool> {
        let start = range.start()?;
        let end = range.end()?;

        let Some(boundary) = self.resolve_boundary(&start, &end)? else {
            debug!(range_id = range.id, "No usable boundary keys");
            return Ok(false);
        };

        self.store
            .save_boundary_keys(range, &boundary.first_key, &boundary.last_key)?;
        range.first_key = boundary.first_key;
        range.last_key = boundary.last_key;
        debug!(
            range_id = range.id,
            first_key = %range.first_key,
            last_key = %range.last_key,
            "Refreshed boundary keys"
        );
        Ok(true)
    }

    /// Refresh every range's keys; returns how many resolved
    pub fn refresh_keys_for_all_ranges(&mut self) -> Result<usize> {
        let ranges = self.store.all_ranges()?;
        let total = ranges.len();
        let mut resolved = 0;

        for (i, mut range) in ranges.into_iter().enumerate() {
            if self.refresh_keys_for_range(&mut range)? {
                resolved += 1;
            } else {
                warn!(range_id = range.id, "Range has no usable boundary keys");
            }
            if (i + 1) % 100 == 0 {
                info!(processed = i + 1, total, "Refreshing range keys");
            }
        }

        info!(resolved, total, "Refreshed range keys");
        Ok(resolved)
    }

    fn resolve_boundary(&mut self, start: &BigInt, end: &BigInt) -> Result<Option<Boundary>> {
        let bounds = self.config.bounds.clone();

        let ring_first = self.nearest_key(&bounds.min)?;
        let ring_wrap = self.nearest_key(&bounds.max)?;
        let first = self.nearest_key(start)?;
        let last = self.nearest_key(end)?;

        let (Some(first), Some(last)) = (first, last) else {
            return Ok(None);
        };
        if last.starts_with(EMPTY_MARKER) || first.starts_with(EMPTY_MARKER) {
            return Ok(None);
        }

        // Both lookups land on the same key when the span holds either no key
        // or every key. Only the second case is worth processing, and then
        // the range is the whole ring.
        if first == last {
            let whole_ring = *start == bounds.min && *end == bounds.max;
            if whole_ring || self.span_contains_key(start, end, &first)? {
                return Ok(Some(Boundary {
                    first_key: String::new(),
                    last_key: String::new(),
                }));
            }
            return Ok(None);
        }

        let first_key = if ring_first.as_deref() == Some(first.as_str()) {
            String::new()
        } else {
            first
        };
        let last_key = if ring_wrap.as_deref() == Some(last.as_str()) {
            String::new()
        } else {
            last
        };

        Ok(Some(Boundary { first_key, last_key }))
    }

    fn span_contains_key(&mut self, start: &BigInt, end: &BigInt, key: &str) -> SourceResult<bool> {
        let retry = self.config.retry;
        let token = retry.run_with(
            "token of key",
            &mut self.keyspace,
            |ks| ks.token_of_key(key),
            SourceError::is_transient,
            reconnect,
        )?;
        Ok(token.is_some_and(|t| t > *start && t <= *end))
    }

    /// First key after a token, retrying transient failures
    fn nearest_key(&mut self, token: &BigInt) -> SourceResult<Option<String>> {
        let retry = self.config.retry;
        retry.run_with(
            "nearest key to token",
            &mut self.keyspace,
            |ks| ks.nearest_key_to_token(token),
            SourceError::is_transient,
            reconnect,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::error::RingError;
    use crate::source::{Columns, MemoryKeyspace};

    fn claimed(manager: &mut RangeManager<MemoryKeyspace>, count: usize) -> Vec<TokenRange> {
        manager.build_ranges(count).unwrap();
        manager.store().all_ranges().unwrap()
    }

    #[test]
    fn test_refresh_normalizes_ring_edges() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(&dir, "w", keyspace(), Recorder::default());
        let mut ranges = claimed(&mut manager, 4);

        for range in ranges.iter_mut() {
            assert!(manager.refresh_keys_for_range(range).unwrap());
        }

        let keys: Vec<(&str, &str)> = ranges
            .iter()
            .map(|r| (r.first_key.as_str(), r.last_key.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("", "k-45"), ("k-45", "k5"), ("k5", "k55"), ("k55", "")]
        );

        let stored = manager.store().get(ranges[1].id).unwrap();
        assert_eq!(stored.first_key, "k-45");
        assert_eq!(stored.last_key, "k5");
    }

    #[test]
    fn test_empty_span_is_degenerate() {
        let dir = tempfile::tempdir().unwrap();
        let ks = MemoryKeyspace::new();
        for t in [60, 70, 80] {
            ks.insert(format!("k{}", t), BigInt::from(t), Columns::new());
        }
        let mut manager = manager(&dir, "w", ks, Recorder::default());
        let mut ranges = claimed(&mut manager, 4);

        assert!(!manager.refresh_keys_for_range(&mut ranges[0]).unwrap());
        assert!(!manager.refresh_keys_for_range(&mut ranges[2]).unwrap());
        assert!(manager.refresh_keys_for_range(&mut ranges[3]).unwrap());
        assert_eq!(ranges[3].first_key, "");
        assert_eq!(ranges[3].last_key, "");
    }

    #[test]
    fn test_whole_ring_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(&dir, "w", keyspace(), Recorder::default());
        let mut ranges = claimed(&mut manager, 1);

        assert!(manager.refresh_keys_for_range(&mut ranges[0]).unwrap());
        assert_eq!(ranges[0].first_key, "");
        assert_eq!(ranges[0].last_key, "");
    }

    #[test]
    fn test_empty_keyspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(&dir, "w", MemoryKeyspace::new(), Recorder::default());
        let mut ranges = claimed(&mut manager, 1);
        assert!(!manager.refresh_keys_for_range(&mut ranges[0]).unwrap());
    }

    #[test]
    fn test_retries_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ks = keyspace();
        ks.fail_next(3);
        let mut manager = manager(&dir, "w", ks.clone(), Recorder::default());
        let mut ranges = claimed(&mut manager, 4);

        assert!(manager.refresh_keys_for_range(&mut ranges[1]).unwrap());
        assert_eq!(ks.reconnects(), 3);
    }

    #[test]
    fn test_gives_up_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let ks = keyspace();
        ks.fail_next(5);
        let mut manager = manager(&dir, "w", ks, Recorder::default());
        let mut ranges = claimed(&mut manager, 4);

        let err = manager.refresh_keys_for_range(&mut ranges[1]).unwrap_err();
        assert!(matches!(err, RingError::Source(SourceError::Timeout { .. })));
    }

    #[test]
    fn test_refresh_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(&dir, "w", keyspace(), Recorder::default());
        manager.build_ranges(4).unwrap();
        assert_eq!(manager.refresh_keys_for_all_ranges().unwrap(), 4);
    }
}
