//! In-memory keyspace
//!
//! An ordered ring of `(token, key)` entries behind a shared lock. Clones
//! share the same data, so several workers can read one ring. Failures can be
//! injected to exercise the retry, requeue and fail paths.

use crate::error::{SourceError, SourceResult};
use crate::source::{ColumnSelection, Columns, Item, KeyColumnFetcher, Keyspace, RangeKeyLister};
use crate::token::Partitioner;
use num_bigint::BigInt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

type RingKey = (BigInt, String);

#[derive(Debug, Default)]
struct Ring {
    rows: BTreeMap<RingKey, Columns>,
    tokens: HashMap<String, BigInt>,
    partitioner: Option<Partitioner>,
    pending_failures: u32,
    injected_error: Option<SourceError>,
    reconnects: u64,
    fetches: u64,
}

impl Ring {
    fn take_failure(&mut self, operation: &str) -> SourceResult<()> {
        if self.pending_failures == 0 {
            return Ok(());
        }
        self.pending_failures -= 1;
        let error = match &self.injected_error {
            Some(error) => error.clone(),
            None => SourceError::Timeout {
                operation: operation.to_string(),
            },
        };
        if self.pending_failures == 0 {
            self.injected_error = None;
        }
        Err(error)
    }

    fn position(&self, key: &str) -> SourceResult<RingKey> {
        if let Some(token) = self.tokens.get(key) {
            return Ok((token.clone(), key.to_string()));
        }
        match self.partitioner {
            Some(p) => Ok((p.token_for_key(key), key.to_string())),
            None => Err(SourceError::UnknownKey { key: key.to_string() }),
        }
    }
}

/// Shared in-memory ring
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyspace {
    ring: Arc<RwLock<Ring>>,
}

impl MemoryKeyspace {
    /// Empty ring; keys must be inserted with explicit tokens
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty ring that hashes keys with a partitioner
    pub fn with_partitioner(partitioner: Partitioner) -> Self {
        let keyspace = Self::default();
        keyspace.ring.write().partitioner = Some(partitioner);
        keyspace
    }

    /// Insert a key at an explicit token
    pub fn insert(&self, key: impl Into<String>, token: BigInt, columns: Columns) {
        let key = key.into();
        let mut ring = self.ring.write();
        if let Some(old) = ring.tokens.insert(key.clone(), token.clone()) {
            ring.rows.remove(&(old, key.clone()));
        }
        ring.rows.insert((token, key), columns);
    }

    /// Insert a key at its partitioner token
    pub fn put(&self, key: impl Into<String>, columns: Columns) -> SourceResult<BigInt> {
        let key = key.into();
        let partitioner = self.ring.read().partitioner.ok_or_else(|| SourceError::UnknownKey {
            key: key.clone(),
        })?;
        let token = partitioner.token_for_key(&key);
        self.insert(key, token.clone(), columns);
        Ok(token)
    }

    /// Fail the next `count` calls with a timeout
    pub fn fail_next(&self, count: u32) {
        let mut ring = self.ring.write();
        ring.pending_failures = count;
        ring.injected_error = None;
    }

    /// Fail the next `count` calls with `error`
    pub fn fail_next_with(&self, count: u32, error: SourceError) {
        let mut ring = self.ring.write();
        ring.pending_failures = count;
        ring.injected_error = Some(error);
    }

    pub fn len(&self) -> usize {
        self.ring.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().rows.is_empty()
    }

    /// Number of reconnects requested so far
    pub fn reconnects(&self) -> u64 {
        self.ring.read().reconnects
    }

    /// Number of column fetches issued so far
    pub fn fetches(&self) -> u64 {
        self.ring.read().fetches
    }
}

impl RangeKeyLister for MemoryKeyspace {
    fn nearest_keys_to_token(&mut self, token: &BigInt, count: usize) -> SourceResult<Vec<String>> {
        let mut ring = self.ring.write();
        ring.take_failure("nearest_keys_to_token")?;

        let after = (token + 1u32, String::new());
        let keys = ring
            .rows
            .range(after.clone()..)
            .chain(ring.rows.range(..after))
            .take(count)
            .map(|((_, key), _)| key.clone())
            .collect();
        Ok(keys)
    }

    fn keys_between(&mut self, start_key: &str, end_key: &str, limit: usize) -> SourceResult<Vec<String>> {
        let mut ring = self.ring.write();
        ring.take_failure("keys_between")?;

        let start = if start_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(ring.position(start_key)?)
        };
        let end = if end_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(ring.position(end_key)?)
        };

        let wraps = match (&start, &end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            _ => false,
        };

        let keys: Vec<String> = if wraps {
            ring.rows
                .range((start, Bound::Unbounded))
                .chain(ring.rows.range((Bound::Unbounded, end)))
                .take(limit)
                .map(|((_, key), _)| key.clone())
                .collect()
        } else {
            ring.rows
                .range((start, end))
                .take(limit)
                .map(|((_, key), _)| key.clone())
                .collect()
        };
        Ok(keys)
    }

    fn token_of_key(&mut self, key: &str) -> SourceResult<Option<BigInt>> {
        let ring = self.ring.read();
        match ring.position(key) {
            Ok((token, _)) => Ok(Some(token)),
            Err(SourceError::UnknownKey { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl KeyColumnFetcher for MemoryKeyspace {
    fn fetch_columns(&mut self, keys: &[String], selection: &ColumnSelection) -> SourceResult<Vec<Item>> {
        let mut ring = self.ring.write();
        ring.take_failure("fetch_columns")?;
        ring.fetches += 1;

        let items = keys
            .iter()
            .map(|key| {
                let row = ring
                    .tokens
                    .get(key)
                    .and_then(|token| ring.rows.get(&(token.clone(), key.clone())));
                let columns = row
                    .map(|row| {
                        row.iter()
                            .filter(|(name, _)| selection.includes(name))
                            .map(|(name, value)| (name.clone(), value.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                Item {
                    key: key.clone(),
                    columns,
                }
            })
            .collect();
        Ok(items)
    }
}

impl Keyspace for MemoryKeyspace {
    fn reconnect(&mut self) -> SourceResult<()> {
        self.ring.write().reconnects += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> MemoryKeyspace {
        let ks = MemoryKeyspace::new();
        for token in [10, 20, 30, 40] {
            let mut columns = Columns::new();
            columns.insert("v".into(), token.to_string());
            columns.insert("w".into(), "x".into());
            ks.insert(format!("k{}", token), BigInt::from(token), columns);
        }
        ks
    }

    #[test]
    fn test_nearest_keys() {
        let mut ks = ring();
        assert_eq!(ks.nearest_keys_to_token(&BigInt::from(10), 2).unwrap(), vec!["k20", "k30"]);
        assert_eq!(ks.nearest_keys_to_token(&BigInt::from(15), 1).unwrap(), vec!["k20"]);
        // Wraps past the ring end
        assert_eq!(ks.nearest_keys_to_token(&BigInt::from(40), 2).unwrap(), vec!["k10", "k20"]);
        assert_eq!(ks.nearest_keys_to_token(&BigInt::from(0), 10).unwrap().len(), 4);
        assert_eq!(
            ks.nearest_key_to_token(&BigInt::from(35)).unwrap().as_deref(),
            Some("k40")
        );
    }

    #[test]
    fn test_keys_between() {
        let mut ks = ring();
        assert_eq!(ks.keys_between("k20", "k30", 10).unwrap(), vec!["k20", "k30"]);
        assert_eq!(ks.keys_between("", "k20", 10).unwrap(), vec!["k10", "k20"]);
        assert_eq!(ks.keys_between("k30", "", 10).unwrap(), vec!["k30", "k40"]);
        assert_eq!(ks.keys_between("", "", 3).unwrap(), vec!["k10", "k20", "k30"]);
        assert_eq!(ks.keys_between("k40", "k10", 10).unwrap(), vec!["k40", "k10"]);
        assert!(matches!(
            ks.keys_between("nope", "", 1),
            Err(SourceError::UnknownKey { .. })
        ));
    }

    #[test]
    fn test_fetch_columns() {
        let mut ks = ring();
        let keys = vec!["k10".to_string(), "gone".to_string()];
        let items = ks
            .fetch_columns(&keys, &ColumnSelection::Named(vec!["v".into()]))
            .unwrap();
        assert_eq!(items[0].columns.get("v").map(String::as_str), Some("10"));
        assert!(!items[0].columns.contains_key("w"));
        assert!(items[1].columns.is_empty());
    }

    #[test]
    fn test_get_keys_between_skips_fetch() {
        let mut ks = ring();
        let items = ks.get_keys_between("", "", 10, &ColumnSelection::None).unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(ks.fetches(), 0);
        ks.get_keys_between("", "", 10, &ColumnSelection::All).unwrap();
        assert_eq!(ks.fetches(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let mut ks = ring();
        ks.fail_next(2);
        assert!(ks.keys_between("", "", 1).unwrap_err().is_transient());
        assert!(ks.nearest_keys_to_token(&BigInt::from(0), 1).is_err());
        assert!(ks.keys_between("", "", 1).is_ok());
    }

    #[test]
    fn test_partitioner_put() {
        let ks = MemoryKeyspace::with_partitioner(Partitioner::Murmur3);
        let token = ks.put("alpha", Columns::new()).unwrap();
        assert_eq!(token, Partitioner::Murmur3.token_for_key("alpha"));
        assert!(MemoryKeyspace::new().put("alpha", Columns::new()).is_err());

        // Re-inserting moves the key instead of duplicating it
        ks.insert("alpha", BigInt::from(1), Columns::new());
        assert_eq!(ks.len(), 1);
    }

    #[test]
    fn test_injected_errors() {
        let mut ks = ring();
        ks.fail_next_with(
            2,
            SourceError::Status {
                code: 400,
                message: "bad request".into(),
            },
        );

        for _ in 0..2 {
            let err = ks.keys_between("k10", "k30", 10).unwrap_err();
            assert!(matches!(err, SourceError::Status { code: 400, .. }));
            assert!(!err.is_transient());
        }
        assert_eq!(ks.keys_between("k10", "k30", 10).unwrap().len(), 3);

        ks.fail_next(1);
        assert!(ks.keys_between("k10", "k30", 10).unwrap_err().is_transient());
    }
}
