//! Data store collaborators
//!
//! The range manager reads the partitioned store through two narrow
//! capabilities:
//!
//! - [`RangeKeyLister`] enumerates keys in ring order and resolves tokens to
//!   the nearest keys
//! - [`KeyColumnFetcher`] loads column values for a batch of keys
//!
//! [`Keyspace`] bundles both with reconnection. Ring order is token order,
//! ties broken by key; an empty key stands for the ring start (as a start key)
//! or the ring end (as an end key).

pub mod memory;
pub mod redis_keyspace;

pub use memory::MemoryKeyspace;
pub use redis_keyspace::{RedisKeyspace, RedisKeyspaceConfig};

use crate::error::SourceResult;
use num_bigint::BigInt;
use std::collections::BTreeMap;

/// Column name to value
pub type Columns = BTreeMap<String, String>;

/// One row handed to a processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub columns: Columns,
}

impl Item {
    /// Item with no column data
    pub fn key_only(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            columns: Columns::new(),
        }
    }

    /// Parse a load line: a key followed by tab-separated `name=value`
    /// columns. Blank lines and `#` comments yield `None`.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.starts_with('#') {
            return None;
        }

        let mut fields = line.split('\t');
        let key = fields.next()?.trim();
        if key.is_empty() {
            return None;
        }
        let columns = fields
            .filter_map(|f| f.split_once('='))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        Some(Self {
            key: key.to_string(),
            columns,
        })
    }
}

/// Columns a processor needs for each key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ColumnSelection {
    /// Every column
    #[default]
    All,
    /// Only these columns
    Named(Vec<String>),
    /// Keys only; no column fetch is issued
    None,
}

impl ColumnSelection {
    /// Whether a column is part of the selection
    pub fn includes(&self, column: &str) -> bool {
        match self {
            ColumnSelection::All => true,
            ColumnSelection::Named(names) => names.iter().any(|n| n == column),
            ColumnSelection::None => false,
        }
    }
}

/// Key enumeration in ring order
pub trait RangeKeyLister {
    /// Up to `count` keys whose token is strictly greater than `token`,
    /// wrapping around to the ring start
    fn nearest_keys_to_token(&mut self, token: &BigInt, count: usize) -> SourceResult<Vec<String>>;

    /// Keys from `start_key` to `end_key`, both inclusive, at most `limit`
    fn keys_between(&mut self, start_key: &str, end_key: &str, limit: usize) -> SourceResult<Vec<String>>;

    /// Ring position of a key, if it can be determined
    fn token_of_key(&mut self, key: &str) -> SourceResult<Option<BigInt>>;

    /// The first key after `token`, if the ring has any key
    fn nearest_key_to_token(&mut self, token: &BigInt) -> SourceResult<Option<String>> {
        Ok(self.nearest_keys_to_token(token, 1)?.into_iter().next())
    }
}

/// Column loading for known keys
pub trait KeyColumnFetcher {
    /// Rows for `keys` in the same order; keys that vanished are returned
    /// with no columns
    fn fetch_columns(&mut self, keys: &[String], columns: &ColumnSelection) -> SourceResult<Vec<Item>>;
}

/// A connected view of one keyspace (column family)
pub trait Keyspace: RangeKeyLister + KeyColumnFetcher + Send {
    /// Drop and re-establish the connection after a transient failure
    fn reconnect(&mut self) -> SourceResult<()>;

    /// Keys between two boundaries with the selected columns
    fn get_keys_between(
        &mut self,
        start_key: &str,
        end_key: &str,
        limit: usize,
        columns: &ColumnSelection,
    ) -> SourceResult<Vec<Item>> {
        let keys = self.keys_between(start_key, end_key, limit)?;
        if *columns == ColumnSelection::None {
            return Ok(keys.into_iter().map(Item::key_only).collect());
        }
        self.fetch_columns(&keys, columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_selection() {
        assert!(ColumnSelection::All.includes("a"));
        assert!(!ColumnSelection::None.includes("a"));
        let named = ColumnSelection::Named(vec!["a".into()]);
        assert!(named.includes("a"));
        assert!(!named.includes("b"));
        assert_eq!(ColumnSelection::default(), ColumnSelection::All);
    }

    #[test]
    fn test_item_from_line() {
        let item = Item::from_line("user:42\tname=ada\tage=36\n").unwrap();
        assert_eq!(item.key, "user:42");
        assert_eq!(item.columns.get("name").map(String::as_str), Some("ada"));
        assert_eq!(item.columns.len(), 2);

        assert_eq!(Item::from_line("plain"), Some(Item::key_only("plain")));
        assert_eq!(Item::from_line(""), None);
        assert_eq!(Item::from_line("# comment"), None);
    }
}
