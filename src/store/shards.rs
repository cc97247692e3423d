//! Shard table discovery
//!
//! A logical table name ending in `*` is sharded: `token_ranges_*` stands for
//! `token_ranges_1`, `token_ranges_2`, ... up to the first missing table.
//! Any other name is a single table.

use crate::error::{ConfigError, StoreError, StoreResult};
use crate::store::schema;
use regex::Regex;
use rusqlite::Connection;
use std::sync::LazyLock;

/// Allowed logical table names (interpolated into SQL)
static TABLE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\*?$").expect("Invalid table name regex")
});

/// Validate a logical table name
pub fn validate_table_name(name: &str) -> Result<(), ConfigError> {
    if TABLE_NAME_REGEX.is_match(name) && name != "*" {
        Ok(())
    } else {
        Err(ConfigError::InvalidTableName(name.to_string()))
    }
}

/// Physical tables behind one logical range table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSet {
    logical: String,
    tables: Vec<String>,
}

impl ShardSet {
    /// Check if a logical name is sharded
    pub fn is_sharded_name(logical: &str) -> bool {
        logical.ends_with('*')
    }

    /// Name of the Nth shard (1-based)
    pub fn shard_name(logical: &str, n: usize) -> String {
        format!("{}{}", logical.trim_end_matches('*'), n)
    }

    /// Find the existing tables for a logical name
    pub fn discover(conn: &Connection, logical: &str) -> StoreResult<Self> {
        validate_table_name(logical).map_err(|e| StoreError::Schema(e.to_string()))?;

        let mut tables = Vec::new();
        if Self::is_sharded_name(logical) {
            let mut n = 1;
            loop {
                let name = Self::shard_name(logical, n);
                if !schema::table_exists(conn, &name)? {
                    break;
                }
                tables.push(name);
                n += 1;
            }
            if tables.is_empty() {
                return Err(StoreError::NoShards {
                    table: logical.to_string(),
                });
            }
        } else {
            schema::create_range_table(conn, logical)?;
            tables.push(logical.to_string());
        }

        Ok(Self {
            logical: logical.to_string(),
            tables,
        })
    }

    /// Create the tables for a logical name, `shards` of them when sharded
    pub fn create(conn: &Connection, logical: &str, shards: usize) -> StoreResult<Self> {
        validate_table_name(logical).map_err(|e| StoreError::Schema(e.to_string()))?;

        if Self::is_sharded_name(logical) {
            for n in 1..=shards.max(1) {
                schema::create_range_table(conn, &Self::shard_name(logical, n))?;
            }
        } else {
            schema::create_range_table(conn, logical)?;
        }

        Self::discover(conn, logical)
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Table for a shard index
    pub fn table(&self, shard: usize) -> &str {
        &self.tables[shard % self.tables.len()]
    }

    /// Shard indices in rotation order starting at `first`
    pub fn rotation(&self, first: usize) -> impl Iterator<Item = usize> + '_ {
        let n = self.tables.len();
        (0..n).map(move |i| (first + i) % n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("token_ranges").is_ok());
        assert!(validate_table_name("token_ranges_*").is_ok());
        assert!(validate_table_name("_t1").is_ok());
        assert!(validate_table_name("1table").is_err());
        assert!(validate_table_name("ranges; DROP TABLE x").is_err());
        assert!(validate_table_name("a*b").is_err());
        assert!(validate_table_name("*").is_err());
        assert!(validate_table_name("").is_err());
    }

    #[test]
    fn test_single_table() {
        let conn = Connection::open_in_memory().unwrap();
        let set = ShardSet::discover(&conn, "token_ranges").unwrap();
        assert_eq!(set.tables(), &["token_ranges".to_string()]);
    }

    #[test]
    fn test_sharded_discovery() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            ShardSet::discover(&conn, "ranges_*"),
            Err(StoreError::NoShards { .. })
        ));

        let set = ShardSet::create(&conn, "ranges_*", 3).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.table(0), "ranges_1");
        assert_eq!(set.table(2), "ranges_3");

        // Discovery stops at the first gap
        schema::create_range_table(&conn, "ranges_5").unwrap();
        let set = ShardSet::discover(&conn, "ranges_*").unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_rotation() {
        let conn = Connection::open_in_memory().unwrap();
        let set = ShardSet::create(&conn, "r_*", 3).unwrap();
        let order: Vec<usize> = set.rotation(2).collect();
        assert_eq!(order, vec![2, 0, 1]);
    }
}
