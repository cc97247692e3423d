//! Redis-backed keyspace
//!
//! Layout under a key prefix:
//! - `{prefix}:ring` is a sorted set with every score 0, members
//!   `{token}:{key}`. The token is encoded at a fixed width (see
//!   [`TokenBounds::encode`]), so lexicographic member order is ring order
//!   and `ZRANGEBYLEX` walks the ring.
//! - `{prefix}:row:{key}` is a hash holding the row's columns.

use crate::error::{SourceError, SourceResult};
use crate::source::{ColumnSelection, Columns, Item, KeyColumnFetcher, Keyspace, RangeKeyLister};
use crate::token::{Partitioner, TokenBounds};
use num_bigint::BigInt;
use redis::{Client, Connection};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Sorted set suffix
const RING_SUFFIX: &str = "ring";

/// Row hash suffix
const ROW_SUFFIX: &str = "row";

/// Configuration for a Redis keyspace
#[derive(Debug, Clone)]
pub struct RedisKeyspaceConfig {
    /// Redis connection URL
    pub url: String,
    /// Key prefix (one keyspace per prefix)
    pub prefix: String,
    /// Scheme used to place keys on the ring
    pub partitioner: Partitioner,
    /// Connect, read and write timeout
    pub timeout: Duration,
}

impl Default for RedisKeyspaceConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "ring-processor".to_string(),
            partitioner: Partitioner::Murmur3,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RedisKeyspaceConfig {
    /// Create config with custom Redis URL
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }
}

/// Keyspace stored in Redis
pub struct RedisKeyspace {
    client: Client,
    conn: Connection,
    config: RedisKeyspaceConfig,
    bounds: TokenBounds,
    ring_key: String,
}

impl RedisKeyspace {
    /// Connect to Redis
    pub fn connect(config: RedisKeyspaceConfig) -> SourceResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| SourceError::Unavailable {
            reason: format!("{}: {}", config.url, e),
        })?;
        let conn = Self::open_connection(&client, config.timeout)?;
        let bounds = config.partitioner.bounds();
        let ring_key = format!("{}:{}", config.prefix, RING_SUFFIX);

        debug!(url = %config.url, prefix = %config.prefix, "Connected to Redis keyspace");
        Ok(Self {
            client,
            conn,
            config,
            bounds,
            ring_key,
        })
    }

    fn open_connection(client: &Client, timeout: Duration) -> SourceResult<Connection> {
        let conn = client.get_connection_with_timeout(timeout)?;
        conn.set_read_timeout(Some(timeout))?;
        conn.set_write_timeout(Some(timeout))?;
        Ok(conn)
    }

    pub fn config(&self) -> &RedisKeyspaceConfig {
        &self.config
    }

    fn row_key(&self, key: &str) -> String {
        format!("{}:{}:{}", self.config.prefix, ROW_SUFFIX, key)
    }

    fn member(&self, key: &str) -> String {
        ring_member(&self.bounds, &self.config.partitioner.token_for_key(key), key)
    }

    /// Store a row (used by the `load` command and tests)
    pub fn put(&mut self, key: &str, columns: &Columns) -> SourceResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(&self.ring_key)
            .arg(0)
            .arg(self.member(key))
            .ignore();
        if !columns.is_empty() {
            pipe.cmd("HSET").arg(self.row_key(key));
            for (name, value) in columns {
                pipe.arg(name).arg(value);
            }
            pipe.ignore();
        }
        pipe.query::<()>(&mut self.conn)?;
        Ok(())
    }

    /// Number of keys on the ring
    pub fn len(&mut self) -> SourceResult<u64> {
        Ok(redis::cmd("ZCARD").arg(&self.ring_key).query(&mut self.conn)?)
    }

    fn range_by_lex(&mut self, min: &str, max: &str, limit: usize) -> SourceResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let members: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(&self.ring_key)
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query(&mut self.conn)?;
        members.iter().map(|m| member_key(m)).collect()
    }
}

/// Sorted-set member for a key at a token
fn ring_member(bounds: &TokenBounds, token: &BigInt, key: &str) -> String {
    format!("{}:{}", bounds.encode(token), key)
}

/// Key part of a sorted-set member
fn member_key(member: &str) -> SourceResult<String> {
    member
        .split_once(':')
        .map(|(_, key)| key.to_string())
        .ok_or_else(|| SourceError::Redis(format!("malformed ring member '{}'", member)))
}

impl RangeKeyLister for RedisKeyspace {
    fn nearest_keys_to_token(&mut self, token: &BigInt, count: usize) -> SourceResult<Vec<String>> {
        // ';' sorts right after ':', so this skips every member at `token`
        let after = format!("{};", self.bounds.encode(token));
        let mut keys = self.range_by_lex(&format!("[{}", after), "+", count)?;
        if keys.len() < count {
            let wrapped = self.range_by_lex("-", &format!("({}", after), count - keys.len())?;
            keys.extend(wrapped);
        }
        Ok(keys)
    }

    fn keys_between(&mut self, start_key: &str, end_key: &str, limit: usize) -> SourceResult<Vec<String>> {
        let start = (!start_key.is_empty()).then(|| self.member(start_key));
        let end = (!end_key.is_empty()).then(|| self.member(end_key));

        match (start, end) {
            (Some(s), Some(e)) if s > e => {
                let mut keys = self.range_by_lex(&format!("[{}", s), "+", limit)?;
                let rest = limit - keys.len();
                keys.extend(self.range_by_lex("-", &format!("[{}", e), rest)?);
                Ok(keys)
            }
            (start, end) => {
                let min = start.map(|s| format!("[{}", s)).unwrap_or_else(|| "-".into());
                let max = end.map(|e| format!("[{}", e)).unwrap_or_else(|| "+".into());
                self.range_by_lex(&min, &max, limit)
            }
        }
    }

    fn token_of_key(&mut self, key: &str) -> SourceResult<Option<BigInt>> {
        Ok(Some(self.config.partitioner.token_for_key(key)))
    }
}

impl KeyColumnFetcher for RedisKeyspace {
    fn fetch_columns(&mut self, keys: &[String], selection: &ColumnSelection) -> SourceResult<Vec<Item>> {
        if keys.is_empty() || *selection == ColumnSelection::None {
            return Ok(keys.iter().map(|k| Item::key_only(k.as_str())).collect());
        }

        let mut pipe = redis::pipe();
        match selection {
            ColumnSelection::Named(names) => {
                for key in keys {
                    pipe.cmd("HMGET").arg(self.row_key(key)).arg(names);
                }
                let rows: Vec<Vec<Option<String>>> = pipe.query(&mut self.conn)?;
                Ok(keys
                    .iter()
                    .zip(rows)
                    .map(|(key, values)| Item {
                        key: key.clone(),
                        columns: names
                            .iter()
                            .zip(values)
                            .filter_map(|(name, value)| value.map(|v| (name.clone(), v)))
                            .collect(),
                    })
                    .collect())
            }
            _ => {
                for key in keys {
                    pipe.cmd("HGETALL").arg(self.row_key(key));
                }
                let rows: Vec<HashMap<String, String>> = pipe.query(&mut self.conn)?;
                Ok(keys
                    .iter()
                    .zip(rows)
                    .map(|(key, row)| Item {
                        key: key.clone(),
                        columns: row.into_iter().collect(),
                    })
                    .collect())
            }
        }
    }
}

impl Keyspace for RedisKeyspace {
    fn reconnect(&mut self) -> SourceResult<()> {
        info!(url = %self.config.url, "Reconnecting to Redis");
        self.conn = Self::open_connection(&self.client, self.config.timeout)?;
        Ok(())
    }
}
