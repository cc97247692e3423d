//! Token range model
//!
//! A [`TokenRange`] is one unit of work. Its lifecycle is a single
//! [`RangeStatus`] rather than independent flags, so an impossible flag
//! combination cannot be persisted.

use crate::error::ConfigError;
use crate::token::parse_token;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeStatus {
    /// Waiting to be claimed
    Unclaimed,
    /// Claimed by the worker named in `owner`
    Processing,
    /// Finished successfully
    Processed,
    /// Terminal failure; only an operator reset reopens it
    Failed,
}

impl RangeStatus {
    pub const ALL: [RangeStatus; 4] = [
        RangeStatus::Unclaimed,
        RangeStatus::Processing,
        RangeStatus::Processed,
        RangeStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeStatus::Unclaimed => "unclaimed",
            RangeStatus::Processing => "processing",
            RangeStatus::Processed => "processed",
            RangeStatus::Failed => "failed",
        }
    }

    /// Map the legacy `(processing, processed, failed)` flags to a status.
    ///
    /// `failed` wins over everything, and `(1, 1, 0)` is also failed.
    pub fn from_legacy_flags(processing: bool, processed: bool, failed: bool) -> Self {
        match (processing, processed, failed) {
            (_, _, true) | (true, true, false) => RangeStatus::Failed,
            (true, false, false) => RangeStatus::Processing,
            (false, true, false) => RangeStatus::Processed,
            (false, false, false) => RangeStatus::Unclaimed,
        }
    }

    /// Canonical legacy flags `(processing, processed, failed)`
    pub fn legacy_flags(&self) -> (bool, bool, bool) {
        match self {
            RangeStatus::Unclaimed => (false, false, false),
            RangeStatus::Processing => (true, false, false),
            RangeStatus::Processed => (false, true, false),
            RangeStatus::Failed => (false, false, true),
        }
    }
}

impl fmt::Display for RangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unclaimed" => Ok(RangeStatus::Unclaimed),
            "processing" => Ok(RangeStatus::Processing),
            "processed" => Ok(RangeStatus::Processed),
            "failed" => Ok(RangeStatus::Failed),
            other => Err(format!("unknown range status '{}'", other)),
        }
    }
}

impl ToSql for RangeStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RangeStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// One persisted token range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRange {
    pub id: i64,

    /// Ring tokens as decimal strings; the range covers `(start, end]`
    pub start_token: String,
    pub end_token: String,

    /// Data-store keys at the boundaries ("" means ring start / ring end)
    pub first_key: String,
    pub last_key: String,

    pub status: RangeStatus,

    /// Current claimant, set only while processing
    pub owner: Option<String>,

    /// Most recent claimant, kept after release
    pub last_owner: Option<String>,

    pub total_items: u64,
    pub processed_items: u64,
    pub error_count: u64,

    /// Seconds spent on the last processing attempt
    pub processing_time: f64,

    /// Last error or requeue reason
    pub error: Option<String>,

    /// Processor-defined checkpoint blob
    pub range_data: Option<serde_json::Value>,

    pub requeue_count: u32,

    /// Claim-order key, re-randomized on every requeue
    pub random_key: i64,

    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub requeued_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Index of the shard table holding this row
    #[serde(skip)]
    pub shard: usize,
}

/// Column list matching [`TokenRange::from_row`]
pub(crate) const RANGE_COLUMNS: &str = "id, start_token, end_token, first_key, last_key, \
     status, owner, last_owner, total_items, processed_items, error_count, \
     processing_time, error, range_data, requeue_count, random_key, \
     created_at, claimed_at, heartbeat_at, requeued_at, updated_at";

impl TokenRange {
    /// Build from a row selected with [`RANGE_COLUMNS`]
    pub(crate) fn from_row(row: &Row<'_>, shard: usize) -> rusqlite::Result<Self> {
        let range_data: Option<String> = row.get(13)?;
        let range_data = match range_data {
            Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(13, rusqlite::types::Type::Text, e.into())
            })?),
            None => None,
        };

        Ok(Self {
            id: row.get(0)?,
            start_token: row.get(1)?,
            end_token: row.get(2)?,
            first_key: row.get(3)?,
            last_key: row.get(4)?,
            status: row.get(5)?,
            owner: row.get(6)?,
            last_owner: row.get(7)?,
            total_items: row.get::<_, i64>(8)? as u64,
            processed_items: row.get::<_, i64>(9)? as u64,
            error_count: row.get::<_, i64>(10)? as u64,
            processing_time: row.get(11)?,
            error: row.get(12)?,
            range_data,
            requeue_count: row.get::<_, i64>(14)? as u32,
            random_key: row.get(15)?,
            created_at: row.get(16)?,
            claimed_at: row.get(17)?,
            heartbeat_at: row.get(18)?,
            requeued_at: row.get(19)?,
            updated_at: row.get(20)?,
            shard,
        })
    }

    pub fn is_processing(&self) -> bool {
        self.status.legacy_flags().0
    }

    pub fn is_processed(&self) -> bool {
        self.status.legacy_flags().1
    }

    pub fn is_failed(&self) -> bool {
        self.status.legacy_flags().2
    }

    /// Start token as an integer
    pub fn start(&self) -> Result<BigInt, ConfigError> {
        parse_token(&self.start_token)
    }

    /// End token as an integer
    pub fn end(&self) -> Result<BigInt, ConfigError> {
        parse_token(&self.end_token)
    }

    /// Identity to show in listings: the owner, or the last owner
    pub fn host(&self) -> &str {
        self.owner
            .as_deref()
            .or(self.last_owner.as_deref())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_str() {
        for status in RangeStatus::ALL {
            assert_eq!(status.as_str().parse::<RangeStatus>().unwrap(), status);
        }
        assert!("done".parse::<RangeStatus>().is_err());
    }

    #[test]
    fn test_legacy_flags() {
        assert_eq!(
            RangeStatus::from_legacy_flags(false, false, false),
            RangeStatus::Unclaimed
        );
        assert_eq!(
            RangeStatus::from_legacy_flags(true, false, false),
            RangeStatus::Processing
        );
        assert_eq!(
            RangeStatus::from_legacy_flags(false, true, false),
            RangeStatus::Processed
        );
        assert_eq!(
            RangeStatus::from_legacy_flags(true, true, false),
            RangeStatus::Failed
        );
        assert_eq!(
            RangeStatus::from_legacy_flags(false, false, true),
            RangeStatus::Failed
        );
        assert_eq!(
            RangeStatus::from_legacy_flags(true, false, true),
            RangeStatus::Failed
        );

        for status in RangeStatus::ALL {
            let (p, d, f) = status.legacy_flags();
            assert_eq!(RangeStatus::from_legacy_flags(p, d, f), status);
            // Exactly one state holds
            assert!([p && !d && !f, !p && d && !f, !p && !d && f, !p && !d && !f]
                .iter()
                .filter(|&&x| x)
                .count()
                == 1);
        }
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&RangeStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }
}
