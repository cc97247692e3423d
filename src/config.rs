//! Configuration types for ring-processor
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Validated runtime configuration for the store, the keyspace and workers
//! - Worker identities (`host|instN`)

use crate::error::ConfigError;
use crate::manager::ManagerConfig;
use crate::source::RedisKeyspaceConfig;
use crate::store::{validate_table_name, StoreConfig, DEFAULT_MAX_REQUEUES, DEFAULT_TABLE};
use crate::token::{parse_token, Partitioner, TokenBounds};
use crate::tuner::TunerSettings;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Maximum worker instances per launcher
pub const MAX_INSTANCES: usize = 64;

/// Distributed token-range processor
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ring-processor",
    version,
    about = "Distributed token-range processor for partitioned key-value stores",
    long_about = "Divides a partitioned store's token ring into ranges tracked in SQLite.\n\n\
                  Any number of workers, on any number of hosts, claim ranges from the shared\n\
                  range table, walk their keys in batches and record the outcome.",
    after_help = "EXAMPLES:\n    \
        ring-processor build-ranges 1024\n    \
        ring-processor work --instances 4 --stats-dir stats/\n    \
        ring-processor status --json\n    \
        ring-processor --table 'token_ranges_*' init --shards 8"
)]
pub struct CliArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Range database file
    #[arg(long, global = true, env = "RING_DB", default_value = "ranges.db", value_name = "FILE")]
    pub db: PathBuf,

    /// Range table name (`name_*` for sharded tables)
    #[arg(long, global = true, env = "RING_TABLE", default_value = DEFAULT_TABLE, value_name = "NAME")]
    pub table: String,

    /// Redis URL of the keyspace
    #[arg(
        long,
        global = true,
        env = "RING_REDIS_URL",
        default_value = "redis://127.0.0.1:6379",
        value_name = "URL"
    )]
    pub redis_url: String,

    /// Key prefix of the keyspace in Redis
    #[arg(long, global = true, env = "RING_PREFIX", default_value = "ring-processor", value_name = "PREFIX")]
    pub prefix: String,

    /// Partitioner (Murmur3Partitioner or RandomPartitioner)
    #[arg(long, global = true, env = "RING_PARTITIONER", default_value = "Murmur3Partitioner")]
    pub partitioner: String,

    /// Data-store timeout in seconds
    #[arg(long, global = true, default_value = "10", value_name = "SECS")]
    pub timeout: u64,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the range table (or N shard tables for a `name_*` table)
    Init {
        /// Number of shard tables
        #[arg(long, default_value = "1", value_name = "NUM")]
        shards: usize,
    },

    /// Delete all ranges and build COUNT new ones over the ring
    BuildRanges {
        /// Number of ranges
        #[arg(value_name = "COUNT")]
        count: usize,

        /// Override the ring's minimum token
        #[arg(long, value_name = "TOKEN", allow_hyphen_values = true)]
        min: Option<String>,

        /// Override the ring's maximum token
        #[arg(long, value_name = "TOKEN", allow_hyphen_values = true)]
        max: Option<String>,
    },

    /// Return every range to the unclaimed pool
    ResetRanges,

    /// Return one range to the unclaimed pool
    ResetRange {
        #[arg(value_name = "ID")]
        id: i64,
    },

    /// Resolve and store the boundary keys of every range
    RefreshKeys,

    /// List failed ranges
    ListFailed {
        /// Maximum ranges to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// List ranges requeued recently
    ListRequeued {
        /// Window in minutes
        #[arg(long, default_value = "60", value_name = "MINS")]
        mins: i64,
    },

    /// Reopen failed ranges with a fresh requeue budget
    ResetFailed,

    /// Reopen ranges stuck in processing
    ResetProcessing {
        /// Only ranges without a heartbeat for this many minutes
        #[arg(long, value_name = "MINS")]
        stale_mins: Option<i64>,
    },

    /// Show the per-status summary
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the data a processor stored with a range
    ShowRangeData {
        #[arg(value_name = "ID")]
        id: i64,
    },

    /// Count the keys between two keys (empty string for the ring edge)
    CountRange {
        #[arg(value_name = "START_KEY")]
        start_key: String,

        #[arg(value_name = "END_KEY")]
        end_key: String,
    },

    /// Show the keys nearest two tokens
    GetKeys {
        #[arg(value_name = "START_TOKEN", allow_hyphen_values = true)]
        start_token: String,

        #[arg(value_name = "END_TOKEN", allow_hyphen_values = true)]
        end_token: String,

        /// Keys per token
        #[arg(value_name = "COUNT", default_value = "10")]
        count: usize,
    },

    /// Load rows into the keyspace (`key<TAB>name=value...` per line)
    Load {
        /// Input file (stdin when omitted)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Claim and process ranges until none are left
    Work(WorkArgs),
}

/// Options of the `work` subcommand
#[derive(Args, Debug, Clone)]
pub struct WorkArgs {
    /// Run one worker with this instance name
    #[arg(long, value_name = "NAME", conflicts_with = "instances")]
    pub instance: Option<String>,

    /// Number of worker instances (inst1..instN)
    #[arg(short = 'n', long, default_value = "1", value_name = "NUM")]
    pub instances: usize,

    /// Pass dry-run to processors
    #[arg(long)]
    pub dry_run: bool,

    /// Fixed batch size (disables tuning)
    #[arg(short = 'b', long, value_name = "NUM")]
    pub batch_size: Option<usize>,

    /// Rounds faster than this grow the batch (seconds)
    #[arg(long, default_value = "5", value_name = "SECS")]
    pub min_batch_time: f64,

    /// Rounds slower than this shrink the batch (seconds)
    #[arg(long, default_value = "20", value_name = "SECS")]
    pub max_batch_time: f64,

    /// Requeues allowed before a range is failed
    #[arg(long, default_value_t = DEFAULT_MAX_REQUEUES, value_name = "NUM")]
    pub max_requeues: u32,

    /// Directory for stats and checkpoint files
    #[arg(long, value_name = "DIR")]
    pub stats_dir: Option<PathBuf>,

    /// Seconds between stats log reports
    #[arg(long, default_value = "15", value_name = "SECS")]
    pub report_interval: u64,
}

impl GlobalArgs {
    pub fn partitioner(&self) -> Result<Partitioner, ConfigError> {
        Partitioner::from_str(&self.partitioner)
    }

    /// Validated range store settings
    pub fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        validate_table_name(&self.table)?;
        Ok(StoreConfig::new(&self.db).with_table(&self.table))
    }

    /// Redis keyspace settings
    pub fn keyspace_config(&self) -> Result<RedisKeyspaceConfig, ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::MissingRequired("a key prefix".into()));
        }
        Ok(RedisKeyspaceConfig {
            url: self.redis_url.clone(),
            prefix: self.prefix.clone(),
            partitioner: self.partitioner()?,
            timeout: Duration::from_secs(self.timeout.max(1)),
        })
    }

    /// Ring bounds, with optional overrides of either end
    pub fn bounds(&self, min: Option<&str>, max: Option<&str>) -> Result<TokenBounds, ConfigError> {
        let ring = self.partitioner()?.bounds();
        let min = min.map(parse_token).transpose()?.unwrap_or(ring.min);
        let max = max.map(parse_token).transpose()?.unwrap_or(ring.max);
        TokenBounds::new(min, max)
    }
}

/// Validated runtime configuration of a `work` run
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Range store settings, shared by every instance
    pub store: StoreConfig,

    /// Keyspace settings, shared by every instance
    pub keyspace: RedisKeyspaceConfig,

    /// One manager config per instance
    pub instances: Vec<ManagerConfig>,

    /// Fixed batch size for the processor
    pub batch_size: Option<usize>,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl WorkerConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_work_args(global: &GlobalArgs, work: &WorkArgs, host: &str) -> Result<Self, ConfigError> {
        let store = global.store_config()?;
        let keyspace = global.keyspace_config()?;

        if work.instance.is_none() && (work.instances == 0 || work.instances > MAX_INSTANCES) {
            return Err(ConfigError::InvalidInstanceCount {
                count: work.instances,
                max: MAX_INSTANCES,
            });
        }

        if let Some(size) = work.batch_size {
            if size == 0 {
                return Err(ConfigError::InvalidBatchSize { min: size, max: size });
            }
        }

        let tuner = tuner_settings(work)?;
        let names = instance_names(work);

        let instances = names
            .iter()
            .map(|name| {
                let mut config = ManagerConfig::new(identity(host, name), keyspace.partitioner.bounds());
                config.max_requeues = work.max_requeues;
                config.tuner = tuner;
                config.dry_run = work.dry_run;
                config.stats_dir = work.stats_dir.clone();
                config.report_interval = Duration::from_secs(work.report_interval.max(1));
                config
            })
            .collect();

        Ok(Self {
            store,
            keyspace,
            instances,
            batch_size: work.batch_size,
            show_progress: !global.quiet,
            verbose: global.verbose,
        })
    }
}

fn tuner_settings(work: &WorkArgs) -> Result<TunerSettings, ConfigError> {
    let (min, max) = (work.min_batch_time, work.max_batch_time);
    if !(min.is_finite() && max.is_finite()) || min <= 0.0 || min > max {
        return Err(ConfigError::InvalidBatchTime { min, max });
    }

    let settings = TunerSettings::default()
        .with_time_bounds(Duration::from_secs_f64(min), Duration::from_secs_f64(max));
    settings.validate()?;
    Ok(settings)
}

fn instance_names(work: &WorkArgs) -> Vec<String> {
    match &work.instance {
        Some(name) => vec![name.clone()],
        None => (1..=work.instances).map(|i| format!("inst{}", i)).collect(),
    }
}

/// Worker identity for an instance on a host
pub fn identity(host: &str, instance: &str) -> String {
    format!("{}|{}", host, instance)
}

/// This machine's host name
pub fn local_hostname() -> Result<String, ConfigError> {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .map_err(|e| ConfigError::MissingRequired(format!("host name ({})", e)))
}
