//! ring-processor - Distributed Token-Range Processing
//!
//! Processes every key of a partitioned key-value store exactly once by
//! dividing the store's token ring into contiguous ranges and letting any
//! number of workers claim and walk them. Range state lives in a shared
//! SQLite database, which is the only thing workers coordinate through.
//!
//! # Features
//!
//! - **Optimistic claiming**: a claim is one conditional update, so no worker
//!   ever holds a lock while it talks to the data store.
//!
//! - **Resumable**: a worker that restarts with the same identity resumes the
//!   range it held; failed batches requeue the range with a bounded budget.
//!
//! - **Adaptive batching**: batch sizes follow round durations to keep each
//!   round inside a target time window.
//!
//! - **Sharded range tables**: one logical table can span several physical
//!   tables to spread write contention.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  Partitioned key-value store                 │
//! │                (keys placed on a token ring)                 │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ keys_between / nearest_key
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Workers                              │
//! │  ┌────────────┐  ┌────────────┐          ┌────────────┐      │
//! │  │ host|inst1 │  │ host|inst2 │   ...    │ host2|inst1│      │
//! │  │ processor  │  │ processor  │          │ processor  │      │
//! │  └─────┬──────┘  └─────┬──────┘          └─────┬──────┘      │
//! │        └───────────────┼───────────────────────┘             │
//! │                        │ claim / progress / complete         │
//! │                        ▼                                     │
//! │            ┌──────────────────────────┐                      │
//! │            │   Range table(s)         │                      │
//! │            │  - one row per range     │                      │
//! │            │  - WAL mode              │                      │
//! │            └──────────────────────────┘                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Create 1024 ranges over the Murmur3 ring
//! ring-processor build-ranges 1024
//!
//! # Run four workers on this host
//! ring-processor work --instances 4
//!
//! # Watch progress
//! ring-processor status
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod processor;
pub mod progress;
pub mod retry;
pub mod source;
pub mod stats;
pub mod store;
pub mod token;
pub mod tuner;

pub use error::{Result, RingError};
pub use manager::{ManagerConfig, RangeAdmin, RangeManager, RangeOutcome, Worker};
pub use processor::{KeyCountProcessor, RangeProcessor};
pub use store::{RangeStatus, RangeStore, StoreConfig, TokenRange};
pub use token::{Partitioner, TokenBounds};
