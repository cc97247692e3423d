//! Integration tests for ring-processor
//!
//! Workers run against an in-memory keyspace and a SQLite range store in a
//! temporary directory, so no external data store is needed.

use num_bigint::BigInt;
use parking_lot::Mutex;
use ring_processor::manager::{ManagerConfig, RangeManager, RangeOutcome, Worker};
use ring_processor::processor::{BatchError, BatchHandler, ProcessMode, ProcessorError, RangeContext, RangeProcessor};
use ring_processor::retry::RetryPolicy;
use ring_processor::source::{Columns, Item, MemoryKeyspace};
use ring_processor::store::{RangeCounters, RangeStatus, RangeStore, RequeueOutcome, StoreConfig};
use ring_processor::token::{Partitioner, TokenBounds};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

/// Records keys across workers; fails the first batch of chosen ranges once
#[derive(Clone, Default)]
struct SharedRecorder {
    keys: Arc<Mutex<Vec<String>>>,
    fail_once: Arc<Mutex<HashSet<i64>>>,
    current: i64,
}

impl BatchHandler for SharedRecorder {
    fn process_batch(&mut self, items: &[Item]) -> Result<u64, ProcessorError> {
        if self.fail_once.lock().remove(&self.current) {
            return Err(BatchError::new(items.len() as u64, "forced failure").into());
        }
        self.keys.lock().extend(items.iter().map(|i| i.key.clone()));
        Ok(items.len() as u64)
    }
}

impl RangeProcessor for SharedRecorder {
    fn mode(&mut self) -> ProcessMode<'_> {
        ProcessMode::Batch(self)
    }

    fn batch_size_bounds(&self) -> Option<(usize, usize)> {
        Some((100, 100))
    }

    fn begin_range(&mut self, ctx: &RangeContext<'_>) -> Result<(), ProcessorError> {
        self.current = ctx.range.id;
        Ok(())
    }
}

/// 40 keys at tokens -95, -90, ..., 100
fn small_ring() -> MemoryKeyspace {
    let ks = MemoryKeyspace::new();
    for t in (-95..=100).step_by(5) {
        ks.insert(format!("k{}", t), BigInt::from(t), Columns::new());
    }
    ks
}

fn small_bounds() -> TokenBounds {
    TokenBounds::new(BigInt::from(-100), BigInt::from(100)).unwrap()
}

fn open_store(db: &Path) -> RangeStore {
    RangeStore::open(StoreConfig::new(db)).unwrap()
}

fn worker_manager(
    db: &Path,
    identity: &str,
    keyspace: MemoryKeyspace,
    processor: SharedRecorder,
) -> RangeManager<MemoryKeyspace> {
    let mut config = ManagerConfig::new(identity, small_bounds());
    config.retry = RetryPolicy::immediate(5);
    RangeManager::new(config, open_store(db), keyspace, Box::new(processor)).unwrap()
}

#[test]
fn test_two_workers_with_forced_batch_error() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("ranges.db");
    let ks = small_ring();
    let recorder = SharedRecorder::default();
    recorder.fail_once.lock().insert(3);

    let mut first = worker_manager(&db, "host|inst1", ks.clone(), recorder.clone());
    assert_eq!(first.build_ranges(4).unwrap(), 4);

    let ranges = open_store(&db).all_ranges().unwrap();
    let spans: Vec<(&str, &str)> = ranges
        .iter()
        .map(|r| (r.start_token.as_str(), r.end_token.as_str()))
        .collect();
    assert_eq!(spans, vec![("-100", "-50"), ("-50", "0"), ("0", "50"), ("50", "100")]);

    let second = worker_manager(&db, "host|inst2", ks, recorder.clone());
    let workers = vec![
        Worker::spawn("inst1", first).unwrap(),
        Worker::spawn("inst2", second).unwrap(),
    ];
    for worker in workers {
        worker.join().unwrap();
    }

    let store = open_store(&db);
    for range in store.all_ranges().unwrap() {
        assert_eq!(range.status, RangeStatus::Processed, "range {}", range.id);
        assert_eq!(range.requeue_count, u32::from(range.id == 3), "range {}", range.id);
        assert_eq!(range.processed_items, 10);
    }

    let mut keys = recorder.keys.lock().clone();
    assert_eq!(keys.len(), 40);
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 40);
}

#[test]
fn test_forced_batch_error_requeues_range() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("ranges.db");
    let recorder = SharedRecorder::default();
    recorder.fail_once.lock().insert(3);

    let mut manager = worker_manager(&db, "w", small_ring(), recorder);
    manager.build_ranges(4).unwrap();

    // Claim range 3 directly and hand it to the manager
    let mut store = open_store(&db);
    let range = loop {
        assert!(store.try_claim(0, "w", None).unwrap());
        let owned = store.find_owned("w").unwrap().unwrap();
        if owned.id == 3 {
            break owned;
        }
        store.complete(&owned, "w", &RangeCounters::default(), None).unwrap();
    };

    let outcome = manager.run_range(range).unwrap();
    assert_eq!(outcome, RangeOutcome::Requeued { requeue_count: 1 });

    let row = store.get(3).unwrap();
    assert_eq!(row.status, RangeStatus::Unclaimed);
    assert_eq!(row.requeue_count, 1);
    assert_eq!(row.status.legacy_flags(), (false, false, false));
}

#[test]
fn test_at_most_one_claimant() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("ranges.db");
    let spans = small_bounds().split(50).unwrap();
    open_store(&db).build_ranges(&spans).unwrap();

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let threads: Vec<_> = (0..6)
        .map(|i| {
            let db = db.clone();
            let claimed = Arc::clone(&claimed);
            thread::spawn(move || {
                let owner = format!("claimer{}", i);
                let mut store = open_store(&db);
                while store.try_claim(0, &owner, None).unwrap() {
                    let range = store.find_owned(&owner).unwrap().unwrap();
                    claimed.lock().push(range.id);
                    assert!(store
                        .complete(&range, &owner, &RangeCounters::default(), None)
                        .unwrap());
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let mut ids = claimed.lock().clone();
    assert_eq!(ids.len(), 50);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 50);
}

#[test]
fn test_requeue_bound() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("ranges.db");
    let mut store = open_store(&db);
    store.build_ranges(&small_bounds().split(1).unwrap()).unwrap();

    let max = 3;
    for expected in 1..=max {
        assert!(store.try_claim(0, "w", None).unwrap());
        let range = store.find_owned("w").unwrap().unwrap();
        let outcome = store.requeue(&range, "w", "timeout", max).unwrap();
        assert_eq!(outcome, RequeueOutcome::Requeued { requeue_count: expected });
    }

    assert!(store.try_claim(0, "w", None).unwrap());
    let range = store.find_owned("w").unwrap().unwrap();
    assert_eq!(
        store.requeue(&range, "w", "timeout", max).unwrap(),
        RequeueOutcome::Failed
    );

    let row = store.get(range.id).unwrap();
    assert!(row.is_failed());
    assert!(!store.try_claim(0, "w", None).unwrap());
}

#[test]
fn test_reset_range_is_idempotent() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("ranges.db");
    let mut store = open_store(&db);
    store.build_ranges(&small_bounds().split(4).unwrap()).unwrap();
    assert!(store.try_claim(0, "w", None).unwrap());
    let range = store.find_owned("w").unwrap().unwrap();

    store.reset_range(range.id).unwrap();
    let once = store.get(range.id).unwrap();
    store.reset_range(range.id).unwrap();
    let twice = store.get(range.id).unwrap();

    assert_eq!(once, twice);
    assert_eq!(once.status, RangeStatus::Unclaimed);
    assert_eq!(once.owner, None);
}

#[test]
fn test_adjacent_ranges_share_no_key() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("ranges.db");
    let recorder = SharedRecorder::default();

    // Keys sit exactly on range boundaries
    let ks = MemoryKeyspace::new();
    for t in [-50, -25, 0, 25, 50, 75, 100] {
        ks.insert(format!("b{}", t), BigInt::from(t), Columns::new());
    }

    let mut manager = worker_manager(&db, "w", ks, recorder.clone());
    manager.build_ranges(2).unwrap();
    let totals = manager.process_all().unwrap();

    assert_eq!(totals.ranges_completed, 2);
    assert_eq!(totals.processed_items, 7);
    let mut keys = recorder.keys.lock().clone();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 7);
}

#[test]
fn test_partition_completeness_both_schemes() {
    for partitioner in [Partitioner::Murmur3, Partitioner::Random] {
        let bounds = partitioner.bounds();
        for count in [1, 3, 7, 64] {
            let spans = bounds.split(count).unwrap();
            assert_eq!(spans.len(), count);
            assert_eq!(spans[0].start, bounds.min);
            assert_eq!(spans[count - 1].end, bounds.max);
            for pair in spans.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
                assert!(pair[0].start < pair[0].end);
            }
        }
    }
}

#[test]
fn test_hashed_keyspace_processed_once() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("ranges.db");
    let ks = MemoryKeyspace::with_partitioner(Partitioner::Murmur3);
    for i in 0..500 {
        ks.put(format!("user:{}", i), Columns::new()).unwrap();
    }

    let recorder = SharedRecorder::default();
    let mut config = ManagerConfig::for_partitioner("w", Partitioner::Murmur3);
    config.retry = RetryPolicy::immediate(5);
    let mut manager = RangeManager::new(config, open_store(&db), ks, Box::new(recorder.clone())).unwrap();
    manager.build_ranges(16).unwrap();
    let totals = manager.process_all().unwrap();

    assert_eq!(totals.ranges_completed, 16);
    let mut keys = recorder.keys.lock().clone();
    assert_eq!(keys.len(), 500);
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 500);
}
