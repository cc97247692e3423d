//! ring-processor - Distributed Token-Range Processing
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use ring_processor::config::{identity, local_hostname, CliArgs, Command, GlobalArgs, WorkerConfig};
use ring_processor::manager::{count_range, get_keys, ManagerConfig, RangeAdmin, RangeManager, Worker};
use ring_processor::processor::KeyCountProcessor;
use ring_processor::progress::{print_ranges, print_status, print_summary, sum_totals, ProgressReporter};
use ring_processor::retry::RetryPolicy;
use ring_processor::source::{Item, RedisKeyspace};
use ring_processor::store::RangeStore;
use ring_processor::token::parse_token;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.global.verbose)?;

    let global = &args.global;
    match &args.command {
        Command::Init { shards } => {
            let store = RangeStore::init(global.store_config()?, *shards).context("Failed to create range tables")?;
            println!("Created {} range table(s)", store.shards().len());
        }
        Command::BuildRanges { count, min, max } => {
            let bounds = global.bounds(min.as_deref(), max.as_deref())?;
            let spans = bounds.split(*count)?;
            let mut store = open_store(global)?;
            let built = store.build_ranges(&spans).context("Failed to build ranges")?;
            println!("Built {} ranges over [{}, {}]", built, bounds.min, bounds.max);
        }
        Command::ResetRanges => {
            let reset = open_admin(global)?.reset_ranges()?;
            println!("Reset {} ranges", reset);
        }
        Command::ResetRange { id } => {
            open_admin(global)?.reset_range(*id)?;
            println!("Reset range {}", id);
        }
        Command::RefreshKeys => refresh_keys(global)?,
        Command::ListFailed { limit } => {
            let (total, ranges) = open_admin(global)?.list_failed(*limit)?;
            print_ranges(&format!("{} failed ranges (showing {})", total, ranges.len()), &ranges);
        }
        Command::ListRequeued { mins } => {
            let ranges = open_admin(global)?.list_requeued(*mins)?;
            print_ranges(&format!("{} ranges requeued in the last {} minutes", ranges.len(), mins), &ranges);
        }
        Command::ResetFailed => {
            let reset = open_admin(global)?.reset_failed()?;
            println!("Reset {} failed ranges", reset);
        }
        Command::ResetProcessing { stale_mins } => {
            let reset = open_admin(global)?.reset_processing(*stale_mins)?;
            println!("Reset {} processing ranges", reset);
        }
        Command::Status { json } => {
            let summary = open_admin(global)?.status()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_status(&summary);
            }
        }
        Command::ShowRangeData { id } => match open_admin(global)?.show_range_data(*id)? {
            Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
            None => println!("Range {} has no range data", id),
        },
        Command::CountRange { start_key, end_key } => {
            let mut keyspace = connect(global)?;
            let count = count_range(&mut keyspace, RetryPolicy::default(), start_key, end_key)?;
            println!("{}", count);
        }
        Command::GetKeys {
            start_token,
            end_token,
            count,
        } => {
            let mut keyspace = connect(global)?;
            let keys = get_keys(
                &mut keyspace,
                RetryPolicy::default(),
                &parse_token(start_token)?,
                &parse_token(end_token)?,
                *count,
            )?;
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
        Command::Load { file } => {
            let reader: Box<dyn BufRead> = match file {
                Some(path) => Box::new(BufReader::new(
                    File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
                )),
                None => Box::new(BufReader::new(io::stdin())),
            };
            load(global, reader)?;
        }
        Command::Work(work) => {
            let host = local_hostname()?;
            let config = WorkerConfig::from_work_args(global, work, &host).context("Invalid configuration")?;
            run_workers(config)?;
        }
    }

    Ok(())
}

fn open_store(global: &GlobalArgs) -> Result<RangeStore> {
    let config = global.store_config()?;
    let path = config.path.clone();
    RangeStore::open(config).with_context(|| format!("Failed to open range store {}", path.display()))
}

fn open_admin(global: &GlobalArgs) -> Result<RangeAdmin> {
    Ok(RangeAdmin::new(open_store(global)?))
}

fn connect(global: &GlobalArgs) -> Result<RedisKeyspace> {
    let config = global.keyspace_config()?;
    let url = config.url.clone();
    RedisKeyspace::connect(config).with_context(|| format!("Failed to connect to {}", url))
}

fn refresh_keys(global: &GlobalArgs) -> Result<()> {
    let host = local_hostname()?;
    let keyspace = connect(global)?;
    let config = ManagerConfig::new(identity(&host, "refresh"), global.bounds(None, None)?);
    let mut manager = RangeManager::new(config, open_store(global)?, keyspace, Box::new(KeyCountProcessor::new()))?;
    let resolved = manager.refresh_keys_for_all_ranges()?;
    println!("Resolved boundary keys for {} ranges", resolved);
    Ok(())
}

fn load(global: &GlobalArgs, reader: Box<dyn BufRead>) -> Result<()> {
    let mut keyspace = connect(global)?;
    let mut loaded = 0u64;
    for line in reader.lines() {
        let line = line.context("Failed to read input")?;
        let Some(item) = Item::from_line(&line) else {
            continue;
        };
        keyspace.put(&item.key, &item.columns)?;
        loaded += 1;
        if loaded % 10_000 == 0 {
            info!(loaded, "Loading keys");
        }
    }
    println!("Loaded {} keys ({} on the ring)", loaded, keyspace.len()?);
    Ok(())
}

/// Spawn one worker thread per instance and wait for all of them
fn run_workers(config: WorkerConfig) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, finishing current ranges...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let progress = config.show_progress.then(ProgressReporter::new);
    if let Some(p) = &progress {
        p.set_status(&format!("Connecting {} worker(s)...", config.instances.len()));
    }

    let mut workers = Vec::with_capacity(config.instances.len());
    let mut handles = Vec::with_capacity(config.instances.len());
    for manager_config in &config.instances {
        let store = RangeStore::open(config.store.clone()).context("Failed to open range store")?;
        let keyspace = RedisKeyspace::connect(config.keyspace.clone())
            .with_context(|| format!("Failed to connect to {}", config.keyspace.url))?;
        let processor = match config.batch_size {
            Some(size) => KeyCountProcessor::new().with_fixed_batch_size(size),
            None => KeyCountProcessor::new(),
        };

        let stats = manager_config.stats_reporter().context("Failed to create stats directory")?;
        handles.push(stats.handle());
        let manager = RangeManager::new(manager_config.clone(), store, keyspace, Box::new(processor))?
            .with_stats(stats)
            .with_shutdown(Arc::clone(&shutdown));
        let name = manager_config
            .identity
            .rsplit('|')
            .next()
            .unwrap_or(&manager_config.identity)
            .to_string();
        workers.push(Worker::spawn(name, manager)?);
    }
    info!(workers = workers.len(), "Workers started");

    let start = Instant::now();
    while !workers.iter().all(Worker::is_finished) {
        if let Some(p) = &progress {
            p.update(&handles, start.elapsed());
        }
        thread::sleep(Duration::from_millis(200));
    }
    if let Some(p) = &progress {
        p.finish_and_clear();
    }

    let worker_count = workers.len();
    let mut totals = Vec::with_capacity(worker_count);
    let mut failures = Vec::new();
    for worker in workers {
        let name = worker.name().to_string();
        let stats = worker.stats().clone();
        match worker.join() {
            Ok(t) => totals.push(t),
            Err(e) => {
                warn!(worker = %name, error = %e, "Worker failed");
                failures.push(format!("{}: {}", name, e));
                totals.push(stats.totals());
            }
        }
    }

    print_summary(&sum_totals(totals), start.elapsed(), worker_count);

    if shutdown.load(Ordering::SeqCst) {
        println!("{}", style("Stopped before all ranges were processed").yellow());
    }
    if !failures.is_empty() {
        anyhow::bail!("{} worker(s) failed: {}", failures.len(), failures.join("; "));
    }
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("ring_processor=debug,warn")
    } else {
        EnvFilter::new("ring_processor=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
