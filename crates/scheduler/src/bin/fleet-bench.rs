//! fleet-bench: drive a tiered scheduler through a synthetic workload.
//!
//! # Usage
//!
//! ```bash
//! # 500,000 identical workers, then 500,000 matching jobs
//! fleet-bench --scenario density
//!
//! # Random fleet across regions and energy levels with parallel churn
//! fleet-bench --scenario mixed --workers 10000 --seed 7
//!
//! # Bounded rings instead of chunk chains
//! FLEET_QUEUE_KIND=bounded fleet-bench --scenario density --workers 5000
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use bitfleet_core::config::load_dotenv;
use bitfleet_core::{Config, QueueKind, Resource};
use bitfleet_scheduler::{
    BoundedScheduler, ClassQueue, ScheduleError, TieredScheduler, UnboundedScheduler,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Register N identical workers, then issue N matching acquires.
    Density,
    /// Seeded random fleet, a heavy job, a forced borrow, then acquire/re-register churn.
    Mixed,
}

/// Benchmarks the bitmask scheduler under synthetic fleets.
#[derive(Parser, Debug)]
#[command(name = "fleet-bench", version, about)]
struct Cli {
    /// TOML config file. Falls back to FLEET_* environment variables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Environment profile (looks up {PROFILE}_{KEY} before {KEY}).
    #[arg(long, env = "FLEET_PROFILE")]
    profile: Option<String>,

    #[arg(long, value_enum, default_value_t = Scenario::Density)]
    scenario: Scenario,

    /// Resources to register.
    #[arg(long, default_value_t = 500_000)]
    workers: usize,

    /// Worker threads for the parallel phases (0 = one per core).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Seed for the mixed scenario's fleet.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match (&cli.config, &cli.profile) {
        (Some(path), _) => Config::from_file(path)?,
        (None, Some(profile)) => Config::for_profile(profile),
        (None, None) => Config::from_env(),
    };
    config.validate()?;
    config.log_summary();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cli.threads)
        .build()?;

    pool.install(|| -> anyhow::Result<()> {
        match config.queue.kind {
            QueueKind::Bounded => run(&BoundedScheduler::new(&config)?, &cli, &config),
            QueueKind::Unbounded => run(&UnboundedScheduler::new(&config)?, &cli, &config),
        }
    })
}

fn run<Q: ClassQueue<Resource>>(
    scheduler: &TieredScheduler<Q>,
    cli: &Cli,
    config: &Config,
) -> anyhow::Result<()> {
    let scenario = match cli.scenario {
        Scenario::Density => density(scheduler, cli.workers)?,
        Scenario::Mixed => mixed(scheduler, cli.workers, cli.seed)?,
    };

    let report = serde_json::json!({
        "scenario": scenario,
        "config": config.summary(),
        "metrics": scheduler.metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Register or count the rejection; any other failure aborts the run.
fn register_counting<Q: ClassQueue<Resource>>(
    scheduler: &TieredScheduler<Q>,
    resource: Resource,
) -> Result<bool, ScheduleError> {
    match scheduler.register(resource) {
        Ok(_) => Ok(true),
        Err(ScheduleError::Overflow { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn density<Q: ClassQueue<Resource>>(
    scheduler: &TieredScheduler<Q>,
    count: usize,
) -> anyhow::Result<serde_json::Value> {
    tracing::info!("Registering {} identical workers", count);
    let start = Instant::now();
    let accepted = (0..count)
        .into_par_iter()
        .map(|i| register_counting(scheduler, Resource::new(format!("dense-{i}"), 4000, 1, 1)))
        .try_fold(|| 0usize, |n, ok| ok.map(|ok| n + usize::from(ok)))
        .try_reduce(|| 0, |a, b| Ok(a + b))?;
    let register_time = start.elapsed();
    tracing::info!("Registered {} of {} in {:?}", accepted, count, register_time);

    let start = Instant::now();
    let taken = (0..count)
        .into_par_iter()
        .map(|_| scheduler.acquire(3500, 1, 1))
        .collect::<Result<Vec<_>, _>>()?;
    let acquire_time = start.elapsed();

    let distinct: HashSet<String> = taken
        .into_iter()
        .flatten()
        .map(|r| r.id().to_string())
        .collect();
    let lost = accepted.saturating_sub(distinct.len());
    if lost == 0 {
        tracing::info!("All {} accepted workers dispensed exactly once", accepted);
    } else {
        tracing::warn!("{} accepted workers were never dispensed", lost);
    }

    Ok(serde_json::json!({
        "name": "density",
        "workers": count,
        "accepted": accepted,
        "rejected": count - accepted,
        "dispensed": distinct.len(),
        "lost": lost,
        "register_ms": register_time.as_millis(),
        "acquire_ms": acquire_time.as_millis(),
        "acquire_ns_per_op": acquire_time.as_nanos() / count.max(1) as u128,
    }))
}

fn mixed<Q: ClassQueue<Resource>>(
    scheduler: &TieredScheduler<Q>,
    count: usize,
    seed: u64,
) -> anyhow::Result<serde_json::Value> {
    let mut rng = StdRng::seed_from_u64(seed);
    let regions = scheduler.dimensions().regions;
    let levels = scheduler.dimensions().energy_levels;
    let top = levels - 1;
    let home = 1.min(regions - 1);

    // Alone in an empty scheduler, a low-energy worker can only be reached by borrowing.
    let borrow_region = 2.min(regions - 1);
    register_counting(scheduler, Resource::new("low-battery", 1000, borrow_region, 0))?;
    let borrowed = scheduler.acquire(500, borrow_region, top)?;
    let forced_borrow = top > 0 && borrowed.is_some() && scheduler.metrics().borrowed == 1;

    tracing::info!("Registering {} random workers (seed {})", count, seed);
    let mut rejected = 0usize;
    for i in 0..count {
        let region = if regions > 1 { rng.gen_range(1..regions) } else { 0 };
        let resource = Resource::new(
            format!("worker-{i}"),
            rng.gen_range(50..16_050),
            region,
            rng.gen_range(0..levels),
        );
        if !register_counting(scheduler, resource)? {
            rejected += 1;
        }
    }

    let heavy = scheduler.acquire(12_000, home, top)?;
    match &heavy {
        Some(r) => tracing::info!("Heavy job (12000MB) placed on {}", r),
        None => tracing::info!("Heavy job (12000MB) found no worker"),
    }

    tracing::info!("Churning {} acquire/return cycles", count);
    let start = Instant::now();
    let churned = (0..count)
        .into_par_iter()
        .map(|_| -> Result<usize, ScheduleError> {
            match scheduler.acquire(100, home, 0)? {
                Some(resource) => Ok(usize::from(register_counting(scheduler, resource)?)),
                None => Ok(0),
            }
        })
        .try_reduce(|| 0, |a, b| Ok(a + b))?;
    let churn_time = start.elapsed();

    Ok(serde_json::json!({
        "name": "mixed",
        "workers": count,
        "seed": seed,
        "rejected": rejected,
        "heavy_job": heavy.map(|r| r.id().to_string()),
        "forced_borrow": forced_borrow,
        "churned": churned,
        "churn_ms": churn_time.as_millis(),
    }))
}
