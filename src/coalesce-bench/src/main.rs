//! Coalesce Bench: drives every batching and coalescing engine with a
//! synthetic workload and reports how far requests collapse.

mod workload;

use clap::Parser;
use coalesce_core::BenchConfig;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "coalesce-bench")]
#[command(about = "Load simulation for the request coalescing engines")]
#[command(version)]
struct Cli {
    /// Optional TOML config file, layered under `COALESCE__*` variables
    #[arg(long, short)]
    config: Option<String>,

    /// Concurrent producer tasks (overrides config)
    #[arg(long, env = "COALESCE__WORKLOAD__PRODUCERS")]
    producers: Option<usize>,

    /// Requests issued by each producer (overrides config)
    #[arg(long, env = "COALESCE__WORKLOAD__REQUESTS_PER_PRODUCER")]
    requests: Option<usize>,

    /// Flush quota applied to every engine (overrides config)
    #[arg(long)]
    quota: Option<usize>,

    /// Run a single scenario: writes, counters, lookups or dedup
    #[arg(long)]
    only: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coalesce_bench=info,coalesce_flusher=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = BenchConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        BenchConfig::default()
    });

    if let Some(producers) = cli.producers {
        config.workload.producers = producers;
    }
    if let Some(requests) = cli.requests {
        config.workload.requests_per_producer = requests;
    }
    if let Some(quota) = cli.quota {
        config.writes.flush_quota = quota;
        config.counters.flush_quota = quota;
        config.lookups.flusher.flush_quota = quota;
    }
    config.validate()?;

    info!(
        producers = config.workload.producers,
        requests_per_producer = config.workload.requests_per_producer,
        key_cardinality = config.workload.key_cardinality,
        downstream_latency_ms = config.workload.downstream_latency_ms,
        "Configuration loaded"
    );

    let wanted = |scenario: &str| cli.only.as_deref().map_or(true, |only| only == scenario);
    let mut reports = Vec::new();
    if wanted("writes") {
        reports.push(workload::writes(&config).await?);
    }
    if wanted("counters") {
        reports.push(workload::counters(&config).await?);
    }
    if wanted("lookups") {
        reports.push(workload::lookups(&config).await?);
    }
    if wanted("dedup") {
        reports.push(workload::dedup(&config).await?);
    }
    anyhow::ensure!(!reports.is_empty(), "no scenario named {:?}", cli.only);

    for report in &reports {
        info!(
            scenario = report.scenario,
            requests = report.requests,
            downstream_calls = report.downstream_calls,
            elapsed_ms = report.elapsed.as_millis() as u64,
            throughput_rps = format!("{:.0}", report.throughput()),
            collapse_ratio = format!("{:.1}", report.collapse_ratio()),
            "Scenario finished"
        );
    }

    info!("Coalesce Bench finished");
    Ok(())
}
