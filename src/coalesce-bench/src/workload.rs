//! Simulated traffic against each engine. Every scenario fans requests out
//! from `producers` concurrent tasks into one engine instance backed by a
//! fake downstream with fixed latency, and reports how many downstream calls
//! the requests collapsed into.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use coalesce_combiner::{GroupCoalescer, KeyCoalescer};
use coalesce_core::{BenchConfig, CoalesceError, CoalesceResult};
use coalesce_flusher::{CounterBatcher, PendingRequests, RequestQueueBatcher, Requests};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;

#[derive(Debug)]
pub struct Report {
    pub scenario: &'static str,
    pub requests: u64,
    pub downstream_calls: u64,
    pub elapsed: Duration,
}

impl Report {
    pub fn throughput(&self) -> f64 {
        self.requests as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    pub fn collapse_ratio(&self) -> f64 {
        self.requests as f64 / self.downstream_calls.max(1) as f64
    }
}

#[derive(Debug, Clone, Serialize)]
struct Record {
    id: u64,
    score: f64,
}

/// Counts calls and sleeps for the configured latency, like a remote store.
#[derive(Clone)]
struct Downstream {
    calls: Arc<AtomicU64>,
    latency: Duration,
}

impl Downstream {
    fn new(latency_ms: u64) -> Self {
        Self {
            calls: Arc::new(AtomicU64::new(0)),
            latency: Duration::from_millis(latency_ms),
        }
    }

    fn call(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency)
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

/// Spawns `producers` tasks running `body(producer_index)` and waits for all.
async fn fan_out<F, Fut>(producers: usize, body: F) -> anyhow::Result<()>
where
    F: Fn(usize) -> Fut,
    Fut: std::future::Future<Output = CoalesceResult<()>> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for producer in 0..producers {
        tasks.spawn(body(producer));
    }
    while let Some(joined) = tasks.join_next().await {
        joined.context("producer task panicked")??;
    }
    Ok(())
}

fn total_requests(config: &BenchConfig) -> u64 {
    (config.workload.producers * config.workload.requests_per_producer) as u64
}

pub async fn writes(config: &BenchConfig) -> anyhow::Result<Report> {
    let downstream = Downstream::new(config.workload.downstream_latency_ms);
    let store = downstream.clone();
    let batcher = RequestQueueBatcher::with_tokio(
        "bench.writes",
        &config.writes,
        move |_rows: Requests<u64>, _pending: PendingRequests<u64, ()>| {
            store.call().map(Ok).boxed()
        },
    )?;

    let per_producer = config.workload.requests_per_producer as u64;
    let started = Instant::now();
    fan_out(config.workload.producers, |producer| {
        let base = producer as u64 * per_producer;
        batcher.add_all(base..base + per_producer)
    })
    .await?;

    Ok(Report {
        scenario: "writes",
        requests: total_requests(config),
        downstream_calls: downstream.calls(),
        elapsed: started.elapsed(),
    })
}

pub async fn counters(config: &BenchConfig) -> anyhow::Result<Report> {
    let downstream = Downstream::new(config.workload.downstream_latency_ms);
    let store = downstream.clone();
    let counted = Arc::new(AtomicU64::new(0));
    let total = counted.clone();
    let batcher = CounterBatcher::with_tokio("bench.counters", &config.counters, move |n: u64| {
        total.fetch_add(n, Ordering::Relaxed);
        store.call().map(Ok).boxed()
    })?;

    let per_producer = config.workload.requests_per_producer;
    let started = Instant::now();
    fan_out(config.workload.producers, |_| {
        let responses: Vec<_> = (0..per_producer).map(|_| batcher.add(1)).collect();
        futures::future::try_join_all(responses).map(|done| done.map(|_| ()))
    })
    .await?;

    let requests = total_requests(config);
    anyhow::ensure!(
        counted.load(Ordering::Relaxed) == requests,
        "counter batcher lost increments"
    );
    Ok(Report {
        scenario: "counters",
        requests,
        downstream_calls: downstream.calls(),
        elapsed: started.elapsed(),
    })
}

pub async fn lookups(config: &BenchConfig) -> anyhow::Result<Report> {
    let downstream = Downstream::new(config.workload.downstream_latency_ms);
    let store = downstream.clone();
    let lookups: GroupCoalescer<u64, Option<Value>> = GroupCoalescer::with_tokio(
        "bench.lookups",
        &config.lookups,
        move |ids: &[u64]| -> BoxFuture<'static, CoalesceResult<Vec<Record>>> {
            // Every tenth id has no record.
            let rows: Vec<Record> = ids
                .iter()
                .filter(|id| *id % 10 != 0)
                .map(|id| Record {
                    id: *id,
                    score: *id as f64 / 2.0,
                })
                .collect();
            store.call().map(move |()| Ok(rows)).boxed()
        },
    )?;

    let cardinality = config.workload.key_cardinality.max(1);
    let per_producer = config.workload.requests_per_producer;
    let started = Instant::now();
    fan_out(config.workload.producers, |_| {
        let ids: Vec<u64> = {
            let mut rng = rand::thread_rng();
            (0..per_producer)
                .map(|_| rng.gen_range(0..cardinality))
                .collect()
        };
        let responses: Vec<_> = ids.iter().map(|id| lookups.add(*id)).collect();
        async move {
            for (id, response) in ids.into_iter().zip(responses) {
                let found = response.await?.is_some();
                if found != (id % 10 != 0) {
                    return Err(CoalesceError::Decode(format!(
                        "id {id} correlated to the wrong record"
                    )));
                }
            }
            Ok(())
        }
    })
    .await?;

    Ok(Report {
        scenario: "lookups",
        requests: total_requests(config),
        downstream_calls: downstream.calls(),
        elapsed: started.elapsed(),
    })
}

pub async fn dedup(config: &BenchConfig) -> anyhow::Result<Report> {
    let downstream = Downstream::new(config.workload.downstream_latency_ms);
    let store = downstream.clone();
    let profiles = Arc::new(KeyCoalescer::with_tokio("bench.dedup", move |key: u64| {
        store.call().map(move |()| Ok(key.wrapping_mul(31))).boxed()
    })?);

    let cardinality = config.workload.key_cardinality.max(1);
    let per_producer = config.workload.requests_per_producer;
    let started = Instant::now();
    fan_out(config.workload.producers, |_| {
        let profiles = profiles.clone();
        async move {
            for _ in 0..per_producer {
                let key = rand::thread_rng().gen_range(0..cardinality);
                profiles.add(key).await?;
            }
            Ok(())
        }
    })
    .await?;

    Ok(Report {
        scenario: "dedup",
        requests: total_requests(config),
        downstream_calls: downstream.calls(),
        elapsed: started.elapsed(),
    })
}
