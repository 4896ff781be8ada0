//! Coalescers composed with the batchers they sit on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coalesce_combiner::{GroupCoalescer, KeyCoalescer};
use coalesce_core::{FlusherConfig, GroupConfig};
use coalesce_flusher::{EngineRuntime, PendingRequests, RequestQueueBatcher, Requests};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Serialize)]
struct Price {
    sku: String,
    cents: u64,
}

#[tokio::test]
async fn dedup_in_front_of_a_batcher_queues_each_key_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let batcher = RequestQueueBatcher::with_tokio(
        "prices",
        &FlusherConfig::new(100, 20),
        move |requests: Requests<String>, pending: PendingRequests<String, usize>| {
            sink.lock().extend(requests.iter().cloned());
            for (sku, promise) in pending.iter() {
                promise.complete(sku.len());
            }
            futures::future::ready(Ok(())).boxed()
        },
    )
    .unwrap();
    let dedup = KeyCoalescer::over_batcher(batcher, EngineRuntime::tokio().unwrap().executor);

    let responses: Vec<_> = (0..30)
        .map(|i| dedup.add(format!("sku-{}", i % 3)))
        .collect();
    for response in futures::future::join_all(responses).await {
        assert_eq!(response.unwrap(), 5);
    }

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec!["sku-0", "sku-1", "sku-2"]);
    assert!(dedup.name().ends_with(".dedup"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stampede_from_many_tasks_hits_supplier_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let coalescer = Arc::new(
        KeyCoalescer::with_tokio("hot-key", move |key: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(key * 2)
            }
            .boxed()
        })
        .unwrap(),
    );

    let barrier = Arc::new(tokio::sync::Barrier::new(16));
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let coalescer = coalescer.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            coalescer.add(21).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_lookups_from_concurrent_callers_are_correlated() {
    let batches = Arc::new(AtomicUsize::new(0));
    let counter = batches.clone();
    let config = GroupConfig::new("sku")
        .with_response_field("cents")
        .with_flusher(FlusherConfig::new(16, 5));
    let prices: GroupCoalescer<String, Option<u64>> =
        GroupCoalescer::with_tokio("price-lookup", &config, move |skus: &[String]| {
            counter.fetch_add(1, Ordering::SeqCst);
            let rows: Vec<Price> = skus
                .iter()
                .filter(|sku| !sku.ends_with('7'))
                .map(|sku| Price {
                    sku: sku.clone(),
                    cents: sku.len() as u64 * 100,
                })
                .collect();
            async move { Ok(rows) }.boxed()
        })
        .unwrap();

    let mut tasks = Vec::new();
    for p in 0..4 {
        let prices = prices.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                let sku = format!("p{p}-{i}");
                let expected = (!sku.ends_with('7')).then(|| sku.len() as u64 * 100);
                assert_eq!(prices.add(sku).await.unwrap(), expected);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(batches.load(Ordering::SeqCst) >= 1);
    assert_eq!(prices.pending(), 0);
}
