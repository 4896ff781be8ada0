//! End-to-end behaviour of the batchers on a real tokio runtime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coalesce_core::FlusherConfig;
use coalesce_flusher::{
    EngineRuntime, MilliTimer, PendingRequests, RequestQueueBatcher, Requests, TaskExecutor,
    TokioRuntime,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

/// Executor that counts the drains it is asked to run.
struct CountingExecutor {
    inner: TokioRuntime,
    executed: AtomicUsize,
}

impl TaskExecutor for CountingExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(task);
    }
}

#[tokio::test]
async fn add_never_runs_the_handler_inline() {
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let batcher = RequestQueueBatcher::with_tokio(
        "inline-check",
        &FlusherConfig::new(1, 1_000),
        move |_requests: Requests<u8>, _pending: PendingRequests<u8, ()>| {
            flag.store(true, Ordering::SeqCst);
            futures::future::ready(Ok(())).boxed()
        },
    )
    .unwrap();

    // Quota of one: this add trips the flush, which must only be submitted.
    let response = batcher.add(1);
    assert!(!called.load(Ordering::SeqCst));
    response.await.unwrap();
    assert!(called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn drains_go_through_the_injected_executor() {
    let tokio_runtime = Arc::new(TokioRuntime::current().unwrap());
    let executor = Arc::new(CountingExecutor {
        inner: TokioRuntime::current().unwrap(),
        executed: AtomicUsize::new(0),
    });
    let timer: Arc<dyn MilliTimer> = tokio_runtime;
    let batcher = RequestQueueBatcher::new(
        "injected",
        &FlusherConfig::new(2, 1_000),
        |_requests: Requests<u8>, _pending: PendingRequests<u8, ()>| {
            futures::future::ready(Ok(())).boxed()
        },
        EngineRuntime::new(executor.clone(), timer),
    )
    .unwrap();

    batcher.add_all([1, 2]).await.unwrap();
    assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_request_is_resolved_once_under_flush_races() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let batcher = RequestQueueBatcher::with_tokio(
        "stress",
        &FlusherConfig::new(32, 2),
        move |_requests: Requests<u32>, pending: PendingRequests<u32, u32>| {
            let mut sink = sink.lock();
            for (req, promise) in pending.iter() {
                sink.push(*req);
                assert!(promise.complete(req + 1), "promise resolved twice");
            }
            futures::future::ready(Ok(())).boxed()
        },
    )
    .unwrap();

    // A side task keeps forcing manual flushes against the quota and the timer.
    let stop = Arc::new(AtomicBool::new(false));
    let flusher = {
        let batcher = batcher.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                batcher.flush(false);
                tokio::time::sleep(Duration::from_micros(300)).await;
            }
        })
    };

    let mut producers = Vec::new();
    for p in 0..8u32 {
        let batcher = batcher.clone();
        producers.push(tokio::spawn(async move {
            let responses: Vec<_> = (0..1000u32)
                .map(|i| (p * 10_000 + i, batcher.add(p * 10_000 + i)))
                .collect();
            for (req, response) in responses {
                assert_eq!(response.await.unwrap(), req + 1);
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    flusher.await.unwrap();

    let mut seen = seen.lock().clone();
    assert_eq!(seen.len(), 8000);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 8000);
}

#[tokio::test]
async fn single_producer_order_is_preserved_within_a_cycle() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let batcher = RequestQueueBatcher::with_tokio(
        "ordered",
        &FlusherConfig::new(3, 1_000),
        move |requests: Requests<&'static str>, _pending: PendingRequests<&'static str, ()>| {
            sink.lock().push(requests.to_vec());
            futures::future::ready(Ok(())).boxed()
        },
    )
    .unwrap();
    batcher.add_all(["A", "B", "C"]).await.unwrap();
    assert_eq!(*seen.lock(), vec![vec!["A", "B", "C"]]);
}
