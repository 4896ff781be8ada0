//! Group coalescing: many single-argument calls become one batch call, and
//! the batch result list is joined back to the individual callers.

use std::collections::HashMap;
use std::sync::Arc;

use coalesce_core::{CoalesceResult, FlusherConfig, GroupConfig, Promise, ResponseFuture};
use coalesce_flusher::{EngineRuntime, PendingRequests, RequestQueueBatcher, Requests};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::accessor::{Accessor, JoinKey};

/// Join settings resolved once at construction and shared by every drain.
struct Correlator {
    name: String,
    join_field: String,
    response_field: Option<String>,
    one_to_one: bool,
}

enum JoinMap {
    One(HashMap<JoinKey, Value>),
    Many(HashMap<JoinKey, Vec<Value>>),
}

impl JoinMap {
    /// The response for `key`: `null` (one-to-one) or `[]` (one-to-many)
    /// when nothing in the batch matched.
    fn lookup(&self, key: &JoinKey) -> Option<Value> {
        match self {
            Self::One(map) => map.get(key).cloned(),
            Self::Many(map) => map.get(key).map(|values| Value::Array(values.clone())),
        }
    }

    fn unmatched(&self) -> Value {
        match self {
            Self::One(_) => Value::Null,
            Self::Many(_) => Value::Array(Vec::new()),
        }
    }
}

impl Correlator {
    fn from_config(name: &str, config: &GroupConfig) -> Self {
        Self {
            name: name.to_string(),
            join_field: config.join_field.clone(),
            response_field: config.response_field.clone(),
            one_to_one: config.one_to_one,
        }
    }

    fn build<I: Serialize>(&self, items: &[I]) -> CoalesceResult<JoinMap> {
        let mut map = if self.one_to_one {
            JoinMap::One(HashMap::with_capacity(items.len()))
        } else {
            JoinMap::Many(HashMap::with_capacity(items.len()))
        };
        let values = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        let Some(first) = values.first() else {
            return Ok(map);
        };
        let accessor = Accessor::detect(first)?;

        for item in &values {
            let Some(join) = accessor.get(item, &self.join_field) else {
                trace!(engine = %self.name, join_field = %self.join_field, "Item without join field skipped");
                continue;
            };
            let key = JoinKey::of(join);
            let response = match &self.response_field {
                Some(field) => accessor.get(item, field).cloned().unwrap_or(Value::Null),
                None => item.clone(),
            };
            match &mut map {
                JoinMap::One(one) => {
                    one.insert(key, response);
                }
                JoinMap::Many(many) => many.entry(key).or_default().push(response),
            }
        }
        Ok(map)
    }

    /// Resolves every pending promise from the batch result.
    fn resolve<A, R, I>(&self, items: &[I], pending: &[(A, Promise<R>)]) -> CoalesceResult<()>
    where
        A: Serialize,
        R: DeserializeOwned,
        I: Serialize,
    {
        let map = self.build(items)?;
        let mut unmatched = 0u64;
        for (arg, promise) in pending {
            let value = JoinKey::from_arg(arg).map(|key| {
                map.lookup(&key).unwrap_or_else(|| {
                    unmatched += 1;
                    map.unmatched()
                })
            });
            promise.resolve(value.and_then(|value| Ok(serde_json::from_value(value)?)));
        }
        if unmatched > 0 {
            metrics::counter!("combiner.group.unmatched", "engine" => self.name.clone())
                .increment(unmatched);
        }
        debug!(
            engine = %self.name,
            requests = pending.len(),
            items = items.len(),
            unmatched,
            "Batch result correlated"
        );
        Ok(())
    }
}

/// Coalesces single-argument lookups into one batch supplier call and
/// correlates the returned items back by `join_field`.
///
/// Each caller receives the item (or its `response_field`) deserialized into
/// `R`. Use `Option<_>` for one-to-one mode, where an unmatched argument
/// resolves to `null`, and `Vec<_>` for one-to-many mode.
pub struct GroupCoalescer<A, R>
where
    A: Clone + Send + 'static,
    R: Send + 'static,
{
    batcher: RequestQueueBatcher<A, R>,
}

impl<A, R> Clone for GroupCoalescer<A, R>
where
    A: Clone + Send + 'static,
    R: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            batcher: self.batcher.clone(),
        }
    }
}

impl<A, R> GroupCoalescer<A, R>
where
    A: Serialize + Clone + Send + Sync + 'static,
    R: DeserializeOwned + Send + 'static,
{
    pub fn new<I, F>(
        name: impl Into<String>,
        config: &GroupConfig,
        supplier: F,
        runtime: EngineRuntime,
    ) -> CoalesceResult<Self>
    where
        I: Serialize + Send + 'static,
        F: Fn(&[A]) -> BoxFuture<'static, CoalesceResult<Vec<I>>> + Send + Sync + 'static,
    {
        config.validate()?;
        let name = name.into();
        let correlator = Arc::new(Correlator::from_config(&name, config));
        let handler = move |requests: Requests<A>, pending: PendingRequests<A, R>| {
            let batch = supplier(requests.as_slice());
            drop(requests);
            let correlator = Arc::clone(&correlator);
            async move {
                let items = batch.await?;
                correlator.resolve(items.as_slice(), pending.as_slice())
            }
            .boxed()
        };
        let batcher = RequestQueueBatcher::new(name.clone(), &config.flusher, handler, runtime)?;
        info!(
            engine = %name,
            join_field = %config.join_field,
            response_field = ?config.response_field,
            one_to_one = config.one_to_one,
            "Group coalescer initialized"
        );
        Ok(Self { batcher })
    }

    pub fn with_tokio<I, F>(
        name: impl Into<String>,
        config: &GroupConfig,
        supplier: F,
    ) -> CoalesceResult<Self>
    where
        I: Serialize + Send + 'static,
        F: Fn(&[A]) -> BoxFuture<'static, CoalesceResult<Vec<I>>> + Send + Sync + 'static,
    {
        Self::new(name, config, supplier, EngineRuntime::tokio()?)
    }

    /// Adapter for a supplier that answers synchronously.
    pub fn from_sync<I, F>(
        name: impl Into<String>,
        config: &GroupConfig,
        supplier: F,
        runtime: EngineRuntime,
    ) -> CoalesceResult<Self>
    where
        I: Serialize + Send + 'static,
        F: Fn(&[A]) -> CoalesceResult<Vec<I>> + Send + Sync + 'static,
    {
        Self::new(
            name,
            config,
            move |args: &[A]| future::ready(supplier(args)).boxed(),
            runtime,
        )
    }

    pub fn add(&self, arg: A) -> ResponseFuture<R> {
        self.batcher.add(arg)
    }

    pub fn flush(&self) -> bool {
        self.batcher.flush(false)
    }

    pub fn pending(&self) -> usize {
        self.batcher.pending()
    }

    pub fn name(&self) -> &str {
        self.batcher.name()
    }
}

/// Group batching for operations without a per-caller result, e.g. a bulk
/// write. Every caller completes once the batch call it joined finishes.
#[derive(Clone)]
pub struct GroupRunCombiner<A>
where
    A: Clone + Send + 'static,
{
    batcher: RequestQueueBatcher<A, ()>,
}

impl<A> GroupRunCombiner<A>
where
    A: Clone + Send + Sync + 'static,
{
    pub fn new<F>(
        name: impl Into<String>,
        config: &FlusherConfig,
        run: F,
        runtime: EngineRuntime,
    ) -> CoalesceResult<Self>
    where
        F: Fn(&[A]) -> BoxFuture<'static, CoalesceResult<()>> + Send + Sync + 'static,
    {
        let handler = move |requests: Requests<A>, _pending: PendingRequests<A, ()>| run(requests.as_slice());
        Ok(Self {
            batcher: RequestQueueBatcher::new(name, config, handler, runtime)?,
        })
    }

    pub fn with_tokio<F>(
        name: impl Into<String>,
        config: &FlusherConfig,
        run: F,
    ) -> CoalesceResult<Self>
    where
        F: Fn(&[A]) -> BoxFuture<'static, CoalesceResult<()>> + Send + Sync + 'static,
    {
        Self::new(name, config, run, EngineRuntime::tokio()?)
    }

    /// Adapter for a batch operation that runs synchronously. It runs on the
    /// drain task, so it should be short.
    pub fn from_sync<F>(
        name: impl Into<String>,
        config: &FlusherConfig,
        run: F,
        runtime: EngineRuntime,
    ) -> CoalesceResult<Self>
    where
        F: Fn(&[A]) -> CoalesceResult<()> + Send + Sync + 'static,
    {
        Self::new(
            name,
            config,
            move |args: &[A]| future::ready(run(args)).boxed(),
            runtime,
        )
    }

    pub fn add(&self, arg: A) -> ResponseFuture<()> {
        self.batcher.add(arg)
    }

    pub fn add_all(
        &self,
        args: impl IntoIterator<Item = A>,
    ) -> impl std::future::Future<Output = CoalesceResult<()>> + Send + 'static {
        self.batcher.add_all(args)
    }

    pub fn flush(&self) -> bool {
        self.batcher.flush(false)
    }

    pub fn pending(&self) -> usize {
        self.batcher.pending()
    }

    pub fn name(&self) -> &str {
        self.batcher.name()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use coalesce_core::CoalesceError;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Row {
        id: u32,
        v: String,
    }

    fn row(id: u32, v: &str) -> Row {
        Row { id, v: v.into() }
    }

    fn quota(n: usize) -> FlusherConfig {
        FlusherConfig::new(n, 60_000)
    }

    #[tokio::test]
    async fn test_one_to_one_projection_with_missing_match() {
        let config = GroupConfig::new("id")
            .with_response_field("v")
            .with_flusher(quota(3));
        let coalescer: GroupCoalescer<u32, Option<String>> =
            GroupCoalescer::with_tokio("rows", &config, |_ids: &[u32]| {
                future::ready(Ok(vec![row(1, "a"), row(3, "c")])).boxed()
            })
            .unwrap();

        let (r1, r2, r3) = tokio::join!(coalescer.add(1), coalescer.add(2), coalescer.add(3));
        assert_eq!(r1.unwrap().as_deref(), Some("a"));
        assert_eq!(r2.unwrap(), None);
        assert_eq!(r3.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_one_to_many_collects_every_match() {
        let config = GroupConfig::new("id")
            .with_response_field("v")
            .one_to_many()
            .with_flusher(quota(2));
        let coalescer: GroupCoalescer<u32, Vec<String>> =
            GroupCoalescer::with_tokio("rows", &config, |_ids: &[u32]| {
                future::ready(Ok(vec![row(1, "a"), row(1, "b")])).boxed()
            })
            .unwrap();

        let (r1, r9) = tokio::join!(coalescer.add(1), coalescer.add(9));
        assert_eq!(r1.unwrap(), vec!["a", "b"]);
        assert!(r9.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_whole_item_and_last_write_wins() {
        let config = GroupConfig::new("id").with_flusher(quota(1));
        let coalescer: GroupCoalescer<u32, Option<Row>> =
            GroupCoalescer::with_tokio("rows", &config, |_ids: &[u32]| {
                future::ready(Ok(vec![row(4, "old"), row(4, "new")])).boxed()
            })
            .unwrap();
        assert_eq!(coalescer.add(4).await.unwrap(), Some(row(4, "new")));
    }

    #[tokio::test]
    async fn test_supplier_sees_batched_arguments_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = GroupConfig::new("id").with_flusher(quota(3));
        let coalescer: GroupCoalescer<u32, Option<Row>> =
            GroupCoalescer::from_sync("rows", &config, move |ids: &[u32]| {
                sink.lock().push(ids.to_vec());
                Ok(ids.iter().map(|id| row(*id, "x")).collect::<Vec<_>>())
            }, EngineRuntime::tokio().unwrap())
            .unwrap();

        let (a, b, c) = tokio::join!(coalescer.add(5), coalescer.add(6), coalescer.add(7));
        assert_eq!(a.unwrap().unwrap().id, 5);
        assert_eq!(b.unwrap().unwrap().id, 6);
        assert_eq!(c.unwrap().unwrap().id, 7);
        assert_eq!(*seen.lock(), vec![vec![5, 6, 7]]);
    }

    #[tokio::test]
    async fn test_map_items_and_string_keys() {
        let config = GroupConfig::new("user")
            .with_response_field("score")
            .with_flusher(quota(2));
        let coalescer: GroupCoalescer<String, Option<f64>> =
            GroupCoalescer::with_tokio("scores", &config, |_users: &[String]| {
                future::ready(Ok(vec![
                    json!({"user": "u1", "score": 0.5}),
                    json!({"user": "u2"}),
                ]))
                .boxed()
            })
            .unwrap();

        let (u1, u2) = tokio::join!(coalescer.add("u1".into()), coalescer.add("u2".into()));
        assert_eq!(u1.unwrap(), Some(0.5));
        // Matched, but the response field is absent.
        assert_eq!(u2.unwrap(), None);
    }

    #[tokio::test]
    async fn test_supplier_failure_reaches_every_caller() {
        let config = GroupConfig::new("id").with_flusher(quota(2));
        let coalescer: GroupCoalescer<u32, Option<Row>> =
            GroupCoalescer::with_tokio("rows", &config, |_ids: &[u32]| {
                future::ready(Err::<Vec<Row>, _>(CoalesceError::supplier("db timeout"))).boxed()
            })
            .unwrap();
        let (a, b) = tokio::join!(coalescer.add(1), coalescer.add(2));
        let expected = Err(CoalesceError::Supplier("db timeout".into()));
        assert_eq!(a, expected);
        assert_eq!(b, expected);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_a_decode_error() {
        let config = GroupConfig::new("id")
            .with_response_field("v")
            .with_flusher(quota(1));
        let coalescer: GroupCoalescer<u32, Option<u64>> =
            GroupCoalescer::with_tokio("rows", &config, |_ids: &[u32]| {
                future::ready(Ok(vec![row(1, "not a number")])).boxed()
            })
            .unwrap();
        assert!(matches!(
            coalescer.add(1).await,
            Err(CoalesceError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_blank_join_field_is_rejected() {
        let result: CoalesceResult<GroupCoalescer<u32, Option<Row>>> =
            GroupCoalescer::with_tokio("rows", &GroupConfig::new(" "), |_ids: &[u32]| {
                future::ready(Ok(Vec::<Row>::new())).boxed()
            });
        assert!(matches!(result, Err(CoalesceError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_combiner_completes_callers_after_batch() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        let combiner = GroupRunCombiner::with_tokio("bulk-write", &quota(4), move |rows: &[u32]| {
            sink.lock().extend_from_slice(rows);
            future::ready(Ok(())).boxed()
        })
        .unwrap();
        combiner.add_all([1, 2, 3, 4]).await.unwrap();
        assert_eq!(*written.lock(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_run_combiner_from_sync_and_manual_flush() {
        let combiner = GroupRunCombiner::from_sync(
            "sync-write",
            &quota(100),
            |_rows: &[&'static str]| Ok(()),
            EngineRuntime::tokio().unwrap(),
        )
        .unwrap();
        let response = combiner.add("a");
        assert_eq!(combiner.pending(), 1);
        assert!(combiner.flush());
        response.await.unwrap();
    }
}
