//! The generic fork-join engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use reef_types::Key;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A divide-and-conquer computation over an ordered key list.
///
/// More than one key splits at the midpoint into two sub-jobs spawned as
/// independent tasks; a single key invokes the per-key function; the two
/// partial results are combined with `reduce` and the children are
/// dropped immediately after merging, so large partials do not outlive
/// their usefulness.
///
/// `reduce` must be associative. The engine always combines a left
/// subtree with the right subtree that follows it, so a non-commutative
/// (but associative) reduce still sees partials in key order.
pub struct MapReduce<R> {
    map: Arc<dyn Fn(Key) -> BoxFuture<R> + Send + Sync>,
    reduce: Arc<dyn Fn(R, R) -> R + Send + Sync>,
    identity: Arc<dyn Fn() -> R + Send + Sync>,
}

impl<R> Clone for MapReduce<R> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            reduce: self.reduce.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl<R: Send + 'static> MapReduce<R> {
    /// Build an engine from a per-key function, an associative reduce,
    /// and the reduce identity (the result of an empty key list).
    pub fn new<M, MF, F, I>(map: M, reduce: F, identity: I) -> Self
    where
        M: Fn(Key) -> MF + Send + Sync + 'static,
        MF: Future<Output = R> + Send + 'static,
        F: Fn(R, R) -> R + Send + Sync + 'static,
        I: Fn() -> R + Send + Sync + 'static,
    {
        Self {
            map: Arc::new(move |key| Box::pin(map(key)) as BoxFuture<R>),
            reduce: Arc::new(reduce),
            identity: Arc::new(identity),
        }
    }

    /// Run the computation over `keys`.
    pub async fn run(&self, keys: Vec<Key>) -> R {
        if keys.is_empty() {
            return (self.identity)();
        }
        let hi = keys.len();
        self.clone().span(Arc::from(keys.into_boxed_slice()), 0, hi).await
    }

    /// Recursive bisection over `keys[lo..hi]` (non-empty).
    fn span(self, keys: Arc<[Key]>, lo: usize, hi: usize) -> BoxFuture<R> {
        Box::pin(async move {
            if hi - lo >= 2 {
                let mid = lo + (hi - lo) / 2;
                let left = tokio::spawn(self.clone().span(keys.clone(), lo, mid));
                let right = tokio::spawn(self.clone().span(keys, mid, hi));
                let l = left.await.expect("map subtask panicked");
                let r = right.await.expect("map subtask panicked");
                (self.reduce)(l, r)
            } else {
                (self.map)(keys[lo].clone()).await
            }
        })
    }
}
