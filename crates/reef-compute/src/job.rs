//! Named jobs, the wire-dispatchable form of a map/reduce.
//!
//! Closures cannot cross the wire, so cross-node work is expressed as a
//! [`Job`] registered under a name on every node at startup. A job folds
//! one key into an encoded partial result and merges partials; the
//! encoding is the job's own business — the substrate only moves bytes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use reef_types::Key;

use crate::error::JobError;
use crate::mapreduce::MapReduce;

/// The read/write surface a job sees while folding keys. Backed by the
/// distributed key/value store at runtime; tests substitute their own.
#[async_trait::async_trait]
pub trait JobContext: Send + Sync {
    /// Read a value from the shared address space.
    async fn read(&self, key: &Key) -> Result<Option<Bytes>, JobError>;

    /// Write a value to the shared address space.
    async fn write(&self, key: &Key, bytes: Bytes) -> Result<(), JobError>;
}

/// A distributed map/reduce operation, registered by name.
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Fold one key into an encoded partial result. Must not depend on
    /// the order keys are visited in.
    async fn fold_key(&self, ctx: &dyn JobContext, key: &Key) -> Result<Vec<u8>, JobError>;

    /// Merge two partial results. Must be associative; `left` always
    /// covers keys that precede `right` in the job's key list.
    fn merge(&self, left: Vec<u8>, right: Vec<u8>) -> Result<Vec<u8>, JobError>;

    /// The merge identity — the result over an empty key list.
    fn identity(&self) -> Vec<u8>;
}

/// Name → job table. Every node registers the same jobs at boot; a node
/// receiving an unknown name answers with [`JobError::Unknown`].
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a job under a name, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, job: Arc<dyn Job>) {
        self.jobs
            .write()
            .expect("jobs lock poisoned")
            .insert(name.into(), job);
    }

    /// Look up a job by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.read().expect("jobs lock poisoned").get(name).cloned()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a job over a local key span with the fork-join engine.
///
/// Errors short-circuit: the first failing fold or merge wins and no
/// further merging happens along that path.
pub async fn run_local(
    job: Arc<dyn Job>,
    ctx: Arc<dyn JobContext>,
    keys: Vec<Key>,
) -> Result<Vec<u8>, JobError> {
    let engine = {
        let fold_job = job.clone();
        let merge_job = job.clone();
        let identity_job = job.clone();
        MapReduce::new(
            move |key: Key| {
                let job = fold_job.clone();
                let ctx = ctx.clone();
                async move { job.fold_key(ctx.as_ref(), &key).await }
            },
            move |left, right| match (left, right) {
                (Ok(l), Ok(r)) => merge_job.merge(l, r),
                (Err(e), _) | (_, Err(e)) => Err(e),
            },
            move || Ok(identity_job.identity()),
        )
    };
    engine.run(keys).await
}
