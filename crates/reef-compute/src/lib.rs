//! Fork-join map/reduce over the shared address space.
//!
//! A job names an ordered list of keys and a per-key function. Execution
//! recursively bisects the list into sub-jobs that run in parallel, down
//! to single keys; partial results are merged back up the call tree with
//! an associative reduce. The per-key function must not depend on
//! invocation order — siblings run concurrently and split points are an
//! implementation choice.
//!
//! [`MapReduce`] is the generic engine; [`Job`]/[`JobRegistry`] are the
//! named, wire-dispatchable form used for cross-node fan-out, and
//! [`partition_by_home`] splits a key list into the per-node spans that
//! fan-out ships around.

mod error;
mod job;
mod mapreduce;
mod partition;

pub use error::JobError;
pub use job::{Job, JobContext, JobRegistry, run_local};
pub use mapreduce::MapReduce;
pub use partition::partition_by_home;
