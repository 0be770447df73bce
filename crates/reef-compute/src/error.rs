//! Error types for distributed jobs.

/// Errors surfaced while running a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A key/value access made by the job failed.
    #[error("key/value access failed: {0}")]
    Access(String),

    /// The named job is not registered on this node.
    #[error("unknown job: {0}")]
    Unknown(String),

    /// The job's own logic failed.
    #[error("job failed: {0}")]
    Failed(String),
}
