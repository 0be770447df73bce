//! Error types for key/value arbitration.

/// Errors surfaced by the key/value layer.
///
/// Transient conditions (a lost CAS race, a read arriving while a write
/// is publishing) are retried internally and never appear here.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// A byte-backend operation failed. Backend I/O is not retried by the
    /// core; the fault belongs to the caller.
    #[error("backend error: {0}")]
    Store(#[from] reef_store::StoreError),

    /// A node index does not fit the replica bitmap.
    #[error(
        "node index {index} exceeds the replica tracking ceiling of {limit} nodes"
    )]
    TooManyNodes {
        /// The offending dense node index.
        index: u32,
        /// The bitmap width ceiling.
        limit: u32,
    },
}
