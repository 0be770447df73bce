//! Per-value concurrency control and the home-node store.
//!
//! Every key has exactly one *home* node under a given cluster view; the
//! home arbitrates all reads and writes for that key. This crate holds
//! the pieces the home (and the remote writers talking to it) use to do
//! that:
//!
//! - [`ReplicaState`] — the atomically updated word encoding active
//!   readers plus the set of nodes caching the value, or a locked
//!   sentinel while a write publishes.
//! - [`WriteGate`] — the small handshake serializing a node's own writes
//!   to a key it does not home.
//! - [`Value`] — the payload bound to a key: bytes, an optional persisted
//!   copy in a byte backend, and the replica word.
//! - [`HomeStore`] — the key → value arbitration map on the home node.

mod error;
mod gate;
mod replica;
mod store;
mod value;

pub use error::KvError;
pub use gate::WriteGate;
pub use replica::{MAX_TRACKED_NODES, ReadAttempt, ReplicaState, holder_indices};
pub use store::HomeStore;
pub use value::Value;
