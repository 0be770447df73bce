//! Cluster membership and node identity for Reef.
//!
//! This crate provides:
//!
//! - [`NodeRegistry`] — interning of endpoint addresses into canonical,
//!   uniquely numbered [`Node`] handles.
//! - [`TaskLedger`] — per-peer tracking of in-flight and completed remote
//!   tasks, giving at-most-once execution over a retrying transport.
//! - [`ClusterView`] and [`Cluster`] — the immutable membership snapshot
//!   with deterministic key placement, and the mutable context that owns
//!   the current view.

mod ledger;
mod registry;
mod view;

pub use ledger::{Recorded, TaskLedger};
pub use registry::{Node, NodeRegistry, unix_millis};
pub use view::{Cluster, ClusterView, RING_SLOTS};
