//! The Reef node runtime.
//!
//! Ties the pieces together into one running worker: the distributed
//! key/value façade ([`Dkv`]) routing every operation to its home node,
//! the retrying remote-call layer ([`RemoteCalls`]) whose task ids make
//! retransmission idempotent, the inbound message [`Dispatcher`], the
//! [`HeartbeatService`], and the [`NodeRuntime`] composition root that
//! owns them all and runs distributed jobs.

mod dispatch;
mod dkv;
mod error;
mod heartbeat;
mod remote;
mod runtime;

pub use dispatch::Dispatcher;
pub use dkv::Dkv;
pub use error::NodeError;
pub use heartbeat::HeartbeatService;
pub use remote::{OpOutput, RemoteCalls};
pub use runtime::{NodeRuntime, RuntimeConfig};
