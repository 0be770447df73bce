//! The work-in-progress ledger for remote tasks.
//!
//! Each peer node carries one of these tables (see
//! [`Node::ledger`](crate::Node::ledger)). An entry starts as a
//! placeholder when a task request is first observed, becomes the
//! completed result when the work finishes, and is removed once the
//! requester confirms it received the result. Retransmitted requests are
//! answered from the stored result instead of being re-executed, which is
//! what turns at-least-once delivery into at-most-once effect.

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// State of a tracked remote task.
#[derive(Debug, Clone)]
enum TaskEntry {
    /// Work accepted, not yet done.
    Pending,
    /// Work finished; the result is kept for retransmission.
    Done(Bytes),
}

/// Outcome of [`TaskLedger::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// First sighting of this task id — the caller must perform the work.
    New,
    /// A prior sighting is still running; the answer will follow.
    InFlight,
    /// The work already finished — resend this stored result.
    Done(Bytes),
}

/// Per-peer table of in-flight and completed remote tasks.
///
/// All operations go through the map's atomic entry API; the table is
/// shared by the transport reader tasks and the worker pool and is never
/// guarded by a coarse lock.
pub struct TaskLedger {
    entries: DashMap<u64, TaskEntry>,
}

impl TaskLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record a task-in-progress, or observe the prior entry if one
    /// already exists. The first call for a given id atomically installs
    /// a placeholder and returns [`Recorded::New`]; duplicates see
    /// [`Recorded::InFlight`] or the stored [`Recorded::Done`] result.
    pub fn record(&self, task: u64) -> Recorded {
        match self.entries.entry(task) {
            Entry::Occupied(entry) => match entry.get() {
                TaskEntry::Pending => Recorded::InFlight,
                TaskEntry::Done(result) => Recorded::Done(result.clone()),
            },
            Entry::Vacant(entry) => {
                entry.insert(TaskEntry::Pending);
                Recorded::New
            }
        }
    }

    /// Record the final result for a task. Must happen exactly once, after
    /// a [`Recorded::New`] from [`record`](Self::record); finishing the
    /// same task twice is a programming error.
    pub fn record_result(&self, task: u64, result: Bytes) {
        let prior = self.entries.insert(task, TaskEntry::Done(result));
        assert!(
            matches!(prior, Some(TaskEntry::Pending)),
            "task #{task} completed twice or was never recorded"
        );
    }

    /// Stop tracking a completed task: the requester has acknowledged the
    /// result. Forgetting a task that is still pending (or unknown) is a
    /// no-op. Returns whether an entry was removed.
    pub fn forget(&self, task: u64) -> bool {
        self.entries
            .remove_if(&task, |_, entry| matches!(entry, TaskEntry::Done(_)))
            .is_some()
    }

    /// Drop all entries. Used when the peer reboots: its task ids belong
    /// to a new logical session and must be treated as new work.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new()
    }
}
