//! Ordering gate for writes forwarded to a remote home.
//!
//! A node that does not home a key forwards its writes to the home node
//! and must not issue a second write to the same key while the first is
//! still in flight — same-node write order per key is total. A remote
//! writer is not a cache reader, so this is its own small handshake
//! rather than the reader/bitmap word: not-yet-done → one-waiter-pending
//! → done.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

const IN_FLIGHT: u8 = 0;
const WAITED: u8 = 1;
const DONE: u8 = 2;

/// The in-flight marker for one forwarded write.
///
/// Created when the write starts; later writers to the same key call
/// [`wait_done`](Self::wait_done) and block behind it; the owner calls
/// [`complete`](Self::complete) once the home has acknowledged the
/// publish.
pub struct WriteGate {
    state: AtomicU8,
    done: Notify,
}

impl WriteGate {
    /// A gate for a write that is now in flight.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IN_FLIGHT),
            done: Notify::new(),
        }
    }

    /// Block until the in-flight write completes. Marks the gate as
    /// having a waiter so the completer knows a wakeup is needed.
    pub async fn wait_done(&self) {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state.load(Ordering::Acquire) {
                DONE => return,
                IN_FLIGHT => {
                    // First waiter flips the gate to one-waiter-pending.
                    let _ = self.state.compare_exchange(
                        IN_FLIGHT,
                        WAITED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    continue;
                }
                _ => {}
            }
            notified.await;
        }
    }

    /// The forwarded write has been acknowledged by the home. Wakes any
    /// writer blocked behind it.
    pub fn complete(&self) {
        let prior = self.state.swap(DONE, Ordering::AcqRel);
        debug_assert_ne!(prior, DONE, "write gate completed twice");
        if prior == WAITED {
            self.done.notify_waiters();
        }
    }

    /// Whether the write has completed.
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }
}

impl Default for WriteGate {
    fn default() -> Self {
        Self::new()
    }
}
