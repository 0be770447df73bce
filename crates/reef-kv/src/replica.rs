//! The per-value reader/writer word.
//!
//! A single atomic u64 arbitrates racing reads and writes of one value on
//! its home node. Bit layout:
//!
//! ```text
//!   63            48 47                                             0
//!  +----------------+------------------------------------------------+
//!  |  reader count  |  replica bitmap (one bit per dense node index) |
//!  +----------------+------------------------------------------------+
//! ```
//!
//! - bits 0..=47 — which nodes hold a cached copy of this value,
//! - bits 48..=63 — how many reads are active right now,
//! - `u64::MAX` — the locked sentinel: a write is being published and no
//!   new reads may start.
//!
//! The bitmap caps tracked nodes at [`MAX_TRACKED_NODES`]; a higher index
//! is an explicit capacity error, never silent corruption. The reader
//! count is capped one short of its field so a fully set word can never
//! be mistaken for the sentinel.
//!
//! All transitions are compare-and-swap with retry. Readers never block;
//! a writer waits for the active-read count to drain, parking its task so
//! the worker thread stays free for other work.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::error::KvError;

/// Replica bitmaps cover dense node indices below this ceiling.
pub const MAX_TRACKED_NODES: u32 = 48;

const BITMAP_BITS: u32 = 48;
const BITMAP_MASK: u64 = (1u64 << BITMAP_BITS) - 1;
const READER_ONE: u64 = 1u64 << BITMAP_BITS;
const MAX_READERS: u64 = 0xFFFE;

/// The locked sentinel. Unambiguous: a live word never has all 16 reader
/// bits set because the count is capped at `MAX_READERS`.
const LOCKED: u64 = u64::MAX;

/// Outcome of a [`ReplicaState::begin_read`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAttempt {
    /// The read is admitted and the reader is recorded as a cache holder.
    Admitted,
    /// A write is publishing; the caller must retry the whole read from
    /// scratch (it will observe the freshly published value).
    Locked,
}

/// The reader/writer word for one value.
pub struct ReplicaState {
    word: AtomicU64,
    /// Wakes a writer waiting for the reader count to reach zero.
    writers: Notify,
}

impl ReplicaState {
    /// A fresh idle state: no readers, no cache holders.
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
            writers: Notify::new(),
        }
    }

    /// An idle state that already records one cache holder. Used when a
    /// remote node's write creates the value on the home: that node holds
    /// the only known copy besides ours.
    pub fn with_holder(index: u32) -> Result<Self, KvError> {
        let bit = holder_bit(index)?;
        Ok(Self {
            word: AtomicU64::new(bit),
            writers: Notify::new(),
        })
    }

    /// Begin a read on behalf of the node with the given dense index.
    ///
    /// On [`ReadAttempt::Admitted`] the reader count is raised and the
    /// reader's bitmap bit is set; the node stays recorded as a cache
    /// holder until the value is invalidated, even after the read ends.
    /// Fails with [`ReadAttempt::Locked`] while a write is publishing.
    pub fn begin_read(&self, reader: u32) -> Result<ReadAttempt, KvError> {
        let bit = holder_bit(reader)?;
        loop {
            let word = self.word.load(Ordering::Acquire);
            if word == LOCKED {
                return Ok(ReadAttempt::Locked);
            }
            assert!(
                word_readers(word) < MAX_READERS,
                "active reader count overflow"
            );
            let next = (word + READER_ONE) | bit;
            if self
                .word
                .compare_exchange(word, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(ReadAttempt::Admitted);
            }
            // Lost the race against another reader or the writer; retry.
        }
    }

    /// End a read previously admitted for this reader. The bitmap bit
    /// stays set: finishing a read does not stop being a cache holder.
    /// When the count reaches zero, any writer waiting to lock is woken.
    pub fn end_read(&self, reader: u32) {
        debug_assert!(reader < MAX_TRACKED_NODES);
        let bit = 1u64 << reader;
        loop {
            let word = self.word.load(Ordering::Acquire);
            debug_assert!(word != LOCKED, "end_read on a locked value");
            debug_assert!(word_readers(word) > 0, "end_read without begin_read");
            debug_assert!(word & bit != 0, "reader bit must be set");
            let next = word - READER_ONE;
            if self
                .word
                .compare_exchange(word, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if word_readers(next) == 0 {
                    self.writers.notify_waiters();
                }
                return;
            }
        }
    }

    /// Lock this value for a write.
    ///
    /// Waits until no read is active, then swings the word to the locked
    /// sentinel and returns the replica bitmap as it stood at lock time —
    /// the set of nodes that must be sent invalidations. New reads fail
    /// with [`ReadAttempt::Locked`] from this point on.
    ///
    /// The wait parks the task rather than spinning, so the runtime
    /// worker is free to run other work while readers drain.
    pub async fn begin_write(&self) -> u64 {
        loop {
            let notified = self.writers.notified();
            tokio::pin!(notified);
            // Register interest before checking, so an end_read that
            // drains the count between our check and our sleep still
            // wakes us.
            notified.as_mut().enable();

            let word = self.word.load(Ordering::Acquire);
            if word != LOCKED && word_readers(word) == 0 {
                if self
                    .word
                    .compare_exchange(word, LOCKED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return word & BITMAP_MASK;
                }
                // A reader slipped in; re-check immediately.
                continue;
            }
            notified.await;
        }
    }

    /// Return a locked word to idle with no readers and no holders. The
    /// publish that replaced this value is complete; writers queued on
    /// this state may proceed.
    pub fn complete_write(&self) {
        let prior = self.word.swap(0, Ordering::AcqRel);
        debug_assert_eq!(prior, LOCKED, "complete_write without begin_write");
        self.writers.notify_waiters();
    }

    /// Current number of active readers (0 while locked).
    pub fn reader_count(&self) -> u32 {
        let word = self.word.load(Ordering::Acquire);
        if word == LOCKED {
            0
        } else {
            word_readers(word) as u32
        }
    }

    /// Current replica bitmap (empty while locked).
    pub fn holders(&self) -> u64 {
        let word = self.word.load(Ordering::Acquire);
        if word == LOCKED { 0 } else { word & BITMAP_MASK }
    }

    /// Whether the node with this index is recorded as a cache holder.
    pub fn is_holder(&self, index: u32) -> bool {
        index < MAX_TRACKED_NODES && self.holders() & (1u64 << index) != 0
    }

    /// Whether a write is currently publishing.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) == LOCKED
    }
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = self.word.load(Ordering::Relaxed);
        if word == LOCKED {
            f.write_str("ReplicaState(locked)")
        } else {
            write!(
                f,
                "ReplicaState(readers={}, holders={:#x})",
                word_readers(word),
                word & BITMAP_MASK
            )
        }
    }
}

fn word_readers(word: u64) -> u64 {
    word >> BITMAP_BITS
}

fn holder_bit(index: u32) -> Result<u64, KvError> {
    if index >= MAX_TRACKED_NODES {
        return Err(KvError::TooManyNodes {
            index,
            limit: MAX_TRACKED_NODES,
        });
    }
    Ok(1u64 << index)
}

/// Iterate the dense node indices set in a replica bitmap.
pub fn holder_indices(bitmap: u64) -> impl Iterator<Item = u32> {
    (0..MAX_TRACKED_NODES).filter(move |i| bitmap & (1u64 << i) != 0)
}
