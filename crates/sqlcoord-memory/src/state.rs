//! Tables of the in-memory store.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

pub(crate) struct LockRow {
    pub acquired: Instant,
    pub acquirer: String,
}

pub(crate) struct ItemRow {
    pub job_ref: String,
    pub queue_name: String,
    pub claimed_at: Option<Instant>,
}

/// Everything the store holds, guarded by one mutex.
///
/// Holding the mutex for the duration of a statement makes every statement
/// atomic, which is what row locks and unique constraints give a real store.
#[derive(Default)]
pub(crate) struct MemoryState {
    pub locks: HashMap<String, LockRow>,
    /// Ordered by id, so iteration yields the oldest item first.
    pub items: BTreeMap<i64, ItemRow>,
    pub servers: HashMap<String, Instant>,
    pub next_item_id: i64,
    /// Added to the wall clock to let tests age rows.
    pub clock_offset: Duration,
    /// Bumped by `disconnect_all`; connections from older generations are closed.
    pub generation: u64,
    pub pending_conflicts: u32,
    /// Statements that will fail with a backend error before touching any table.
    pub pending_failures: u32,
    pub refuse_connections: bool,
    pub connections_opened: u64,
}

impl MemoryState {
    /// The store's clock.
    pub fn now(&self) -> Instant {
        Instant::now() + self.clock_offset
    }

    /// Age of `at` according to the store's clock.
    pub fn age(&self, at: Instant) -> Duration {
        self.now().saturating_duration_since(at)
    }
}
