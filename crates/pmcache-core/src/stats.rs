//! Aggregate cache statistics
//!
//! Kept behind their own lock in the engine, never in the pool: counters
//! are rebuilt from the index by recovery.

/// Engine-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Items removed to make room (always 0, there is no eviction)
    pub evictions: u64,
    /// Orphaned item allocations reclaimed by recovery
    pub reclaimed: u64,
    /// Record bytes of all linked items
    pub curr_bytes: u64,
    /// Linked items
    pub curr_items: u64,
    /// Items linked since start or the last reset
    pub total_items: u64,
}

impl EngineStats {
    pub(crate) fn on_link(&mut self, bytes: u64) {
        self.curr_items += 1;
        self.total_items += 1;
        self.curr_bytes += bytes;
    }

    pub(crate) fn on_unlink(&mut self, bytes: u64) {
        self.curr_items = self.curr_items.saturating_sub(1);
        self.curr_bytes = self.curr_bytes.saturating_sub(bytes);
    }

    /// Zero the cumulative counters; current occupancy is untouched.
    pub fn reset(&mut self) {
        self.evictions = 0;
        self.reclaimed = 0;
        self.total_items = 0;
    }
}
