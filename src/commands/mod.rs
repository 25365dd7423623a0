//! Thread-safe registry of in-flight FTP command ids, used to cancel a
//! transfer in progress from a connection other than the one driving it.
//!
//! An id is allocated when a `Get`/`Put` starts and erased when it finishes
//! or is explicitly terminated; the termination port only ever needs to
//! check "is this id still active" and "remove this id", both cheap under
//! a single lock.

use intmap::IntMap;
use parking_lot::Mutex;

/// A thread-safe set of `u32` command ids with a liveness-scanning
/// allocator, so a freshly generated id never collides with one still in
/// flight.
#[derive(Default)]
pub struct ActiveCommands {
    ids: Mutex<IntMap<()>>,
}

impl ActiveCommands {
    pub fn new() -> Self {
        ActiveCommands {
            ids: Mutex::new(IntMap::new()),
        }
    }

    /// Marks `id` as active.
    pub fn insert(&self, id: u32) {
        self.ids.lock().insert(id as u64, ());
    }

    /// Removes `id`, if present. Removing an id that is not active is a
    /// no-op.
    pub fn delete(&self, id: u32) {
        self.ids.lock().remove(id as u64);
    }

    /// True if `id` is currently active.
    pub fn contains(&self, id: u32) -> bool {
        self.ids.lock().contains_key(id as u64)
    }

    /// Allocates and inserts a fresh id not already active, returning it.
    pub fn generate_id(&self) -> u32 {
        let mut guard = self.ids.lock();
        let mut candidate: u32 = 1;
        while guard.contains_key(candidate as u64) {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                candidate = 1;
            }
        }
        guard.insert(candidate as u64, ());
        candidate
    }
}
