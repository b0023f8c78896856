/// Busy set and cache-state table.
///
/// Both tables are keyed by node key rather than by [`NodeId`] so that
/// replacing a node's payload does not lose its bookkeeping. They are shared
/// between the owning model and its fetch tasks, and are only ever mutated by
/// engine code.
///
/// # Locking
///
/// `busy` and `cached` are separate locks. When both are needed they are
/// always taken in the order busy -> cache.
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Handle for one outstanding fetch.
///
/// The epoch is unique per ticket. A completion is applied only if the
/// ticket still registered for its key carries the same epoch.
#[derive(Debug, Clone)]
pub struct FetchTicket<K> {
    pub key: K,
    pub epoch: u64,
    cancelled: Arc<AtomicBool>,
}

impl<K> FetchTicket<K> {
    /// `true` once the fetch has been superseded (node removed, unloaded or
    /// manually repopulated).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Shared bookkeeping for one model.
#[derive(Debug)]
pub(crate) struct LoadBook<K> {
    busy: Mutex<HashMap<K, FetchTicket<K>>>,
    cached: Mutex<HashSet<K>>,
    next_epoch: AtomicU64,
}

impl<K: Clone + Eq + Hash> LoadBook<K> {
    pub(crate) fn new() -> Self {
        Self {
            busy: Mutex::new(HashMap::new()),
            cached: Mutex::new(HashSet::new()),
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Atomically check-and-set the busy flag.
    ///
    /// Returns `None` when a fetch for `key` is already outstanding.
    pub(crate) fn try_begin(&self, key: &K) -> Option<FetchTicket<K>> {
        let mut busy = self.busy.lock();
        if busy.contains_key(key) {
            return None;
        }
        let ticket = FetchTicket {
            key: key.clone(),
            epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        busy.insert(key.clone(), ticket.clone());
        Some(ticket)
    }

    pub(crate) fn is_busy(&self, key: &K) -> bool {
        self.busy.lock().contains_key(key)
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.busy.lock().len()
    }

    /// `true` if `epoch` is the live ticket for `key`.
    pub(crate) fn is_current(&self, key: &K, epoch: u64) -> bool {
        self.busy
            .lock()
            .get(key)
            .is_some_and(|ticket| ticket.epoch == epoch)
    }

    /// Clear the busy flag if `epoch` is still the live ticket.
    ///
    /// Returns `false` for stale completions, which must be discarded.
    pub(crate) fn finish(&self, key: &K, epoch: u64) -> bool {
        let mut busy = self.busy.lock();
        match busy.get(key) {
            Some(ticket) if ticket.epoch == epoch => {
                busy.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drop the outstanding ticket for `key`, if any, and flag it cancelled
    /// so the worker can skip the provider call or its late result is
    /// discarded.
    pub(crate) fn cancel(&self, key: &K) -> bool {
        match self.busy.lock().remove(key) {
            Some(ticket) => {
                ticket.cancel();
                true
            }
            None => false,
        }
    }

    /// Mark `key` cached, but only while `epoch` is the live ticket.
    ///
    /// Holding the busy lock across the cache update means a concurrent
    /// cancel cannot slip in between the check and the write.
    pub(crate) fn mark_cached_if_current(&self, key: &K, epoch: u64) -> bool {
        let busy = self.busy.lock();
        if !busy.get(key).is_some_and(|ticket| ticket.epoch == epoch) {
            return false;
        }
        self.cached.lock().insert(key.clone());
        true
    }

    pub(crate) fn mark_cached(&self, key: &K) {
        self.cached.lock().insert(key.clone());
    }

    pub(crate) fn is_cached(&self, key: &K) -> bool {
        self.cached.lock().contains(key)
    }

    pub(crate) fn uncache(&self, key: &K) -> bool {
        self.cached.lock().remove(key)
    }

    /// Forget everything about `key`: cancel any fetch and drop its cache entry.
    pub(crate) fn forget(&self, key: &K) {
        self.cancel(key);
        self.uncache(key);
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.cached.lock().len()
    }
}
