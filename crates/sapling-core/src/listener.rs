/// Load and structure listeners.
///
/// Listener sets can be shared with other threads and modified at any time,
/// including from inside a callback: dispatch always iterates over a
/// snapshot taken before the first callback runs. Callbacks themselves are
/// only ever invoked on the model's owner thread.
use crate::error::TreeError;
use crate::node::NodeId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Observer of children loads.
pub trait LoadListener: Send + Sync {
    /// A fetch for `parent` was started.
    fn load_started(&self, _parent: NodeId) {}

    /// `parent`'s children were spliced in. Fires after the busy flag is cleared.
    fn load_completed(&self, _parent: NodeId, _children: &[NodeId]) {}

    /// The fetch for `parent` failed. Fires after the busy flag is cleared.
    fn load_failed(&self, _parent: NodeId, _error: &TreeError) {}
}

/// Observer of structural changes, the notifications a tree view repaints on.
pub trait StructureListener: Send + Sync {
    /// Children were inserted under `parent` at `indices` (ascending).
    fn nodes_inserted(&self, _parent: NodeId, _indices: &[usize]) {}

    /// `removed` were detached from `parent`; `indices` are their positions
    /// before removal.
    fn nodes_removed(&self, _parent: NodeId, _indices: &[usize], _removed: &[NodeId]) {}

    /// `node`'s payload was replaced.
    fn node_changed(&self, _node: NodeId) {}
}

/// Registration handle returned by [`ListenerSet::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Copy-on-iterate listener collection.
///
/// Clones share the same underlying set.
pub struct ListenerSet<L: ?Sized> {
    entries: Arc<Mutex<Vec<(ListenerId, Arc<L>)>>>,
    next_id: Arc<AtomicU64>,
}

impl<L: ?Sized> Clone for ListenerSet<L> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<L: ?Sized> std::fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. Listeners are notified in registration order.
    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, listener));
        id
    }

    /// Deregister; returns `false` if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Defensive copy for dispatch. The lock is not held while callbacks run.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Call `f` for every listener registered at the time of the call.
    pub fn dispatch(&self, mut f: impl FnMut(&L)) {
        for listener in self.snapshot() {
            f(&listener);
        }
    }
}
