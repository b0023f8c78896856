/// Deferred drops onto nodes whose children may not be loaded yet.
///
/// A drop must not insert into a node before that node's children are
/// known, or the next load would wipe the dropped nodes out. The
/// coordinator reloads the target, waits for the load to finish, and only
/// then appends the payload. Everything runs on the model's owner thread.
use parking_lot::Mutex;
use sapling_core::{AsyncTreeModel, DataProvider, LoadRequest, NodeId, TreeError, TreeNode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type Key<P> = <<P as DataProvider>::Node as TreeNode>::Key;

/// What became of one drop.
#[derive(Debug, Clone)]
pub enum DropOutcome<K> {
    /// The payload was appended under `target`.
    Inserted { target: K, inserted: Vec<NodeId> },
    /// The target's load failed, it was removed while loading, or the
    /// payload clashed with existing keys.
    Rejected { target: K, error: TreeError },
}

impl<K> DropOutcome<K> {
    pub fn is_inserted(&self) -> bool {
        matches!(self, DropOutcome::Inserted { .. })
    }

    pub fn target(&self) -> &K {
        match self {
            DropOutcome::Inserted { target, .. } | DropOutcome::Rejected { target, .. } => target,
        }
    }
}

/// Performs drops once their targets have loaded and records the outcome.
pub struct DropCoordinator<P: DataProvider> {
    outcomes: Arc<Mutex<Vec<DropOutcome<Key<P>>>>>,
    pending: Arc<AtomicUsize>,
}

impl<P: DataProvider> Default for DropCoordinator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: DataProvider> DropCoordinator<P> {
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Drop `payload` onto `target`.
    ///
    /// The target is reloaded; the payload is appended when that load (or
    /// one already in flight) completes. In synchronous mode this happens
    /// before `drop_onto` returns, otherwise on a later pump of the model.
    pub fn drop_onto(
        &self,
        model: &mut AsyncTreeModel<P>,
        target: NodeId,
        payload: Vec<P::Node>,
    ) -> Result<LoadRequest, TreeError> {
        let key = model.key(target).ok_or(TreeError::UnknownNode(target))?;
        let outcomes = Arc::clone(&self.outcomes);
        let pending = Arc::clone(&self.pending);
        self.pending.fetch_add(1, Ordering::SeqCst);

        let request = model.reload_then(target, move |model, loaded| {
            let result = loaded.and_then(|()| {
                let id = model.find(&key).ok_or(TreeError::NodeRemoved)?;
                model.add_child_nodes(id, payload)
            });
            let outcome = match result {
                Ok(inserted) => {
                    debug!("Dropped {} nodes onto {key:?}", inserted.len());
                    DropOutcome::Inserted {
                        target: key,
                        inserted,
                    }
                }
                Err(error) => {
                    warn!("Drop onto {key:?} rejected: {error}");
                    DropOutcome::Rejected { target: key, error }
                }
            };
            outcomes.lock().push(outcome);
            pending.fetch_sub(1, Ordering::SeqCst);
        });

        if request.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        request
    }

    /// Drops still waiting for their target to load.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Take all recorded outcomes, oldest first.
    pub fn take_outcomes(&self) -> Vec<DropOutcome<Key<P>>> {
        std::mem::take(&mut *self.outcomes.lock())
    }
}
