/// Loadable nodes and their arena handles.
///
/// Payloads live in a slot arena owned by the model. Relationships use
/// [`NodeId`] handles rather than pointers; each handle carries the slot's
/// generation so an id held across a removal never resolves to whatever
/// node later reuses the slot.
use std::fmt::Debug;
use std::hash::Hash;

/// Payload stored in the tree.
///
/// The key is the node's bookkeeping identity. It must be unique within one
/// model and stable for the node's whole lifetime, even when the rest of the
/// payload is replaced through `update_node`.
pub trait TreeNode: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

/// Generational handle into the model's node arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    #[inline]
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        debug_assert!(index <= u32::MAX as usize, "NodeId overflow");
        Self {
            index: index as u32,
            generation,
        }
    }

    #[inline]
    pub(crate) fn idx(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

/// Load state of a node's children, derived from the busy set, the cache
/// table and the failure record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    /// Not busy, not cached: the next child access starts a fetch.
    Unloaded,
    /// A fetch is outstanding.
    Loading,
    /// Children are authoritative.
    Loaded,
    /// The last fetch failed. Only an explicit reload retries.
    Failed,
}

impl LoadState {
    /// Short label for status lines and exports.
    pub fn label(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
        }
    }
}

/// A node as stored in the arena.
#[derive(Debug, Clone)]
pub(crate) struct Entry<N> {
    pub(crate) value: N,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
}

#[derive(Debug)]
struct Slot<N> {
    generation: u32,
    entry: Option<Entry<N>>,
}

/// Slot arena with a free list.
///
/// Freed slots bump their generation before reuse.
#[derive(Debug)]
pub(crate) struct Arena<N> {
    slots: Vec<Slot<N>>,
    free: Vec<usize>,
    live: usize,
}

impl<N> Arena<N> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub(crate) fn insert(&mut self, entry: Entry<N>) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.entry = Some(entry);
            return NodeId::new(index, slot.generation);
        }
        let index = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        NodeId::new(index, 0)
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Entry<N>> {
        let slot = self.slots.get_mut(id.idx())?;
        if slot.generation != id.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.idx());
        self.live -= 1;
        Some(entry)
    }

    #[inline]
    pub(crate) fn get(&self, id: NodeId) -> Option<&Entry<N>> {
        let slot = self.slots.get(id.idx())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Entry<N>> {
        let slot = self.slots.get_mut(id.idx())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry.as_mut()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.live
    }
}
