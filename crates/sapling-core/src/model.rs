/// Async tree model: the single authority over which nodes have their
/// children loaded, and how missing children are fetched.
///
/// The model is owned by one thread (the UI thread). Every structural
/// mutation and every listener notification happens on that thread, inside
/// a `&mut self` method. Fetches run on the owner's [`OwnerQueue`]; their
/// results come back over a channel and are applied by
/// [`AsyncTreeModel::process_pending`] (or [`AsyncTreeModel::apply_completed`]
/// when the caller runs its own event loop).
///
/// # Per-node states
///
/// - **Unloaded**: the first `child_count` / `child` access starts a fetch.
/// - **Loading**: child accesses answer "no children yet" without starting
///   a second fetch.
/// - **Loaded**: children are served from the arena.
/// - **Failed**: the last fetch failed. Child accesses do not retry; an
///   explicit `reload` does.
use crate::book::LoadBook;
use crate::config::{EngineConfig, LoadMode};
use crate::error::TreeError;
use crate::fetch::{self, CompletedFetch};
use crate::listener::{ListenerId, ListenerSet, LoadListener, StructureListener};
use crate::node::{Arena, Entry, LoadState, NodeId, TreeNode};
use crate::provider::DataProvider;
use crate::queue::{OwnerQueue, Task};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type Key<P> = <<P as DataProvider>::Node as TreeNode>::Key;

/// Called by workers after they hand a result to the owner thread, so an
/// idle event loop can wake up (e.g. request a repaint).
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// One-shot continuation run on the owner thread after a node's next load
/// completes (`Ok`), fails, or the node is removed (`Err`).
pub type AfterLoad<P> = Box<dyn FnOnce(&mut AsyncTreeModel<P>, Result<(), TreeError>) + Send>;

/// What a load request did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadRequest {
    /// Submitted to the worker queue.
    Scheduled,
    /// Loaded synchronously; children are in place.
    Completed,
    /// Failed synchronously (provider error or closed queue).
    Failed,
    /// A fetch for this node was already outstanding; nothing was started.
    AlreadyLoading,
}

/// What applying a completion did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchApplied {
    Completed,
    Failed,
    /// The fetch was superseded (node removed, unloaded or repopulated).
    Discarded,
}

/// Record of a failed load, kept until the next load of the node.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub error: TreeError,
    pub at: chrono::DateTime<chrono::Local>,
}

pub struct AsyncTreeModel<P: DataProvider> {
    provider: Arc<P>,
    queue: OwnerQueue,
    book: Arc<LoadBook<Key<P>>>,
    arena: Arena<P::Node>,
    index: HashMap<Key<P>, NodeId>,
    root: NodeId,
    failures: HashMap<Key<P>, LoadFailure>,
    pending_actions: HashMap<Key<P>, Vec<AfterLoad<P>>>,
    load_mode: LoadMode,
    max_completions_per_pump: usize,
    completions_tx: Sender<CompletedFetch<P::Node>>,
    completions_rx: Receiver<CompletedFetch<P::Node>>,
    waker: Option<Waker>,
    load_listeners: ListenerSet<dyn LoadListener>,
    structure_listeners: ListenerSet<dyn StructureListener>,
}

impl<P: DataProvider> std::fmt::Debug for AsyncTreeModel<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTreeModel")
            .field("nodes", &self.arena.len())
            .field("busy", &self.book.busy_count())
            .field("cached", &self.book.cached_count())
            .field("load_mode", &self.load_mode)
            .field("queue", &self.queue)
            .finish()
    }
}

impl<P: DataProvider> AsyncTreeModel<P> {
    /// Build a model around `provider`'s root. Fetches go to `queue`.
    pub fn new(provider: Arc<P>, queue: OwnerQueue, config: &EngineConfig) -> Self {
        let root_value = provider.root();
        let root_key = root_value.key();
        let mut arena = Arena::new();
        let root = arena.insert(Entry {
            value: root_value,
            parent: None,
            children: Vec::new(),
        });
        let mut index = HashMap::new();
        index.insert(root_key, root);
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();

        Self {
            provider,
            queue,
            book: Arc::new(LoadBook::new()),
            arena,
            index,
            root,
            failures: HashMap::new(),
            pending_actions: HashMap::new(),
            load_mode: config.load_mode,
            max_completions_per_pump: config.max_completions_per_pump.max(1),
            completions_tx,
            completions_rx,
            waker: None,
            load_listeners: ListenerSet::new(),
            structure_listeners: ListenerSet::new(),
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn queue(&self) -> &OwnerQueue {
        &self.queue
    }

    pub fn node(&self, id: NodeId) -> Option<&P::Node> {
        self.arena.get(id).map(|entry| &entry.value)
    }

    pub fn key(&self, id: NodeId) -> Option<Key<P>> {
        self.node(id).map(TreeNode::key)
    }

    /// Look a node up by its key.
    pub fn find(&self, key: &Key<P>) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.arena.get(id).is_some()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.arena.get(id).and_then(|entry| entry.parent)
    }

    /// Ids from the root down to `id`, inclusive. Empty for unknown ids.
    pub fn path_to(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = self.contains(id).then_some(id);
        while let Some(node) = current {
            path.push(node);
            current = self.parent(node);
        }
        path.reverse();
        path
    }

    /// Children currently in the tree. Never starts a fetch.
    pub fn loaded_children(&self, id: NodeId) -> &[NodeId] {
        self.arena
            .get(id)
            .map(|entry| entry.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn index_of_child(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        self.loaded_children(parent).iter().position(|&c| c == child)
    }

    /// Provider leaf-ness. Unknown ids are reported as leaves.
    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.node(id).map_or(true, |node| self.provider.is_leaf(node))
    }

    /// Total number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }

    // ── Load state ─────────────────────────────────────────────────────────

    /// `true` while a fetch for `id`'s children is outstanding.
    pub fn is_busy(&self, id: NodeId) -> bool {
        self.node(id)
            .is_some_and(|node| self.book.is_busy(&node.key()))
    }

    /// `true` while `id`'s children are authoritative.
    pub fn is_cached(&self, id: NodeId) -> bool {
        self.node(id)
            .is_some_and(|node| self.book.is_cached(&node.key()))
    }

    pub fn load_state(&self, id: NodeId) -> LoadState {
        let Some(node) = self.node(id) else {
            return LoadState::Unloaded;
        };
        let key = node.key();
        if self.book.is_busy(&key) {
            LoadState::Loading
        } else if self.failures.contains_key(&key) {
            LoadState::Failed
        } else if self.book.is_cached(&key) {
            LoadState::Loaded
        } else {
            LoadState::Unloaded
        }
    }

    pub fn failure(&self, id: NodeId) -> Option<&LoadFailure> {
        self.node(id).and_then(|node| self.failures.get(&node.key()))
    }

    /// Number of outstanding fetches.
    pub fn busy_count(&self) -> usize {
        self.book.busy_count()
    }

    pub fn is_idle(&self) -> bool {
        self.book.busy_count() == 0
    }

    pub fn load_mode(&self) -> LoadMode {
        self.load_mode
    }

    /// Change the default load mode used by `load_children`, `reload` and
    /// child accesses. Per-call modes are available via the `_with` variants.
    pub fn set_load_mode(&mut self, mode: LoadMode) {
        self.load_mode = mode;
    }

    // ── Listeners ──────────────────────────────────────────────────────────

    /// The load listener set. Clones may be handed to other threads.
    pub fn load_listeners(&self) -> &ListenerSet<dyn LoadListener> {
        &self.load_listeners
    }

    pub fn structure_listeners(&self) -> &ListenerSet<dyn StructureListener> {
        &self.structure_listeners
    }

    pub fn add_load_listener(&self, listener: Arc<dyn LoadListener>) -> ListenerId {
        self.load_listeners.add(listener)
    }

    pub fn remove_load_listener(&self, id: ListenerId) -> bool {
        self.load_listeners.remove(id)
    }

    pub fn add_structure_listener(&self, listener: Arc<dyn StructureListener>) -> ListenerId {
        self.structure_listeners.add(listener)
    }

    pub fn remove_structure_listener(&self, id: ListenerId) -> bool {
        self.structure_listeners.remove(id)
    }

    pub fn set_waker(&mut self, waker: Waker) {
        self.waker = Some(waker);
    }

    // ── Child access (may start a fetch) ───────────────────────────────────

    /// Number of children of `id`.
    ///
    /// If the children are not loaded yet this starts a fetch in the default
    /// load mode. In asynchronous mode the answer is `0` until the
    /// completion has been applied; views are expected to ask again when
    /// they receive the insertion notification.
    pub fn child_count(&mut self, id: NodeId) -> usize {
        match self.load_state(id) {
            LoadState::Loading => 0,
            LoadState::Unloaded if !self.is_leaf(id) => {
                let _ = self.load_children(id);
                self.visible_children(id).len()
            }
            _ => self.loaded_children(id).len(),
        }
    }

    /// Child of `id` at `index`, starting a fetch like [`child_count`].
    ///
    /// [`child_count`]: Self::child_count
    pub fn child(&mut self, id: NodeId, index: usize) -> Option<NodeId> {
        match self.load_state(id) {
            LoadState::Loading => None,
            LoadState::Unloaded if !self.is_leaf(id) => {
                let _ = self.load_children(id);
                self.visible_children(id).get(index).copied()
            }
            _ => self.loaded_children(id).get(index).copied(),
        }
    }

    fn visible_children(&self, id: NodeId) -> &[NodeId] {
        if self.is_busy(id) {
            &[]
        } else {
            self.loaded_children(id)
        }
    }

    // ── Loading ────────────────────────────────────────────────────────────

    /// Load `id`'s children in the default mode.
    pub fn load_children(&mut self, id: NodeId) -> Result<LoadRequest, TreeError> {
        self.load_children_with(id, self.load_mode)
    }

    /// Load `id`'s children.
    ///
    /// At most one fetch per node is outstanding: if one is already running
    /// this returns [`LoadRequest::AlreadyLoading`] and starts nothing.
    /// Stale children are removed (with notifications) before the fetch.
    pub fn load_children_with(
        &mut self,
        id: NodeId,
        mode: LoadMode,
    ) -> Result<LoadRequest, TreeError> {
        let parent = self.node(id).ok_or(TreeError::UnknownNode(id))?.clone();
        let key = parent.key();
        let Some(ticket) = self.book.try_begin(&key) else {
            debug!("Load of {key:?} ignored: already loading");
            return Ok(LoadRequest::AlreadyLoading);
        };
        let epoch = ticket.epoch;

        self.failures.remove(&key);
        debug!("Children load started for {key:?} ({mode:?})");
        self.load_listeners.dispatch(|l| l.load_started(id));
        self.detach_children(id);
        self.book.uncache(&key);

        match mode {
            LoadMode::Sync => {
                match fetch::run_fetch(self.provider.as_ref(), &self.book, parent, ticket) {
                    Some(done) => Ok(match self.apply_completed(done) {
                        FetchApplied::Completed => LoadRequest::Completed,
                        FetchApplied::Failed | FetchApplied::Discarded => LoadRequest::Failed,
                    }),
                    None => {
                        warn!("Synchronous load of {key:?} was cancelled");
                        Ok(LoadRequest::Failed)
                    }
                }
            }
            LoadMode::Async => {
                let task = self.fetch_task(parent, ticket);
                match self.queue.execute(task) {
                    Ok(()) => Ok(LoadRequest::Scheduled),
                    Err(error) => {
                        self.fail_load(id, key, epoch, error);
                        Ok(LoadRequest::Failed)
                    }
                }
            }
        }
    }

    fn fetch_task(
        &self,
        parent: P::Node,
        ticket: crate::book::FetchTicket<Key<P>>,
    ) -> Task {
        let provider = Arc::clone(&self.provider);
        let book = Arc::clone(&self.book);
        let tx = self.completions_tx.clone();
        let waker = self.waker.clone();
        Box::new(move || {
            let Some(done) = fetch::run_fetch(provider.as_ref(), &book, parent, ticket) else {
                return;
            };
            if tx.send(done).is_err() {
                debug!("Model dropped before fetch completed; result discarded");
                return;
            }
            if let Some(waker) = waker {
                waker();
            }
        })
    }

    /// Forget `id`'s cached children and fetch them again in the default mode.
    ///
    /// A reload while the node is already loading is a no-op.
    pub fn reload(&mut self, id: NodeId) -> Result<LoadRequest, TreeError> {
        self.reload_with(id, self.load_mode)
    }

    pub fn reload_with(&mut self, id: NodeId, mode: LoadMode) -> Result<LoadRequest, TreeError> {
        let key = self.key(id).ok_or(TreeError::UnknownNode(id))?;
        if self.book.is_busy(&key) {
            debug!("Reload of {key:?} ignored: already loading");
            return Ok(LoadRequest::AlreadyLoading);
        }
        self.book.uncache(&key);
        self.load_children_with(id, mode)
    }

    /// Reload and block until the provider has answered and the children
    /// are spliced in. The model's default mode is left untouched.
    pub fn reload_and_wait(&mut self, id: NodeId) -> Result<LoadRequest, TreeError> {
        self.reload_with(id, LoadMode::Sync)
    }

    /// Queue `action` to run after `id`'s next load finishes.
    pub fn after_load(
        &mut self,
        id: NodeId,
        action: impl FnOnce(&mut Self, Result<(), TreeError>) + Send + 'static,
    ) -> Result<(), TreeError> {
        let key = self.key(id).ok_or(TreeError::UnknownNode(id))?;
        self.pending_actions
            .entry(key)
            .or_default()
            .push(Box::new(action));
        Ok(())
    }

    /// Reload `id` and run `action` once its children are available.
    ///
    /// If a load is already in flight the action waits for that one.
    pub fn reload_then(
        &mut self,
        id: NodeId,
        action: impl FnOnce(&mut Self, Result<(), TreeError>) + Send + 'static,
    ) -> Result<LoadRequest, TreeError> {
        self.after_load(id, action)?;
        self.reload(id)
    }

    // ── Completion boundary ────────────────────────────────────────────────

    /// Receiver of worker completions, for event loops that `select!` on it.
    /// Every received value must be passed to [`apply_completed`].
    ///
    /// [`apply_completed`]: Self::apply_completed
    pub fn completions(&self) -> &Receiver<CompletedFetch<P::Node>> {
        &self.completions_rx
    }

    /// Apply waiting completions without blocking. Returns how many were
    /// applied, at most `max_completions_per_pump`.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while applied < self.max_completions_per_pump {
            let Ok(done) = self.completions_rx.try_recv() else {
                break;
            };
            self.apply_completed(done);
            applied += 1;
        }
        applied
    }

    /// Block up to `timeout` for one completion, then drain whatever else is
    /// waiting. Returns `false` if nothing arrived.
    pub fn wait_pending(&mut self, timeout: Duration) -> bool {
        match self.completions_rx.recv_timeout(timeout) {
            Ok(done) => {
                self.apply_completed(done);
                self.process_pending();
                true
            }
            Err(_) => false,
        }
    }

    /// Pump completions until no fetch is outstanding or `timeout` elapses.
    pub fn wait_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.wait_pending(deadline - now);
        }
        true
    }

    /// Splice a completed fetch into the tree.
    ///
    /// Order: stale children removed, new children inserted, cache marked,
    /// busy cleared, then `load_completed` and any queued continuations.
    /// Completions for superseded fetches are discarded.
    pub fn apply_completed(&mut self, done: CompletedFetch<P::Node>) -> FetchApplied {
        let CompletedFetch { key, epoch, result } = done;
        if !self.book.is_current(&key, epoch) {
            debug!("Discarding stale fetch for {key:?}");
            return FetchApplied::Discarded;
        }
        let Some(id) = self.find(&key) else {
            debug!("Discarding fetch for removed node {key:?}");
            self.book.forget(&key);
            return FetchApplied::Discarded;
        };

        match result {
            Ok(children) => {
                self.detach_children(id);
                let inserted = self.attach_children(id, children);
                self.book.mark_cached(&key);
                self.book.finish(&key, epoch);
                debug!("Children load completed for {key:?}: {} nodes", inserted.len());
                self.load_listeners
                    .dispatch(|l| l.load_completed(id, &inserted));
                self.run_actions(&key, Ok(()));
                FetchApplied::Completed
            }
            Err(error) => {
                self.fail_load(id, key, epoch, error);
                FetchApplied::Failed
            }
        }
    }

    fn fail_load(&mut self, id: NodeId, key: Key<P>, epoch: u64, error: TreeError) {
        self.book.uncache(&key);
        self.book.finish(&key, epoch);
        warn!("Children load failed for {key:?}: {error}");
        self.failures.insert(
            key.clone(),
            LoadFailure {
                error: error.clone(),
                at: chrono::Local::now(),
            },
        );
        self.load_listeners.dispatch(|l| l.load_failed(id, &error));
        self.run_actions(&key, Err(error));
    }

    fn run_actions(&mut self, key: &Key<P>, result: Result<(), TreeError>) {
        if let Some(actions) = self.pending_actions.remove(key) {
            for action in actions {
                action(self, result.clone());
            }
        }
    }

    // ── Manual mutation ────────────────────────────────────────────────────

    /// Replace `id`'s children without asking the provider.
    ///
    /// Goes through the same busy/cache/notification sequence as a fetch,
    /// so observers cannot tell the two apart. An in-flight fetch for `id`
    /// is superseded and its result will be discarded.
    pub fn set_child_nodes(
        &mut self,
        id: NodeId,
        children: Vec<P::Node>,
    ) -> Result<Vec<NodeId>, TreeError> {
        let key = self.key(id).ok_or(TreeError::UnknownNode(id))?;
        self.check_new_keys(&children, Some(id))?;

        if self.book.cancel(&key) {
            debug!("Manual children for {key:?} supersede an in-flight fetch");
        }
        let Some(ticket) = self.book.try_begin(&key) else {
            return Err(TreeError::ChildrenNotLoaded(id));
        };

        self.failures.remove(&key);
        self.load_listeners.dispatch(|l| l.load_started(id));
        self.detach_children(id);
        self.book.mark_cached_if_current(&key, ticket.epoch);
        self.apply_completed(CompletedFetch {
            key,
            epoch: ticket.epoch,
            result: Ok(children),
        });
        Ok(self.loaded_children(id).to_vec())
    }

    /// Append children to a node whose children are already loaded (or to a
    /// provider leaf). Fires the same load and insertion events as a fetch.
    pub fn add_child_nodes(
        &mut self,
        id: NodeId,
        children: Vec<P::Node>,
    ) -> Result<Vec<NodeId>, TreeError> {
        let key = self.key(id).ok_or(TreeError::UnknownNode(id))?;
        match self.load_state(id) {
            LoadState::Loaded => {}
            LoadState::Unloaded if self.is_leaf(id) => {}
            _ => return Err(TreeError::ChildrenNotLoaded(id)),
        }
        self.check_new_keys(&children, None)?;
        let Some(ticket) = self.book.try_begin(&key) else {
            return Err(TreeError::ChildrenNotLoaded(id));
        };

        self.load_listeners.dispatch(|l| l.load_started(id));
        let inserted = self.attach_children(id, children);
        self.book.mark_cached(&key);
        self.book.finish(&key, ticket.epoch);
        self.load_listeners
            .dispatch(|l| l.load_completed(id, &inserted));
        self.run_actions(&key, Ok(()));
        Ok(inserted)
    }

    /// Detach `id` and its whole subtree. The root cannot be removed.
    ///
    /// Outstanding fetches in the subtree are cancelled; continuations
    /// waiting on removed nodes run with [`TreeError::NodeRemoved`].
    pub fn remove_node(&mut self, id: NodeId) -> Result<P::Node, TreeError> {
        if id == self.root {
            return Err(TreeError::CannotRemoveRoot);
        }
        let entry = self.arena.get(id).ok_or(TreeError::UnknownNode(id))?;
        let parent = entry.parent.ok_or(TreeError::UnknownNode(id))?;
        let position = self
            .index_of_child(parent, id)
            .ok_or(TreeError::UnknownNode(id))?;
        if let Some(parent_entry) = self.arena.get_mut(parent) {
            parent_entry.children.remove(position);
        }

        let mut orphaned = Vec::new();
        let removed = self.free_subtree(id, &mut orphaned);
        self.structure_listeners
            .dispatch(|l| l.nodes_removed(parent, &[position], &[id]));
        self.run_orphaned(orphaned);
        removed.ok_or(TreeError::UnknownNode(id))
    }

    /// Evict `id`'s cached children: the subtree below `id` is dropped and
    /// the node returns to `Unloaded`. An in-flight fetch is cancelled.
    pub fn unload(&mut self, id: NodeId) -> Result<(), TreeError> {
        let key = self.key(id).ok_or(TreeError::UnknownNode(id))?;
        let was_loading = self.book.cancel(&key);
        self.detach_children(id);
        self.book.uncache(&key);
        self.failures.remove(&key);
        if was_loading {
            debug!("Unload of {key:?} cancelled its in-flight fetch");
            self.load_listeners
                .dispatch(|l| l.load_failed(id, &TreeError::Cancelled));
            self.run_actions(&key, Err(TreeError::Cancelled));
        }
        Ok(())
    }

    /// Replace `id`'s payload. The key must not change.
    pub fn update_node(&mut self, id: NodeId, value: P::Node) -> Result<P::Node, TreeError> {
        let entry = self.arena.get_mut(id).ok_or(TreeError::UnknownNode(id))?;
        let expected = entry.value.key();
        let found = value.key();
        if expected != found {
            return Err(TreeError::KeyMismatch {
                expected: format!("{expected:?}"),
                found: format!("{found:?}"),
            });
        }
        let old = std::mem::replace(&mut entry.value, value);
        self.structure_listeners.dispatch(|l| l.node_changed(id));
        Ok(old)
    }

    // ── Structural helpers ─────────────────────────────────────────────────

    /// Reject keys already in the tree (outside `replacing`'s subtree, which
    /// is about to be dropped) or repeated within `children`.
    fn check_new_keys(
        &self,
        children: &[P::Node],
        replacing: Option<NodeId>,
    ) -> Result<(), TreeError> {
        let mut seen = HashSet::with_capacity(children.len());
        for child in children {
            let key = child.key();
            if !seen.insert(key.clone()) {
                return Err(TreeError::DuplicateKey(format!("{key:?}")));
            }
            if let Some(&existing) = self.index.get(&key) {
                let inside_replaced = replacing
                    .is_some_and(|parent| existing != parent && self.is_ancestor(parent, existing));
                if !inside_replaced {
                    return Err(TreeError::DuplicateKey(format!("{key:?}")));
                }
            }
        }
        Ok(())
    }

    fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.parent(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// Insert `children` under `parent` and fire `nodes_inserted`.
    /// Keys already present in the tree are skipped.
    fn attach_children(&mut self, parent: NodeId, children: Vec<P::Node>) -> Vec<NodeId> {
        let start = self.loaded_children(parent).len();
        let mut inserted = Vec::with_capacity(children.len());
        for value in children {
            let key = value.key();
            if self.index.contains_key(&key) {
                warn!("Skipping child with duplicate key {key:?}");
                continue;
            }
            let child = self.arena.insert(Entry {
                value,
                parent: Some(parent),
                children: Vec::new(),
            });
            self.index.insert(key, child);
            inserted.push(child);
        }
        if let Some(entry) = self.arena.get_mut(parent) {
            entry.children.extend_from_slice(&inserted);
        }
        if !inserted.is_empty() {
            let indices: Vec<usize> = (start..start + inserted.len()).collect();
            self.structure_listeners
                .dispatch(|l| l.nodes_inserted(parent, &indices));
        }
        inserted
    }

    /// Remove every child of `parent` and fire `nodes_removed`.
    fn detach_children(&mut self, parent: NodeId) {
        let children = match self.arena.get_mut(parent) {
            Some(entry) if !entry.children.is_empty() => std::mem::take(&mut entry.children),
            _ => return,
        };
        let mut orphaned = Vec::new();
        for &child in &children {
            self.free_subtree(child, &mut orphaned);
        }
        let indices: Vec<usize> = (0..children.len()).collect();
        self.structure_listeners
            .dispatch(|l| l.nodes_removed(parent, &indices, &children));
        self.run_orphaned(orphaned);
    }

    /// Drop `id` and its descendants from the arena and every table.
    /// Continuations waiting on them are moved to `orphaned`.
    fn free_subtree(&mut self, id: NodeId, orphaned: &mut Vec<AfterLoad<P>>) -> Option<P::Node> {
        let mut top = None;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(entry) = self.arena.remove(current) else {
                continue;
            };
            let key = entry.value.key();
            self.index.remove(&key);
            self.book.forget(&key);
            self.failures.remove(&key);
            if let Some(actions) = self.pending_actions.remove(&key) {
                orphaned.extend(actions);
            }
            stack.extend(entry.children);
            if current == id {
                top = Some(entry.value);
            }
        }
        top
    }

    fn run_orphaned(&mut self, orphaned: Vec<AfterLoad<P>>) {
        for action in orphaned {
            action(self, Err(TreeError::NodeRemoved));
        }
    }
}
