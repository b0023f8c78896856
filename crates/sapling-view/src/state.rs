/// Tree-view state management.
///
/// Holds everything a tree widget reads each frame: the flattened list of
/// visible rows, the expanded set and the selection. Children load on
/// worker threads; their results are applied in `process_messages()`, which
/// a frontend calls once per frame on the thread that owns the state.
use parking_lot::Mutex;
use sapling_core::{
    AsyncTreeModel, DataProvider, LoadListener, LoadRequest, LoadState, NodeId,
    StructureListener, TreeError,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A row in the flattened visible-rows list for a virtualised tree view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisibleRow {
    pub node: NodeId,
    /// Nesting depth (0 = root).
    pub depth: u16,
    /// Whether this node is currently expanded (always `false` for leaves).
    pub is_expanded: bool,
    /// Load state at the time the row was built, for spinners and error
    /// markers.
    pub state: LoadState,
}

/// Maximum rows in the visible-rows list.
///
/// Keeps a fully expanded multi-million-node tree from allocating without
/// bound. Users can collapse nodes to explore deeper subtrees.
pub const MAX_VISIBLE_ROWS: usize = 500_000;

/// Marks the rows stale whenever the model reports a change.
///
/// Registered on the model's listener sets; the frontend-side state is
/// rebuilt lazily in `process_messages`.
#[derive(Default)]
struct RowsInvalidator {
    dirty: AtomicBool,
    /// Most recent load failures, newest last.
    failures: Mutex<Vec<(NodeId, String)>>,
}

/// Cap on remembered failures.
const MAX_RECENT_FAILURES: usize = 100;

impl RowsInvalidator {
    fn mark(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl LoadListener for RowsInvalidator {
    fn load_started(&self, _parent: NodeId) {
        self.mark();
    }

    fn load_completed(&self, _parent: NodeId, _children: &[NodeId]) {
        self.mark();
    }

    fn load_failed(&self, parent: NodeId, error: &TreeError) {
        let mut failures = self.failures.lock();
        if failures.len() >= MAX_RECENT_FAILURES {
            failures.remove(0);
        }
        failures.push((parent, error.to_string()));
        drop(failures);
        self.mark();
    }
}

impl StructureListener for RowsInvalidator {
    fn nodes_inserted(&self, _parent: NodeId, _indices: &[usize]) {
        self.mark();
    }

    fn nodes_removed(&self, _parent: NodeId, _indices: &[usize], _removed: &[NodeId]) {
        self.mark();
    }

    fn node_changed(&self, _node: NodeId) {
        self.mark();
    }
}

/// All state behind one tree view.
pub struct TreeViewState<P: DataProvider> {
    model: AsyncTreeModel<P>,
    expanded: HashSet<NodeId>,
    pub visible_rows: Vec<VisibleRow>,
    pub selected: Option<NodeId>,
    invalidator: Arc<RowsInvalidator>,
}

impl<P: DataProvider> TreeViewState<P> {
    /// Wrap `model`. The root starts expanded, which kicks off its first load.
    pub fn new(mut model: AsyncTreeModel<P>) -> Self {
        let invalidator = Arc::new(RowsInvalidator::default());
        model.add_load_listener(invalidator.clone());
        model.add_structure_listener(invalidator.clone());

        let root = model.root();
        let mut state = Self {
            model,
            expanded: HashSet::from([root]),
            visible_rows: Vec::new(),
            selected: None,
            invalidator,
        };
        state.rebuild_visible_rows();
        state
    }

    pub fn model(&self) -> &AsyncTreeModel<P> {
        &self.model
    }

    /// Mutable access for collaborators such as
    /// [`DropCoordinator`](crate::drop::DropCoordinator). Changes made
    /// through it show up on the next `process_messages`.
    pub fn model_mut(&mut self) -> &mut AsyncTreeModel<P> {
        &mut self.model
    }

    pub fn is_expanded(&self, node: NodeId) -> bool {
        self.expanded.contains(&node)
    }

    /// Recent load failures as `(node, message)`, oldest first.
    pub fn recent_failures(&self) -> Vec<(NodeId, String)> {
        self.invalidator.failures.lock().clone()
    }

    /// Apply finished loads and rebuild rows if anything changed.
    ///
    /// Called once per frame; returns `true` if the UI should repaint. The
    /// number of completions applied per call is capped by the model's
    /// `max_completions_per_pump`, so a backlog cannot stall the frame.
    pub fn process_messages(&mut self) -> bool {
        let applied = self.model.process_pending();
        let rebuilt = self.invalidator.dirty.swap(false, Ordering::AcqRel);
        if rebuilt {
            self.rebuild_visible_rows();
        }
        applied > 0 || rebuilt
    }

    /// Expand `node`, starting its children load if needed. Returns `false`
    /// for leaves and unknown nodes.
    pub fn expand(&mut self, node: NodeId) -> bool {
        if !self.model.contains(node) || self.model.is_leaf(node) {
            return false;
        }
        let newly_expanded = self.expanded.insert(node);
        match self.row_of(node) {
            // The set may already hold a node whose row was collapsed away
            // with an ancestor; splice whenever the row itself is closed.
            Some(row) if !self.visible_rows[row].is_expanded => {
                expand_row(&mut self.model, &self.expanded, &mut self.visible_rows, row)
            }
            Some(_) => {}
            None if newly_expanded => self.rebuild_visible_rows(),
            None => {}
        }
        true
    }

    /// Collapse `node`. Its children stay loaded, and expanded descendants
    /// reappear expanded when `node` is opened again.
    pub fn collapse(&mut self, node: NodeId) {
        if !self.expanded.remove(&node) {
            return;
        }
        if let Some(row) = self.row_of(node) {
            collapse_row(&mut self.visible_rows, row);
        }
    }

    /// Toggle expansion of the node at `row_index` in `visible_rows`.
    pub fn toggle_expand(&mut self, row_index: usize) {
        let Some(row) = self.visible_rows.get(row_index) else {
            return;
        };
        let node = row.node;
        if row.is_expanded {
            self.collapse(node);
        } else {
            self.expand(node);
        }
    }

    /// Reload `node`'s children from the provider.
    pub fn refresh(&mut self, node: NodeId) -> Result<LoadRequest, TreeError> {
        let request = self.model.reload(node)?;
        debug!("Refresh of {node:?}: {request:?}");
        self.rebuild_visible_rows();
        Ok(request)
    }

    /// Expand every ancestor of `target` so its row becomes visible, and
    /// select it. Returns the row index, if the row fits under the cap.
    pub fn reveal(&mut self, target: NodeId) -> Option<usize> {
        if !self.model.contains(target) {
            return None;
        }
        let path = self.model.path_to(target);
        for &ancestor in &path[..path.len().saturating_sub(1)] {
            self.expanded.insert(ancestor);
        }
        self.rebuild_visible_rows();
        self.selected = Some(target);
        self.row_of(target)
    }

    fn row_of(&self, node: NodeId) -> Option<usize> {
        self.visible_rows.iter().position(|r| r.node == node)
    }

    /// Rebuild the rows from the root, following the expanded set.
    ///
    /// Nodes that have left the model are dropped from the expanded set and
    /// the selection. Stops at [`MAX_VISIBLE_ROWS`].
    fn rebuild_visible_rows(&mut self) {
        let model = &self.model;
        self.expanded.retain(|&id| model.contains(id));
        if self.selected.is_some_and(|id| !model.contains(id)) {
            self.selected = None;
        }

        self.visible_rows.clear();
        let root = self.model.root();
        build_rows_recursive(
            &mut self.model,
            &self.expanded,
            &mut self.visible_rows,
            root,
            0,
            MAX_VISIBLE_ROWS,
        );
    }
}

/// Push `node` and, if expanded, its loaded descendants, stopping once
/// `rows` holds `limit` entries.
///
/// Free function so the model can be borrowed mutably (child access may
/// start a load) alongside the expanded set and the rows.
fn build_rows_recursive<P: DataProvider>(
    model: &mut AsyncTreeModel<P>,
    expanded: &HashSet<NodeId>,
    rows: &mut Vec<VisibleRow>,
    node: NodeId,
    depth: u16,
    limit: usize,
) {
    if rows.len() >= limit {
        return;
    }
    let is_expanded = expanded.contains(&node) && !model.is_leaf(node);
    if is_expanded {
        model.child_count(node);
    }
    rows.push(VisibleRow {
        node,
        depth,
        is_expanded,
        state: model.load_state(node),
    });

    if is_expanded {
        let children = model.loaded_children(node).to_vec();
        for child in children {
            build_rows_recursive(model, expanded, rows, child, depth + 1, limit);
        }
    }
}

/// Insert the loaded subtree of the row at `row_index` right after it,
/// following the expanded set below it. Respects [`MAX_VISIBLE_ROWS`]: only
/// as many rows as headroom allows.
fn expand_row<P: DataProvider>(
    model: &mut AsyncTreeModel<P>,
    expanded: &HashSet<NodeId>,
    rows: &mut Vec<VisibleRow>,
    row_index: usize,
) {
    let node = rows[row_index].node;
    let child_depth = rows[row_index].depth + 1;
    model.child_count(node);

    let headroom = MAX_VISIBLE_ROWS.saturating_sub(rows.len());
    let mut new_rows = Vec::new();
    let children = model.loaded_children(node).to_vec();
    for child in children {
        build_rows_recursive(model, expanded, &mut new_rows, child, child_depth, headroom);
    }

    let insert_pos = row_index + 1;
    rows.splice(insert_pos..insert_pos, new_rows);
    rows[row_index].is_expanded = true;
    rows[row_index].state = model.load_state(node);
}

/// Remove all descendants (rows deeper than this one that follow it).
fn collapse_row(rows: &mut Vec<VisibleRow>, row_index: usize) {
    let parent_depth = rows[row_index].depth;
    let remove_start = row_index + 1;
    let mut remove_end = remove_start;
    while remove_end < rows.len() && rows[remove_end].depth > parent_depth {
        remove_end += 1;
    }
    rows.drain(remove_start..remove_end);
    rows[row_index].is_expanded = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(node_depth: u16, expanded: bool) -> VisibleRow {
        // NodeIds cannot be built outside the core crate; tests that need
        // real ids live in tests/e2e_state.rs.
        VisibleRow {
            node: dummy_id(),
            depth: node_depth,
            is_expanded: expanded,
            state: LoadState::Loaded,
        }
    }

    fn dummy_id() -> NodeId {
        use sapling_core::{EngineConfig, QueuePolicy, ThreadLimit, TreeNode, WorkerQueues};

        #[derive(Clone, Debug)]
        struct Unit;
        impl TreeNode for Unit {
            type Key = ();
            fn key(&self) {}
        }
        struct One;
        impl DataProvider for One {
            type Node = Unit;
            fn root(&self) -> Unit {
                Unit
            }
            fn children(&self, _parent: &Unit) -> anyhow::Result<Vec<Unit>> {
                Ok(Vec::new())
            }
            fn is_leaf(&self, _node: &Unit) -> bool {
                true
            }
        }

        let queues = WorkerQueues::new(QueuePolicy::Isolated, ThreadLimit::from(1));
        AsyncTreeModel::new(Arc::new(One), queues.register(), &EngineConfig::default()).root()
    }

    #[test]
    fn collapse_removes_only_descendants() {
        let mut rows = vec![
            row(0, true),
            row(1, true),
            row(2, false),
            row(2, false),
            row(1, false),
        ];
        collapse_row(&mut rows, 1);
        assert_eq!(rows.len(), 3);
        assert!(!rows[1].is_expanded);
        assert_eq!(rows[2].depth, 1);
    }

    #[test]
    fn collapse_last_row_is_a_no_op_on_length() {
        let mut rows = vec![row(0, true), row(1, true)];
        collapse_row(&mut rows, 1);
        assert_eq!(rows.len(), 2);
        assert!(!rows[1].is_expanded);
    }
}
