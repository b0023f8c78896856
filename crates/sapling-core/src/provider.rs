/// Data provider contract.
///
/// The engine never creates payloads itself: the root and every child come
/// from a [`DataProvider`]. Only `children` is expected to be slow; it runs
/// on a worker thread in asynchronous mode and on the calling thread in
/// synchronous mode. Everything else is called on the model's owner thread
/// and must be fast.
use crate::node::TreeNode;
use std::cmp::Ordering;

/// Ordering applied to a freshly fetched child list.
pub type ChildComparator<N> = Box<dyn Fn(&N, &N) -> Ordering + Send + Sync>;

/// Predicate applied to a freshly fetched child list; `false` drops the child.
pub type ChildFilter<N> = Box<dyn Fn(&N) -> bool + Send + Sync>;

/// Supplies root, children, ordering, filtering and leaf-ness.
pub trait DataProvider: Send + Sync + 'static {
    type Node: TreeNode;

    /// The root payload. Called once when the model is built.
    fn root(&self) -> Self::Node;

    /// Fetch the children of `parent`. May block.
    fn children(&self, parent: &Self::Node) -> anyhow::Result<Vec<Self::Node>>;

    /// Optional ordering for the children of `parent`.
    fn children_comparator(&self, _parent: &Self::Node) -> Option<ChildComparator<Self::Node>> {
        None
    }

    /// Optional filter for the children of `parent`.
    fn children_filter(&self, _parent: &Self::Node) -> Option<ChildFilter<Self::Node>> {
        None
    }

    /// `true` if `node` can never have children. Answering `false` is always
    /// safe; it only permits a fetch that may come back empty.
    fn is_leaf(&self, node: &Self::Node) -> bool;
}

/// Apply the provider's filter and comparator to a fetched child list.
pub(crate) fn arrange_children<P: DataProvider>(
    provider: &P,
    parent: &P::Node,
    mut children: Vec<P::Node>,
) -> Vec<P::Node> {
    if let Some(filter) = provider.children_filter(parent) {
        children.retain(|child| filter(child));
    }
    if let Some(compare) = provider.children_comparator(parent) {
        // Stable sort: equal children keep the provider's order.
        children.sort_by(|a, b| compare(a, b));
    }
    children
}
