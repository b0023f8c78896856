/// Error taxonomy for the tree engine.
///
/// Provider failures are node-local: they are converted into
/// [`TreeError::Provider`] / [`TreeError::ProviderPanicked`], reported to
/// load listeners, and never leave a node's busy flag set.
use crate::node::NodeId;
use thiserror::Error;

/// Errors surfaced by the model, the worker queues, and fetch tasks.
#[derive(Debug, Clone, Error)]
pub enum TreeError {
    /// Work was submitted to a registry or executor that has been closed.
    #[error("worker queue is closed")]
    QueueClosed,

    /// The node id is stale or was never issued by this model.
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    /// The node was removed from the tree before a pending operation ran.
    #[error("node was removed before its load finished")]
    NodeRemoved,

    /// The load was cancelled before it completed (subtree unloaded).
    #[error("load was cancelled before it completed")]
    Cancelled,

    /// A node with the same key already exists in the tree.
    #[error("duplicate node key {0}")]
    DuplicateKey(String),

    /// A replacement payload carried a different key than the node it replaces.
    #[error("replacement key {found} does not match node key {expected}")]
    KeyMismatch { expected: String, found: String },

    /// The operation needs the node's children to be loaded first.
    #[error("children of {0:?} are not loaded")]
    ChildrenNotLoaded(NodeId),

    /// The root node cannot be removed or unloaded away.
    #[error("the root node cannot be removed")]
    CannotRemoveRoot,

    /// A bounded worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),

    /// The data provider returned an error while fetching children.
    #[error("data provider failed: {0}")]
    Provider(String),

    /// The data provider panicked while fetching children.
    #[error("data provider panicked: {0}")]
    ProviderPanicked(String),
}

impl TreeError {
    /// Wrap a provider error, keeping the full context chain.
    pub fn provider(err: &anyhow::Error) -> Self {
        Self::Provider(format!("{err:#}"))
    }

    /// `true` for failures raised by the data provider itself.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::ProviderPanicked(_))
    }
}
