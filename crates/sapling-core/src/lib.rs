//! Sapling Core - lazy-loading hierarchical data engine.
//!
//! A tree model whose nodes fetch their children on demand from a possibly
//! slow [`DataProvider`], using bounded background worker pools, per-node
//! at-most-one-fetch exclusion, and a single owner thread that applies every
//! structural change. No UI dependencies.
//!
//! # Modules
//!
//! - [`model`] - The async tree model and its completion boundary.
//! - [`queue`] - Worker queue registry and bounded executors.
//! - [`listener`] - Load/structure listeners with copy-on-iterate dispatch.
//! - [`provider`] - The data provider contract.
//! - [`node`] - Node identity, arena handles and load states.
//! - [`fs`] - A data provider over the local filesystem.
//! - [`export`] - CSV export of the loaded tree.

pub mod config;
pub mod error;
pub mod export;
pub mod fetch;
pub mod fs;
pub mod listener;
pub mod model;
pub mod node;
pub mod provider;
pub mod queue;

pub(crate) mod book;

pub use config::{EngineConfig, LoadMode};
pub use error::TreeError;
pub use listener::{ListenerId, ListenerSet, LoadListener, StructureListener};
pub use model::{AsyncTreeModel, FetchApplied, LoadFailure, LoadRequest};
pub use node::{LoadState, NodeId, TreeNode};
pub use provider::{ChildComparator, ChildFilter, DataProvider};
pub use queue::{OwnerId, OwnerQueue, QueuePolicy, ThreadLimit, WorkerQueues};
