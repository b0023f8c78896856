//! Sapling view: headless tree-view state on top of `sapling-core`.
//!
//! Frontends render from [`TreeViewState::visible_rows`] and call
//! [`TreeViewState::process_messages`] once per frame. No painting code
//! lives here.
pub mod drop;
pub mod state;

pub use drop::{DropCoordinator, DropOutcome};
pub use state::{TreeViewState, VisibleRow, MAX_VISIBLE_ROWS};
