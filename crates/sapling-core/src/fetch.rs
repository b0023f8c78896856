/// Worker-side half of a children load.
///
/// A fetch runs the provider call, applies the provider's filter and
/// comparator, and records the cache entry. It never touches the tree
/// structure: the result travels back to the owner thread as a
/// [`CompletedFetch`] and is spliced in there.
use crate::book::{FetchTicket, LoadBook};
use crate::error::TreeError;
use crate::node::TreeNode;
use crate::provider::{arrange_children, DataProvider};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::debug;

/// Result of one fetch, waiting to be applied on the owner thread.
#[derive(Debug)]
pub struct CompletedFetch<N: TreeNode> {
    pub(crate) key: N::Key,
    pub(crate) epoch: u64,
    pub(crate) result: Result<Vec<N>, TreeError>,
}

impl<N: TreeNode> CompletedFetch<N> {
    /// Key of the parent whose children were fetched.
    pub fn key(&self) -> &N::Key {
        &self.key
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run the provider call for `ticket`.
///
/// Returns `None` if the ticket was cancelled before the call started; the
/// canceller has already cleared the busy flag.
pub(crate) fn run_fetch<P: DataProvider>(
    provider: &P,
    book: &LoadBook<<P::Node as TreeNode>::Key>,
    parent: P::Node,
    ticket: FetchTicket<<P::Node as TreeNode>::Key>,
) -> Option<CompletedFetch<P::Node>> {
    if ticket.is_cancelled() {
        debug!("Skipping cancelled fetch for {:?}", ticket.key);
        return None;
    }

    // Provider code (including its comparator and filter) must not be able
    // to leave the node busy forever, so panics are caught here.
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        provider
            .children(&parent)
            .map(|children| arrange_children(provider, &parent, children))
    }));

    let result = match outcome {
        Ok(Ok(children)) => Ok(children),
        Ok(Err(err)) => Err(TreeError::provider(&err)),
        Err(payload) => Err(TreeError::ProviderPanicked(panic_message(payload.as_ref()))),
    };

    if result.is_ok() && !book.mark_cached_if_current(&ticket.key, ticket.epoch) {
        debug!("Fetch for {:?} was superseded while running", ticket.key);
    }

    Some(CompletedFetch {
        key: ticket.key,
        epoch: ticket.epoch,
        result,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
