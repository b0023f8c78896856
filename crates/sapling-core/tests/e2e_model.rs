/// End-to-end tests for `AsyncTreeModel` with real worker threads.
///
/// The test thread plays the UI thread: it owns the model and pumps
/// completions. A gated provider lets each test hold a fetch open on a
/// worker thread for as long as it needs to observe the in-flight state.
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use sapling_core::{
    AsyncTreeModel, DataProvider, EngineConfig, LoadListener, LoadMode, LoadRequest, LoadState,
    NodeId, QueuePolicy, StructureListener, ThreadLimit, TreeError, TreeNode, WorkerQueues,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

// ── Helpers ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
struct Item(String);

impl TreeNode for Item {
    type Key = String;
    fn key(&self) -> String {
        self.0.clone()
    }
}

fn item(name: &str) -> Item {
    Item(name.to_owned())
}

/// Provider whose answers are scripted per parent name.
///
/// - Parents listed in `fail` return an error; `"boom"` panics.
/// - When `gated`, every call blocks until the test sends on the gate.
/// - Every call reports its parent name on `started` and records the
///   worker's thread id.
struct Scripted {
    children: HashMap<String, Vec<String>>,
    fail: Vec<String>,
    gate: Option<Receiver<()>>,
    started: Sender<String>,
    calls: Mutex<Vec<String>>,
    threads: Mutex<Vec<ThreadId>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Scripted {
    fn calls_for(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == name).count()
    }
}

impl DataProvider for Scripted {
    type Node = Item;

    fn root(&self) -> Item {
        item("root")
    }

    fn children(&self, parent: &Item) -> anyhow::Result<Vec<Item>> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().push(parent.0.clone());
        self.threads.lock().push(std::thread::current().id());
        let _ = self.started.send(parent.0.clone());

        if let Some(gate) = &self.gate {
            let _ = gate.recv_timeout(TIMEOUT);
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if parent.0 == "boom" {
            panic!("provider exploded");
        }
        if self.fail.contains(&parent.0) {
            anyhow::bail!("{} is unavailable", parent.0);
        }
        Ok(self
            .children
            .get(&parent.0)
            .map(|names| names.iter().map(|n| item(n)).collect())
            .unwrap_or_default())
    }

    fn is_leaf(&self, node: &Item) -> bool {
        node.0.starts_with("leaf")
    }
}

struct Harness {
    model: AsyncTreeModel<Scripted>,
    provider: Arc<Scripted>,
    started: Receiver<String>,
    gate: Option<Sender<()>>,
}

impl Harness {
    fn new(children: &[(&str, &[&str])], gated: bool, max_threads: usize) -> Self {
        Self::with_fail(children, &[], gated, max_threads)
    }

    fn with_fail(
        children: &[(&str, &[&str])],
        fail: &[&str],
        gated: bool,
        max_threads: usize,
    ) -> Self {
        let (started_tx, started) = crossbeam_channel::unbounded();
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let provider = Arc::new(Scripted {
            children: children
                .iter()
                .map(|(p, cs)| (p.to_string(), cs.iter().map(|c| c.to_string()).collect()))
                .collect(),
            fail: fail.iter().map(|f| f.to_string()).collect(),
            gate: gated.then_some(gate_rx),
            started: started_tx,
            calls: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let queues = WorkerQueues::new(QueuePolicy::Isolated, ThreadLimit::from(max_threads));
        let config = EngineConfig::default();
        let model = AsyncTreeModel::new(Arc::clone(&provider), queues.register(), &config);
        Self {
            model,
            provider,
            started,
            gate: gated.then_some(gate_tx),
        }
    }

    /// Wait until the provider has been entered for `name`.
    fn await_started(&self, name: &str) {
        let got = self.started.recv_timeout(TIMEOUT).expect("fetch never started");
        assert_eq!(got, name);
    }

    fn await_started_any(&self, n: usize) {
        for _ in 0..n {
            self.started.recv_timeout(TIMEOUT).expect("fetch never started");
        }
    }

    fn release(&self, n: usize) {
        let gate = self.gate.as_ref().expect("harness is not gated");
        for _ in 0..n {
            gate.send(()).unwrap();
        }
    }

    fn settle(&mut self) {
        assert!(
            self.model.wait_until_idle(TIMEOUT),
            "model did not become idle within {TIMEOUT:?}"
        );
    }

    fn names(&self, parent: NodeId) -> Vec<String> {
        self.model
            .loaded_children(parent)
            .iter()
            .map(|&id| self.model.node(id).unwrap().0.clone())
            .collect()
    }
}

#[derive(Default)]
struct ThreadRecorder {
    threads: Mutex<Vec<(String, ThreadId)>>,
}

impl ThreadRecorder {
    fn record(&self, event: &str) {
        self.threads
            .lock()
            .push((event.to_owned(), std::thread::current().id()));
    }
}

impl LoadListener for ThreadRecorder {
    fn load_started(&self, _parent: NodeId) {
        self.record("started");
    }
    fn load_completed(&self, _parent: NodeId, _children: &[NodeId]) {
        self.record("completed");
    }
    fn load_failed(&self, _parent: NodeId, _error: &TreeError) {
        self.record("failed");
    }
}

impl StructureListener for ThreadRecorder {
    fn nodes_inserted(&self, _parent: NodeId, _indices: &[usize]) {
        self.record("inserted");
    }
    fn nodes_removed(&self, _parent: NodeId, _indices: &[usize], _removed: &[NodeId]) {
        self.record("removed");
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

/// Unloaded root answers 0 and schedules a fetch; once applied the children
/// are served from memory.
#[test]
fn root_children_arrive_after_pump() {
    let mut h = Harness::new(&[("root", &["x", "y"])], false, 2);
    let root = h.model.root();

    assert_eq!(h.model.child_count(root), 0);
    assert_eq!(h.model.load_state(root), LoadState::Loading);
    h.settle();

    assert_eq!(h.model.child_count(root), 2);
    let x = h.model.child(root, 0).unwrap();
    assert_eq!(h.model.node(x), Some(&item("x")));
    assert_eq!(h.model.load_state(root), LoadState::Loaded);
    assert_eq!(h.provider.calls_for("root"), 1);
}

/// Two load requests for the same node while the first is in flight cause
/// exactly one provider call.
#[test]
fn at_most_one_fetch_per_node() {
    let mut h = Harness::new(&[("root", &["a"])], true, 4);
    let root = h.model.root();

    assert_eq!(h.model.load_children(root).unwrap(), LoadRequest::Scheduled);
    h.await_started("root");
    assert_eq!(
        h.model.load_children(root).unwrap(),
        LoadRequest::AlreadyLoading
    );
    assert_eq!(h.model.child_count(root), 0);
    assert_eq!(h.model.child(root, 0), None);

    h.release(1);
    h.settle();
    assert_eq!(h.provider.calls_for("root"), 1);
    assert_eq!(h.names(root), vec!["a"]);
}

/// A reload while the node is loading is a no-op; no second call happens
/// until the first completes.
#[test]
fn reload_during_inflight_load_is_ignored() {
    let mut h = Harness::new(&[("root", &["a"])], true, 4);
    let root = h.model.root();

    h.model.reload(root).unwrap();
    h.await_started("root");
    assert!(h.model.is_busy(root));
    assert_eq!(h.model.reload(root).unwrap(), LoadRequest::AlreadyLoading);
    assert_eq!(h.provider.calls_for("root"), 1);

    h.release(1);
    h.settle();
    assert!(!h.model.is_busy(root));

    h.model.reload(root).unwrap();
    h.await_started("root");
    h.release(1);
    h.settle();
    assert_eq!(h.provider.calls_for("root"), 2);
}

/// After `reload`, the node is fetched again even though it was cached.
#[test]
fn reload_invalidates_cache() {
    let mut h = Harness::new(&[("root", &["a", "b"])], false, 1);
    let root = h.model.root();
    h.model.child_count(root);
    h.settle();
    assert!(h.model.is_cached(root));

    h.model.child_count(root);
    assert_eq!(h.provider.calls_for("root"), 1);

    h.model.reload(root).unwrap();
    assert_eq!(h.model.load_state(root), LoadState::Loading);
    h.settle();
    assert_eq!(h.provider.calls_for("root"), 2);
    assert_eq!(h.model.child_count(root), 2);
}

/// The busy flag is cleared after success, provider errors and panics.
#[test]
fn busy_always_clears() {
    let mut h = Harness::with_fail(
        &[("root", &["ok", "bad", "boom"]), ("ok", &["leaf1"])],
        &["bad"],
        false,
        2,
    );
    let root = h.model.root();
    h.model.child_count(root);
    h.settle();

    let kids: Vec<NodeId> = h.model.loaded_children(root).to_vec();
    for &kid in &kids {
        h.model.child_count(kid);
    }
    h.settle();

    for &kid in &kids {
        assert!(!h.model.is_busy(kid), "busy flag left set");
    }
    assert_eq!(h.model.load_state(kids[0]), LoadState::Loaded);
    assert_eq!(h.model.load_state(kids[1]), LoadState::Failed);
    assert_eq!(h.model.load_state(kids[2]), LoadState::Failed);
    assert!(matches!(
        h.model.failure(kids[2]).map(|f| &f.error),
        Some(TreeError::ProviderPanicked(_))
    ));
    // Siblings and parent are untouched by the failures.
    assert_eq!(h.model.load_state(root), LoadState::Loaded);
    assert_eq!(h.names(kids[0]), vec!["leaf1"]);
}

/// Notifications fire on the owning thread even though fetches ran on
/// worker threads.
#[test]
fn notifications_are_confined_to_owner_thread() {
    let mut h = Harness::with_fail(&[("root", &["a", "b"])], &["b"], false, 2);
    let recorder = Arc::new(ThreadRecorder::default());
    h.model.add_load_listener(recorder.clone());
    h.model.add_structure_listener(recorder.clone());
    let owner = std::thread::current().id();

    let root = h.model.root();
    h.model.child_count(root);
    h.settle();
    h.model.reload(root).unwrap();
    h.settle();
    let b = h.model.child(root, 1).unwrap();
    h.model.child_count(b);
    h.settle();

    let events = recorder.threads.lock();
    for kind in ["started", "completed", "failed", "inserted", "removed"] {
        assert!(
            events.iter().any(|(e, _)| e == kind),
            "missing {kind} notification"
        );
    }
    assert!(events.iter().all(|(_, t)| *t == owner));
    assert!(h.provider.threads.lock().iter().all(|t| *t != owner));
}

/// Manually injected children are visible immediately and the provider is
/// never asked.
#[test]
fn manual_injection_is_immediate() {
    let mut h = Harness::new(&[], false, 1);
    let root = h.model.root();
    h.model
        .set_child_nodes(root, vec![item("a"), item("b"), item("c")])
        .unwrap();
    assert_eq!(h.model.child_count(root), 3);
    assert_eq!(h.provider.calls_for("root"), 0);
}

/// Manual injection while a fetch is in flight supersedes it; the late
/// result is discarded.
#[test]
fn manual_injection_supersedes_inflight_fetch() {
    let mut h = Harness::new(&[("root", &["fetched"])], true, 1);
    let root = h.model.root();
    h.model.load_children(root).unwrap();
    h.await_started("root");

    h.model.set_child_nodes(root, vec![item("manual")]).unwrap();
    assert!(!h.model.is_busy(root));

    h.release(1);
    // The worker still delivers its result; it must be dropped.
    assert!(h.model.wait_pending(TIMEOUT));
    assert_eq!(h.names(root), vec!["manual"]);
    assert_eq!(h.model.load_state(root), LoadState::Loaded);
}

/// With two worker threads and ten concurrent loads, at most two provider
/// calls run at once.
#[test]
fn thread_pool_bounds_concurrency() {
    let names: Vec<String> = (0..10).map(|i| format!("n{i}")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let mut h = Harness::new(&[("root", name_refs.as_slice())], true, 2);
    let root = h.model.root();
    h.model.load_children(root).unwrap();
    h.await_started("root");
    h.release(1);
    h.settle();

    let kids = h.model.loaded_children(root).to_vec();
    assert_eq!(kids.len(), 10);
    for &kid in &kids {
        assert_eq!(h.model.load_children(kid).unwrap(), LoadRequest::Scheduled);
    }
    h.await_started_any(2);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.provider.running.load(Ordering::SeqCst), 2);
    assert_eq!(h.model.busy_count(), 10);

    h.release(10);
    h.settle();
    assert!(h.provider.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(h.provider.calls.lock().len(), 11);
}

/// Removing a node while its children load discards the late result and
/// fails any continuation waiting on it.
#[test]
fn removal_while_loading_discards_result() {
    let mut h = Harness::new(&[("root", &["a"]), ("a", &["leaf1"])], true, 2);
    let root = h.model.root();
    h.model.load_children(root).unwrap();
    h.await_started("root");
    h.release(1);
    h.settle();

    let a = h.model.child(root, 0).unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let outcome_in_action = Arc::clone(&outcome);
    h.model
        .reload_then(a, move |_, result| {
            *outcome_in_action.lock() = Some(result);
        })
        .unwrap();
    h.await_started("a");

    h.model.remove_node(a).unwrap();
    assert!(matches!(
        outcome.lock().as_ref(),
        Some(Err(TreeError::NodeRemoved))
    ));
    assert!(h.model.is_idle());

    h.release(1);
    // Nothing waits on the channel any more; the stale completion (if the
    // worker got that far) is discarded by the next pump.
    h.model.wait_pending(Duration::from_millis(200));
    assert!(h.model.find(&"leaf1".to_owned()).is_none());
    assert_eq!(h.model.loaded_children(root).len(), 0);
}

/// `reload_and_wait` blocks until children are in place and leaves the
/// model's default mode alone.
#[test]
fn reload_and_wait_is_synchronous() {
    let mut h = Harness::new(&[("root", &["a", "b"])], false, 1);
    let root = h.model.root();
    assert_eq!(h.model.load_mode(), LoadMode::Async);

    assert_eq!(h.model.reload_and_wait(root).unwrap(), LoadRequest::Completed);
    assert_eq!(h.names(root), vec!["a", "b"]);
    assert_eq!(h.model.load_mode(), LoadMode::Async);
    // Synchronous fetches run on the calling thread.
    assert_eq!(
        h.provider.threads.lock().last().copied(),
        Some(std::thread::current().id())
    );
}

/// A closed worker registry fails the load instead of silently dropping it.
#[test]
fn closed_queue_fails_load() {
    let (started_tx, _started) = crossbeam_channel::unbounded();
    let provider = Arc::new(Scripted {
        children: HashMap::new(),
        fail: Vec::new(),
        gate: None,
        started: started_tx,
        calls: Mutex::new(Vec::new()),
        threads: Mutex::new(Vec::new()),
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let queues = WorkerQueues::new(QueuePolicy::Shared, ThreadLimit::from(1));
    let mut model =
        AsyncTreeModel::new(Arc::clone(&provider), queues.register(), &EngineConfig::default());
    queues.close();

    let root = model.root();
    assert_eq!(model.load_children(root).unwrap(), LoadRequest::Failed);
    assert!(!model.is_busy(root));
    assert!(matches!(
        model.failure(root).map(|f| &f.error),
        Some(TreeError::QueueClosed)
    ));
    assert!(provider.calls.lock().is_empty());
}

/// Two models sharing one pool both make progress, and the waker fires for
/// every delivered completion.
#[test]
fn shared_policy_serves_multiple_models() {
    let queues = WorkerQueues::new(QueuePolicy::Shared, ThreadLimit::from(1));
    // The waker fires after the completion is queued, so count wakes on a
    // channel rather than reading a counter right after the pump.
    let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
    let mut models = Vec::new();
    for _ in 0..2 {
        let (started_tx, _started) = crossbeam_channel::unbounded();
        let provider = Arc::new(Scripted {
            children: [("root".to_owned(), vec!["a".to_owned()])].into_iter().collect(),
            fail: Vec::new(),
            gate: None,
            started: started_tx,
            calls: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut model = AsyncTreeModel::new(provider, queues.register(), &EngineConfig::default());
        let wake_tx = wake_tx.clone();
        model.set_waker(Arc::new(move || {
            let _ = wake_tx.send(());
        }));
        models.push(model);
    }
    assert_eq!(queues.live_owners(), 2);

    for model in &mut models {
        let root = model.root();
        model.child_count(root);
    }
    for model in &mut models {
        assert!(model.wait_until_idle(TIMEOUT));
        let root = model.root();
        assert_eq!(model.child_count(root), 1);
    }
    for _ in 0..2 {
        wake_rx.recv_timeout(TIMEOUT).expect("waker not called");
    }
    assert!(wake_rx.try_recv().is_err());

    drop(models);
    assert_eq!(queues.live_owners(), 0);
}
