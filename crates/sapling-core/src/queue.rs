/// Worker queues: bounded background executors for fetch tasks.
///
/// A [`WorkerQueues`] registry hands out one [`OwnerQueue`] per model. Under
/// [`QueuePolicy::Isolated`] every owner gets its own executor; under
/// [`QueuePolicy::Shared`] all owners submit to one executor.
///
/// # Lifecycle
///
/// - The registry only keeps `Weak` references to owners. Dropping an
///   `OwnerQueue` releases its executor without an explicit shutdown.
/// - Replacing an executor (new thread limit, policy switch) never cancels
///   work: bounded executors are rayon pools, and rayon keeps a pool's
///   threads alive until every job spawned on it has finished.
/// - After [`WorkerQueues::close`] every submission fails with
///   [`TreeError::QueueClosed`].
use crate::error::TreeError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// A unit of background work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Maximum number of concurrently running tasks for one executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadLimit {
    /// Every task runs on its own ad-hoc thread.
    Unbounded,
    /// At most this many tasks run at once; the rest wait in the queue.
    Max(NonZeroUsize),
}

impl ThreadLimit {
    /// One thread per logical CPU.
    pub fn available() -> Self {
        Self::from(num_cpus::get())
    }

    /// The configured bound, `None` when unbounded.
    pub fn get(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Max(n) => Some(n.get()),
        }
    }
}

/// `0` is the unbounded sentinel.
impl From<usize> for ThreadLimit {
    fn from(n: usize) -> Self {
        match NonZeroUsize::new(n) {
            Some(n) => Self::Max(n),
            None => Self::Unbounded,
        }
    }
}

/// Whether owners share one executor or each get their own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    #[default]
    Isolated,
    Shared,
}

/// Registry-assigned owner identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

enum ExecutorKind {
    Pool(rayon::ThreadPool),
    Unbounded,
}

/// One executor. Dropping the last `Arc` lets a rayon pool drain and exit.
struct Executor {
    limit: ThreadLimit,
    kind: ExecutorKind,
    thread_name: String,
    adhoc_spawned: AtomicU64,
}

impl Executor {
    fn build(limit: ThreadLimit, thread_name: &str) -> Result<Self, TreeError> {
        let kind = match limit {
            ThreadLimit::Unbounded => ExecutorKind::Unbounded,
            ThreadLimit::Max(n) => {
                let prefix = thread_name.to_owned();
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n.get())
                    .thread_name(move |i| format!("{prefix}-{i}"))
                    .build()
                    .map_err(|e| TreeError::WorkerPool(e.to_string()))?;
                ExecutorKind::Pool(pool)
            }
        };
        debug!("Worker executor started ({limit:?})");
        Ok(Self {
            limit,
            kind,
            thread_name: thread_name.to_owned(),
            adhoc_spawned: AtomicU64::new(0),
        })
    }

    fn spawn(&self, task: Task) -> Result<(), TreeError> {
        match &self.kind {
            ExecutorKind::Pool(pool) => {
                pool.spawn(task);
                Ok(())
            }
            ExecutorKind::Unbounded => {
                let n = self.adhoc_spawned.fetch_add(1, Ordering::Relaxed);
                std::thread::Builder::new()
                    .name(format!("{}-adhoc-{n}", self.thread_name))
                    .spawn(task)
                    .map(|_| ())
                    .map_err(|e| TreeError::WorkerPool(e.to_string()))
            }
        }
    }
}

struct SlotState {
    limit: ThreadLimit,
    executor: Option<Arc<Executor>>,
}

/// Per-owner state. Strongly held only by the owner's [`OwnerQueue`].
struct OwnerSlot {
    id: OwnerId,
    state: Mutex<SlotState>,
}

struct RegistryState {
    policy: QueuePolicy,
    default_limit: ThreadLimit,
    shared_limit: ThreadLimit,
    shared: Option<Arc<Executor>>,
    owners: HashMap<OwnerId, Weak<OwnerSlot>>,
    closed: bool,
}

impl RegistryState {
    fn live_slots(&mut self) -> Vec<Arc<OwnerSlot>> {
        self.owners.retain(|_, weak| weak.strong_count() > 0);
        self.owners.values().filter_map(Weak::upgrade).collect()
    }
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    next_owner: AtomicU64,
    thread_name: String,
}

/// Registry of worker executors, injected into every model that should use it.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct WorkerQueues {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for WorkerQueues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkerQueues")
            .field("policy", &state.policy)
            .field("owners", &state.owners.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl WorkerQueues {
    /// Create a registry. `default_limit` applies to newly registered owners
    /// and to the shared executor.
    pub fn new(policy: QueuePolicy, default_limit: ThreadLimit) -> Self {
        Self::with_thread_name(policy, default_limit, "sapling-worker")
    }

    pub fn with_thread_name(
        policy: QueuePolicy,
        default_limit: ThreadLimit,
        thread_name: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    policy,
                    default_limit,
                    shared_limit: default_limit,
                    shared: None,
                    owners: HashMap::new(),
                    closed: false,
                }),
                next_owner: AtomicU64::new(1),
                thread_name: thread_name.into(),
            }),
        }
    }

    /// Register a new owner and return its queue handle.
    pub fn register(&self) -> OwnerQueue {
        let id = OwnerId(self.inner.next_owner.fetch_add(1, Ordering::Relaxed));
        let mut state = self.inner.state.lock();
        let slot = Arc::new(OwnerSlot {
            id,
            state: Mutex::new(SlotState {
                limit: state.default_limit,
                executor: None,
            }),
        });
        state.owners.retain(|_, weak| weak.strong_count() > 0);
        state.owners.insert(id, Arc::downgrade(&slot));
        OwnerQueue {
            slot,
            registry: Arc::clone(&self.inner),
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.inner.state.lock().policy
    }

    /// Switch between per-owner and shared executors.
    ///
    /// Executors orphaned by the switch are released; work already queued on
    /// them still runs to completion.
    pub fn set_policy(&self, policy: QueuePolicy) {
        let mut state = self.inner.state.lock();
        if state.policy == policy {
            return;
        }
        state.policy = policy;
        match policy {
            QueuePolicy::Shared => {
                let slots = state.live_slots();
                for slot in &slots {
                    slot.state.lock().executor = None;
                }
                info!(
                    "Worker queues switched to shared policy; released {} owner executors",
                    slots.len()
                );
            }
            QueuePolicy::Isolated => {
                state.shared = None;
                info!("Worker queues switched to isolated policy");
            }
        }
    }

    /// Replace `owner`'s executor with one bounded by `limit`.
    ///
    /// Returns `false` if the owner has been dropped. Under the shared policy
    /// the limit is remembered and takes effect once isolation resumes.
    pub fn set_maximum_threads(&self, owner: OwnerId, limit: ThreadLimit) -> bool {
        let slot = {
            let mut state = self.inner.state.lock();
            state.live_slots().into_iter().find(|slot| slot.id == owner)
        };
        match slot {
            Some(slot) => {
                set_slot_limit(&slot, limit);
                true
            }
            None => false,
        }
    }

    /// Replace the shared executor with one bounded by `limit`.
    pub fn set_shared_threads(&self, limit: ThreadLimit) {
        let mut state = self.inner.state.lock();
        state.shared_limit = limit;
        state.shared = None;
        debug!("Shared worker limit set to {limit:?}");
    }

    /// Number of owners still alive. Dead weak entries are pruned.
    pub fn live_owners(&self) -> usize {
        self.inner.state.lock().live_slots().len()
    }

    /// Reject all further submissions and release every executor.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.shared = None;
        for slot in state.live_slots() {
            slot.state.lock().executor = None;
        }
        info!("Worker queues closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

fn set_slot_limit(slot: &OwnerSlot, limit: ThreadLimit) {
    let mut state = slot.state.lock();
    state.limit = limit;
    // The previous executor drains once in-flight submitters drop their Arc.
    state.executor = None;
    debug!("Owner {:?} worker limit set to {limit:?}", slot.id);
}

/// One owner's handle onto the registry. Dropping it releases the owner's
/// executor.
pub struct OwnerQueue {
    slot: Arc<OwnerSlot>,
    registry: Arc<RegistryInner>,
}

impl std::fmt::Debug for OwnerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerQueue").field("id", &self.slot.id).finish()
    }
}

impl OwnerQueue {
    pub fn id(&self) -> OwnerId {
        self.slot.id
    }

    /// Schedule `task` according to the registry's current policy.
    pub fn execute(&self, task: Task) -> Result<(), TreeError> {
        let executor = self.current_executor()?;
        executor.spawn(task)
    }

    /// Shorthand for [`WorkerQueues::set_maximum_threads`] on this owner.
    pub fn set_maximum_threads(&self, limit: ThreadLimit) {
        set_slot_limit(&self.slot, limit);
    }

    pub fn maximum_threads(&self) -> ThreadLimit {
        self.slot.state.lock().limit
    }

    /// The limit of the executor this owner is currently using, if one has
    /// been started.
    pub fn active_limit(&self) -> Option<ThreadLimit> {
        let state = self.registry.state.lock();
        match state.policy {
            QueuePolicy::Shared => state.shared.as_ref().map(|e| e.limit),
            QueuePolicy::Isolated => self.slot.state.lock().executor.as_ref().map(|e| e.limit),
        }
    }

    /// `true` if this owner currently holds its own executor.
    pub fn has_own_executor(&self) -> bool {
        self.slot.state.lock().executor.is_some()
    }

    fn current_executor(&self) -> Result<Arc<Executor>, TreeError> {
        let mut state = self.registry.state.lock();
        if state.closed {
            return Err(TreeError::QueueClosed);
        }
        match state.policy {
            QueuePolicy::Shared => {
                if let Some(executor) = &state.shared {
                    return Ok(Arc::clone(executor));
                }
                let executor = Arc::new(Executor::build(
                    state.shared_limit,
                    &self.registry.thread_name,
                )?);
                state.shared = Some(Arc::clone(&executor));
                Ok(executor)
            }
            QueuePolicy::Isolated => {
                let mut slot = self.slot.state.lock();
                if let Some(executor) = &slot.executor {
                    return Ok(Arc::clone(executor));
                }
                let name = format!("{}-{}", self.registry.thread_name, self.slot.id.0);
                let executor = Arc::new(Executor::build(slot.limit, &name)?);
                slot.executor = Some(Arc::clone(&executor));
                Ok(executor)
            }
        }
    }
}
