/// Engine configuration.
///
/// Values can be loaded from a JSON file; missing fields fall back to
/// [`EngineConfig::default`].
use crate::queue::{QueuePolicy, ThreadLimit};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a children load waits for the data provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Fetch on a worker thread; the result is applied on the next pump.
    #[default]
    Async,
    /// Fetch inline on the calling thread and apply before returning.
    Sync,
}

/// Default cap on completions applied per [`process_pending`] call.
///
/// [`process_pending`]: crate::model::AsyncTreeModel::process_pending
pub const DEFAULT_COMPLETIONS_PER_PUMP: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default load mode for new models.
    pub load_mode: LoadMode,
    /// Worker threads per owner (or for the shared pool). `0` = unbounded.
    pub max_threads: usize,
    /// Per-owner or shared worker pools.
    pub policy: QueuePolicy,
    /// Upper bound on completions applied per pump so a backlog cannot stall
    /// the owner thread.
    pub max_completions_per_pump: usize,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            load_mode: LoadMode::Async,
            max_threads: num_cpus::get(),
            policy: QueuePolicy::Isolated,
            max_completions_per_pump: DEFAULT_COMPLETIONS_PER_PUMP,
            thread_name: "sapling-worker".to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("invalid engine configuration")
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn thread_limit(&self) -> ThreadLimit {
        ThreadLimit::from(self.max_threads)
    }

    /// Build a worker registry matching this configuration.
    pub fn worker_queues(&self) -> crate::queue::WorkerQueues {
        crate::queue::WorkerQueues::with_thread_name(
            self.policy,
            self.thread_limit(),
            self.thread_name.clone(),
        )
    }
}
