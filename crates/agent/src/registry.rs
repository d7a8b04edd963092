//! Registry of in-flight runs with cooperative stop flags.
//!
//! The transport layer registers a run before starting the loop and can
//! stop it from another task. The loop polls the flag at the top of each
//! iteration; stopping is always cooperative, never an abort.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::info;

/// Handle to one in-flight run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    stop: Arc<AtomicBool>,
}

impl RunHandle {
    /// Request a cooperative stop.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// The flag itself, shared with the loop.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

/// Arena of running loops, keyed by run id.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, RunHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and get its handle. Replaces any stale entry
    /// under the same id.
    pub async fn register(&self, run_id: impl Into<String>) -> RunHandle {
        let run_id = run_id.into();
        let handle = RunHandle {
            run_id: run_id.clone(),
            started_at: Utc::now(),
            stop: Arc::new(AtomicBool::new(false)),
        };
        self.runs.write().await.insert(run_id, handle.clone());
        handle
    }

    /// Request a stop for a run. Returns false when the id is unknown.
    pub async fn stop(&self, run_id: &str) -> bool {
        match self.runs.read().await.get(run_id) {
            Some(handle) => {
                info!(run_id = %run_id, "Stop requested");
                handle.request_stop();
                true
            }
            None => false,
        }
    }

    /// Remove a finished run.
    pub async fn finish(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }

    pub async fn get(&self, run_id: &str) -> Option<RunHandle> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_stop_finish_lifecycle() {
        let registry = RunRegistry::new();
        let handle = registry.register("r1").await;
        assert_eq!(registry.running_count().await, 1);
        assert!(!handle.stop_requested());

        assert!(registry.stop("r1").await);
        assert!(handle.stop_requested());

        registry.finish("r1").await;
        assert_eq!(registry.running_count().await, 0);
        assert!(registry.get("r1").await.is_none());
    }

    #[tokio::test]
    async fn stopping_unknown_run_is_false() {
        let registry = RunRegistry::new();
        assert!(!registry.stop("nope").await);
    }

    #[tokio::test]
    async fn flag_is_shared_with_clones() {
        let registry = RunRegistry::new();
        let handle = registry.register("r1").await;
        let flag = handle.stop_flag();

        registry.stop("r1").await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn re_registering_resets_the_flag() {
        let registry = RunRegistry::new();
        let first = registry.register("r1").await;
        first.request_stop();

        let second = registry.register("r1").await;
        assert!(!second.stop_requested());
    }
}
