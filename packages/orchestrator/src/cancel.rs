// ABOUTME: In-process cancellation registry keyed by task id
// ABOUTME: Flags are advisory within this process; the persisted store is authoritative across processes

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-task cancellation flags.
///
/// A flag only reaches the orchestrator run living in the same process;
/// independent invocations coordinate through the persisted store instead.
/// Never assume the registry is populated for a given task.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    flags: Arc<RwLock<HashMap<String, Arc<AtomicBool>>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task run and return its flag.
    pub async fn register(&self, task_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags
            .write()
            .await
            .insert(task_id.to_string(), flag.clone());
        flag
    }

    /// Raise the flag for a task. Inserts a raised flag when the task was
    /// never registered here, so a later register in this process observes it.
    pub async fn set(&self, task_id: &str) {
        let mut flags = self.flags.write().await;
        match flags.get(task_id) {
            Some(flag) => flag.store(true, Ordering::SeqCst),
            None => {
                flags.insert(task_id.to_string(), Arc::new(AtomicBool::new(true)));
            }
        }
    }

    pub async fn is_cancelled(&self, task_id: &str) -> bool {
        self.flags
            .read()
            .await
            .get(task_id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub async fn remove(&self, task_id: &str) {
        self.flags.write().await.remove(task_id);
    }
}
