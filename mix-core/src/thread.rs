//! Thread-affinity tokens for stage graphs
//!
//! A stage graph is driven by exactly one pipeline thread. Stages do not lock
//! around `read`/`advance`; instead every call checks the calling OS thread
//! against the token stored in the graph's shared `ThreadSlot`.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

static NEXT_PIPELINE_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the thread that owns a stage graph
#[derive(Debug)]
pub struct PipelineThread {
    id: u64,
    name: String,
    os_thread: ThreadId,
}

impl PipelineThread {
    /// Token for the calling OS thread.
    pub fn current(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PIPELINE_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            os_thread: std::thread::current().id(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.os_thread
    }
}

/// Shared, swappable slot holding a graph's pipeline thread
///
/// Cloning the slot shares it: assigning a thread through any clone moves
/// every stage holding the slot to that thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadSlot(Arc<RwLock<Option<Arc<PipelineThread>>>>);

impl ThreadSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, thread: Option<Arc<PipelineThread>>) {
        *self.0.write() = thread;
    }

    pub fn get(&self) -> Option<Arc<PipelineThread>> {
        self.0.read().clone()
    }

    /// # Panics
    /// If a thread is assigned and the caller is not running on it.
    pub fn check_current(&self, stage: &str) {
        if let Some(thread) = self.0.read().as_ref() {
            assert!(
                thread.is_current(),
                "stage '{}' called off its pipeline thread '{}'",
                stage,
                thread.name()
            );
        }
    }
}
