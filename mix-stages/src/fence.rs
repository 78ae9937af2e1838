//! Completion fences
//!
//! A fence travels with a command into the pipeline thread and is dropped
//! when the command's work is done (a pushed packet fully consumed, a queue
//! cleared). The enqueuing thread observes this through the paired waiter.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Signals its waiter when dropped
#[derive(Debug)]
pub struct CompletionFence {
    _signal: Sender<()>,
}

#[derive(Debug)]
pub struct FenceWaiter {
    signal: Receiver<()>,
}

/// Creates a connected fence/waiter pair.
pub fn completion_fence() -> (CompletionFence, FenceWaiter) {
    let (tx, rx) = channel::bounded(0);
    (CompletionFence { _signal: tx }, FenceWaiter { signal: rx })
}

impl FenceWaiter {
    pub fn is_signaled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Blocks until the fence is dropped.
    pub fn wait(&self) {
        while self.signal.recv().is_ok() {}
    }

    /// Returns true if the fence was dropped within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.signal.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}
