//! Per-mix-job context threaded through every `read` and `advance`

use crate::clock::ClockSnapshots;
use std::sync::Arc;
use std::time::Duration;

/// Cost of one named subtask (for example one out-of-process effect call)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubtaskMetrics {
    pub name: String,
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub queue_time: Duration,
    pub page_fault_count: u64,
    pub kernel_lock_contention_count: u64,
}

impl SubtaskMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds every counter of `other` into `self`.
    pub fn accumulate(&mut self, other: &SubtaskMetrics) {
        self.wall_time += other.wall_time;
        self.cpu_time += other.cpu_time;
        self.queue_time += other.queue_time;
        self.page_fault_count += other.page_fault_count;
        self.kernel_lock_contention_count += other.kernel_lock_contention_count;
    }
}

/// State shared by all stages during a single mix job
#[derive(Debug, Clone)]
pub struct MixJobContext {
    clocks: Arc<ClockSnapshots>,
    mono_start_time: i64,
    mono_deadline: i64,
    subtasks: Vec<SubtaskMetrics>,
}

impl MixJobContext {
    pub fn new(clocks: Arc<ClockSnapshots>, mono_start_time: i64, mono_deadline: i64) -> Self {
        Self {
            clocks,
            mono_start_time,
            mono_deadline,
            subtasks: Vec::new(),
        }
    }

    /// Context with only the monotonic clock and an unbounded deadline.
    pub fn for_testing() -> Self {
        Self::new(Arc::new(ClockSnapshots::new()), 0, i64::MAX)
    }

    pub fn clocks(&self) -> &ClockSnapshots {
        &self.clocks
    }

    pub fn mono_start_time(&self) -> i64 {
        self.mono_start_time
    }

    pub fn mono_deadline(&self) -> i64 {
        self.mono_deadline
    }

    /// Records `metrics`, merging with an earlier entry of the same name.
    pub fn add_subtask_metrics(&mut self, metrics: &SubtaskMetrics) {
        match self.subtasks.iter_mut().find(|m| m.name == metrics.name) {
            Some(existing) => existing.accumulate(metrics),
            None => self.subtasks.push(metrics.clone()),
        }
    }

    pub fn subtask_metrics(&self) -> &[SubtaskMetrics] {
        &self.subtasks
    }

    pub fn take_subtask_metrics(&mut self) -> Vec<SubtaskMetrics> {
        std::mem::take(&mut self.subtasks)
    }
}
