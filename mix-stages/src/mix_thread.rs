//! Periodic mix thread
//!
//! Drives a stage graph from a dedicated pipeline thread: every period it
//! reads `period_frames` from the root stage, advances it, and hands the
//! mixed block to the consumer over a bounded channel. A slow consumer loses
//! blocks rather than stalling the mix.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use mix_core::{
    sample_to_f32, BoxedStage, ClockSnapshots, Fixed, MixJobContext, PipelineStage,
    PipelineThread, ThreadSlot,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct MixThreadConfig {
    pub name: String,
    pub period_frames: i64,
    pub period: Duration,
    /// Core to pin the thread to, if any.
    pub cpu_core: Option<usize>,
    pub output_queue_depth: usize,
}

impl Default for MixThreadConfig {
    fn default() -> Self {
        Self {
            name: "mix".to_string(),
            period_frames: 480,
            period: Duration::from_millis(10),
            cpu_core: None,
            output_queue_depth: 4,
        }
    }
}

/// One period of mixed output, interleaved float samples
#[derive(Debug, Clone, PartialEq)]
pub struct MixBlock {
    pub start: Fixed,
    pub samples: Vec<f32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MixThreadStats {
    pub jobs: u64,
    pub dropped_blocks: u64,
}

/// A running mix thread
pub struct MixThread {
    running: Arc<AtomicBool>,
    jobs: Arc<AtomicU64>,
    dropped_blocks: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<BoxedStage>>,
}

impl MixThread {
    /// Starts mixing `root` from frame 0. The graph moves to the new thread
    /// and is handed back by `shutdown`.
    pub fn spawn(
        config: MixThreadConfig,
        root: BoxedStage,
        clocks: Arc<ClockSnapshots>,
    ) -> (MixThread, Receiver<MixBlock>) {
        let (tx, rx) = channel::bounded(config.output_queue_depth.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let jobs = Arc::new(AtomicU64::new(0));
        let dropped_blocks = Arc::new(AtomicU64::new(0));

        let thread_handle = Self::spawn_mix_thread(
            config,
            root,
            clocks,
            tx,
            running.clone(),
            jobs.clone(),
            dropped_blocks.clone(),
        );

        let mix_thread = MixThread {
            running,
            jobs,
            dropped_blocks,
            thread_handle: Some(thread_handle),
        };
        (mix_thread, rx)
    }

    pub fn stats(&self) -> MixThreadStats {
        MixThreadStats {
            jobs: self.jobs.load(Ordering::Relaxed),
            dropped_blocks: self.dropped_blocks.load(Ordering::Relaxed),
        }
    }

    fn spawn_mix_thread(
        config: MixThreadConfig,
        mut root: BoxedStage,
        clocks: Arc<ClockSnapshots>,
        tx: Sender<MixBlock>,
        running: Arc<AtomicBool>,
        jobs: Arc<AtomicU64>,
        dropped_blocks: Arc<AtomicU64>,
    ) -> JoinHandle<BoxedStage> {
        thread::Builder::new()
            .name(format!("mix-{}", config.name))
            .spawn(move || {
                if let Some(core) = config.cpu_core {
                    pin_to_core(core);
                }

                let slot = ThreadSlot::new();
                slot.set(Some(PipelineThread::current(config.name.clone())));
                root.set_thread(slot.clone());
                log::info!("Mix thread '{}' started", config.name);

                let epoch = Instant::now();
                let mut frame = Fixed::ZERO;
                let mut job: u32 = 0;
                while running.load(Ordering::Relaxed) {
                    let now = epoch.elapsed().as_nanos() as i64;
                    let mut ctx =
                        MixJobContext::new(clocks.clone(), now, now + config.period.as_nanos() as i64);

                    let samples = mix_period(root.as_mut(), &mut ctx, frame, config.period_frames);
                    let end = frame + config.period_frames;
                    root.advance(&mut ctx, end);

                    let metrics = ctx.take_subtask_metrics();
                    log::debug!(
                        "mix job at {:?}: {} subtasks, {:?} elapsed",
                        frame,
                        metrics.len(),
                        Duration::from_nanos((epoch.elapsed().as_nanos() as i64 - now) as u64)
                    );

                    match tx.try_send(MixBlock {
                        start: frame,
                        samples,
                    }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            dropped_blocks.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                    frame = end;
                    jobs.fetch_add(1, Ordering::Relaxed);

                    // Sleep until the next period boundary
                    job += 1;
                    let next = config.period * job;
                    let elapsed = epoch.elapsed();
                    if next > elapsed {
                        thread::sleep(next - elapsed);
                    }
                }

                slot.set(None);
                log::info!("Mix thread '{}' exiting", config.name);
                root
            })
            .expect("Failed to spawn mix thread")
    }

    /// Stops the thread and returns the root stage.
    pub fn shutdown(&mut self) -> Option<BoxedStage> {
        self.running.store(false, Ordering::Relaxed);

        self.thread_handle.take().and_then(|handle| handle.join().ok())
    }
}

impl Drop for MixThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if !pinned {
        log::warn!("Could not pin mix thread to core {}", core);
    }
}

/// Reads `[start, start + frames)` from `root` into interleaved floats,
/// leaving silence where the root has no data.
fn mix_period(
    root: &mut dyn PipelineStage,
    ctx: &mut MixJobContext,
    start: Fixed,
    frames: i64,
) -> Vec<f32> {
    let format = root.format();
    let channels = format.channels();
    let width = format.sample_type().bytes_per_sample();
    let mut samples = vec![0.0; frames as usize * channels];

    let end = start + frames;
    let mut position = start;
    while position < end {
        let count = (end - position).floor();
        if count <= 0 {
            break;
        }
        let Some(packet) = root.read(ctx, position, count) else {
            break;
        };
        let first = (packet.start() - start).ceiling().max(0) as usize * channels;
        for (out, bytes) in samples[first..]
            .iter_mut()
            .zip(packet.payload().chunks_exact(width))
        {
            *out = sample_to_f32(format.sample_type(), bytes);
        }
        position = packet.end();
    }
    samples
}
