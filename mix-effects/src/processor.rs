//! Synchronous effect processors
//!
//! `EffectProcessor` is the call boundary a `CustomStage` blocks on. The
//! provided implementation, `RemoteProcessor`, hosts an `EffectKernel` on its
//! own thread and exchanges requests over channels, mirroring a round trip to
//! an out-of-process effect.

use crate::config::{ProcessOptions, ProcessorConfig};
use crate::error::{ConfigError, ProcessError};
use crossbeam::channel::{self, Receiver, Sender};
use mix_core::{f32_samples, SubtaskMetrics};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// A processor reachable through one blocking `process` call
pub trait EffectProcessor: Send {
    fn config(&self) -> &ProcessorConfig;

    /// Processes `num_frames` frames from the input range into the output
    /// range. Returns one metrics entry per processor-internal stage.
    fn process(
        &mut self,
        num_frames: i64,
        options: &ProcessOptions,
    ) -> Result<Vec<SubtaskMetrics>, ProcessError>;
}

/// Signal-processing code run by a `RemoteProcessor`
///
/// `input` and `output` hold `num_frames` interleaved frames in the
/// negotiated input and output formats.
pub trait EffectKernel: Send + 'static {
    fn name(&self) -> &str;

    fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        num_frames: usize,
        options: &ProcessOptions,
    ) -> Result<(), ProcessError>;
}

struct ProcessRequest {
    num_frames: i64,
    options: ProcessOptions,
    sent_at: Instant,
}

type ProcessResponse = Result<Vec<SubtaskMetrics>, ProcessError>;

/// Effect processor running a kernel on a dedicated thread
pub struct RemoteProcessor {
    config: ProcessorConfig,
    requests: Option<Sender<ProcessRequest>>,
    responses: Receiver<ProcessResponse>,
    worker: Option<JoinHandle<()>>,
}

impl RemoteProcessor {
    /// Validates `config` and starts the worker thread.
    pub fn spawn(
        config: ProcessorConfig,
        kernel: Box<dyn EffectKernel>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        // One call in flight at a time.
        let (request_tx, request_rx) = channel::bounded::<ProcessRequest>(1);
        let (response_tx, response_rx) = channel::bounded::<ProcessResponse>(1);

        let worker_config = config.clone();
        let worker = thread::Builder::new()
            .name(format!("effect-{}", kernel.name()))
            .spawn(move || Self::run_worker(worker_config, kernel, request_rx, response_tx))
            .expect("Failed to spawn effect processor thread");

        Ok(Self {
            config,
            requests: Some(request_tx),
            responses: response_rx,
            worker: Some(worker),
        })
    }

    fn run_worker(
        config: ProcessorConfig,
        mut kernel: Box<dyn EffectKernel>,
        requests: Receiver<ProcessRequest>,
        responses: Sender<ProcessResponse>,
    ) {
        let in_channels = config.input_format.channels();
        let out_channels = config.output_format.channels();
        let max_frames = config.max_frames_per_call as usize;
        let mut input = Vec::with_capacity(max_frames * in_channels);
        let mut output = vec![0.0f32; max_frames * out_channels];

        for request in requests.iter() {
            let queue_time = request.sent_at.elapsed();
            let started = Instant::now();
            let frames = request.num_frames as usize;

            input.clear();
            {
                let memory = config.input.memory.lock();
                let bytes = config.input_format.bytes_for_frames(request.num_frames);
                let first = config.input.offset;
                input.extend(f32_samples(&memory.as_bytes()[first..first + bytes]));
            }

            let out = &mut output[..frames * out_channels];
            out.fill(0.0);
            let compute_started = Instant::now();
            let result = kernel.process(&input, out, frames, &request.options);
            let cpu_time = compute_started.elapsed();

            let response = result.map(|()| {
                let mut memory = config.output.memory.lock();
                let first = config.output.offset;
                let bytes: &[u8] = bytemuck::cast_slice(&*out);
                memory.as_bytes_mut()[first..first + bytes.len()].copy_from_slice(bytes);

                let mut metrics = SubtaskMetrics::new(kernel.name());
                metrics.wall_time = started.elapsed();
                metrics.cpu_time = cpu_time;
                metrics.queue_time = queue_time;
                vec![metrics]
            });

            if responses.send(response).is_err() {
                break;
            }
        }

        log::info!("Effect processor thread '{}' exiting", kernel.name());
    }

    /// Stops the worker thread. Further calls fail with `Disconnected`.
    pub fn shutdown(&mut self) {
        self.requests.take();
        if let Some(handle) = self.worker.take() {
            handle.join().ok();
        }
    }
}

impl EffectProcessor for RemoteProcessor {
    fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn process(
        &mut self,
        num_frames: i64,
        options: &ProcessOptions,
    ) -> Result<Vec<SubtaskMetrics>, ProcessError> {
        if num_frames <= 0 || num_frames > self.config.max_frames_per_call {
            return Err(ProcessError::InvalidFrameCount {
                frames: num_frames,
                max_frames_per_call: self.config.max_frames_per_call,
            });
        }
        let requests = self.requests.as_ref().ok_or(ProcessError::Disconnected)?;
        requests
            .send(ProcessRequest {
                num_frames,
                options: options.clone(),
                sent_at: Instant::now(),
            })
            .map_err(|_| ProcessError::Disconnected)?;
        self.responses.recv().map_err(|_| ProcessError::Disconnected)?
    }
}

impl Drop for RemoteProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
