//! Effect stage: one source run through a synchronous effect processor
//!
//! The source is wrapped in a `SilencePaddingStage` so the effect always sees
//! `latency_frames + ring_out_frames` of silence after its input ends and can
//! flush its tail. Input is fed `latency_frames` ahead of output, and the
//! first `latency_frames` output frames after any discontinuity are dropped,
//! so output frame `f` lines up with input frame `f`.

use crate::error::CustomStageError;
use crate::silence_padding::{SilencePadding, SilencePaddingStage, SilencePaddingStageArgs};
use mix_core::{
    AddSourceOptions, AlignedBuffer, BoxedStage, ClockId, Fixed, Format, ImplPacket,
    MixJobContext, PacketView, PipelineStage, Stage, StageArgs, StageId, StageImpl,
    SubtaskMetrics, ThreadSlot, TimelineFunction,
};
use mix_effects::{BufferRange, EffectProcessor, ProcessOptions};
use std::time::Instant;

pub struct CustomStageArgs {
    pub name: String,
    pub reference_clock: ClockId,
    pub processor: Box<dyn EffectProcessor>,
}

impl CustomStageArgs {
    pub fn new(name: impl Into<String>, processor: Box<dyn EffectProcessor>) -> Self {
        Self {
            name: name.into(),
            reference_clock: ClockId::MONOTONIC,
            processor,
        }
    }
}

/// Stage logic behind `CustomStage`
pub struct Custom {
    name: String,
    processor: Box<dyn EffectProcessor>,
    source: SilencePaddingStage,
    input: BufferRange,
    output: BufferRange,
    input_format: Format,
    output_format: Format,
    block_size_frames: i64,
    max_frames_per_call: i64,
    latency_frames: i64,
    /// Genuine output of the last process call.
    output_cache: AlignedBuffer,
    /// Input frames before this have been sent to the processor.
    next_frame_to_process: Option<i64>,
    /// How much of the processor's latency the current run has absorbed.
    latency_frames_processed: i64,
}

pub type CustomStage = Stage<Custom>;

impl Custom {
    pub fn create(args: CustomStageArgs) -> Result<CustomStage, CustomStageError> {
        let config = args.processor.config().clone();
        config.validate()?;

        let mut padding_args = SilencePaddingStageArgs::new(
            format!("{}.padding", args.name),
            config.input_format,
            Fixed::from_frames(config.latency_frames + config.ring_out_frames),
        );
        // Input frames are placed by sample-and-hold; overlap rather than gap.
        padding_args.round_down_fractional_frames = false;

        let custom = Custom {
            name: args.name.clone(),
            source: SilencePadding::create(padding_args),
            input: config.input.clone(),
            output: config.output.clone(),
            input_format: config.input_format,
            output_format: config.output_format,
            block_size_frames: config.block_size_frames,
            max_frames_per_call: config.max_frames_per_call,
            latency_frames: config.latency_frames,
            output_cache: AlignedBuffer::zeroed(
                config.output_format.bytes_for_frames(config.max_frames_per_call),
            ),
            next_frame_to_process: None,
            latency_frames_processed: 0,
            processor: args.processor,
        };
        let stage_args = StageArgs::new(args.name, config.output_format)
            .with_reference_clock(args.reference_clock);
        Ok(Stage::new(stage_args, custom))
    }

    /// Checks that `source` can feed this stage before calling `add_source`.
    pub fn check_source(&self, source: &dyn PipelineStage) -> Result<(), CustomStageError> {
        if source.format() != self.input_format {
            return Err(CustomStageError::SourceFormatMismatch {
                source_format: source.format(),
                input: self.input_format,
            });
        }
        Ok(())
    }

    pub fn latency_frames_processed(&self) -> i64 {
        self.latency_frames_processed
    }

    pub fn next_frame_to_process(&self) -> Option<i64> {
        self.next_frame_to_process
    }

    /// First output frame not yet produced.
    fn next_dest_frame(&self) -> Option<i64> {
        self.next_frame_to_process
            .map(|next| next - self.latency_frames_processed)
    }

    /// Copies padded source frames `[first, first + frames)` into the
    /// processor input, zero-filling gaps. Returns false if the source had
    /// no data at all.
    fn fill_input(&mut self, ctx: &mut MixJobContext, first: i64, frames: i64) -> bool {
        let bpf = self.input_format.bytes_per_frame();
        let mut memory = self.input.memory.lock();
        let input = &mut memory.as_bytes_mut()[self.input.offset..][..frames as usize * bpf];
        input.fill(0);

        let base = Fixed::from_frames(first);
        let end = base + frames;
        let mut position = base;
        let mut has_data = false;
        while position < end {
            let count = (end - position).floor();
            if count <= 0 {
                break;
            }
            let Some(packet) = self.source.read(ctx, position, count) else {
                break;
            };
            has_data = true;
            let payload = packet.payload();
            for i in 0..packet.length() {
                // Sample-and-hold: a frame at fractional p lands on ceil(p).
                let slot = (packet.start() + i - base).ceiling();
                if (0..frames).contains(&slot) {
                    let src = i as usize * bpf;
                    let dst = slot as usize * bpf;
                    input[dst..dst + bpf].copy_from_slice(&payload[src..src + bpf]);
                }
            }
            position = packet.end();
        }
        has_data
    }

    /// Runs one process call over `frames` input frames. On failure the
    /// output is silence.
    fn process(&mut self, ctx: &mut MixJobContext, frames: i64) {
        let started = Instant::now();
        match self.processor.process(frames, &ProcessOptions::default()) {
            Ok(metrics) => {
                for m in &metrics {
                    ctx.add_subtask_metrics(m);
                }
                let mut call = SubtaskMetrics::new(format!("{}.process", self.name));
                call.wall_time = started.elapsed();
                ctx.add_subtask_metrics(&call);
            }
            Err(err) => {
                log::warn!("{}: effect failed, substituting silence: {}", self.name, err);
                let bytes = self.output_format.bytes_for_frames(frames);
                let mut memory = self.output.memory.lock();
                memory.as_bytes_mut()[self.output.offset..][..bytes].fill(0);
            }
        }
    }
}

impl StageImpl for Custom {
    fn advance_self_impl(&mut self, frame: Fixed) {
        let frame = frame.floor();
        let Some(next_dest) = self.next_dest_frame() else {
            return;
        };
        if frame > next_dest {
            // Input continuity is lost; the latency has to be absorbed again.
            let skipped = frame - next_dest;
            self.latency_frames_processed = (self.latency_frames_processed - skipped).max(0);
            self.next_frame_to_process = Some(frame + self.latency_frames_processed);
        }
    }

    fn advance_sources_impl(&mut self, ctx: &mut MixJobContext, frame: Fixed) {
        let processed = self
            .next_frame_to_process
            .map_or(frame, Fixed::from_frames)
            .max(frame);
        self.source.advance(ctx, processed);
    }

    fn read_impl(
        &mut self,
        ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<ImplPacket<'_>> {
        let first = start_frame.floor();
        let end = (start_frame + frame_count).floor();
        if self.next_frame_to_process.is_none() {
            self.next_frame_to_process = Some(first);
            self.latency_frames_processed = 0;
        }

        loop {
            let next_frame = self.next_frame_to_process.unwrap_or(first);
            let next_dest = next_frame - self.latency_frames_processed;
            if next_dest >= end {
                return None;
            }

            let latency_left = self.latency_frames - self.latency_frames_processed;
            let wanted = end - next_dest + latency_left;
            let blocks = (wanted + self.block_size_frames - 1) / self.block_size_frames;
            let frames = (blocks * self.block_size_frames).min(self.max_frames_per_call);

            if !self.fill_input(ctx, next_frame, frames) {
                // The padded source is past this span, so the processor's
                // tail has rung out. Output restarts after the span and must
                // absorb the latency again.
                self.next_frame_to_process = Some(next_frame + frames);
                self.latency_frames_processed = 0;
                continue;
            }
            self.process(ctx, frames);

            let latency_this_call = frames.min(latency_left);
            self.latency_frames_processed += latency_this_call;
            self.next_frame_to_process = Some(next_frame + frames);
            let genuine = frames - latency_this_call;
            if genuine == 0 {
                continue;
            }

            let bpf = self.output_format.bytes_per_frame();
            let bytes = genuine as usize * bpf;
            {
                let memory = self.output.memory.lock();
                let skip = self.output.offset + latency_this_call as usize * bpf;
                self.output_cache.as_bytes_mut()[..bytes]
                    .copy_from_slice(&memory.as_bytes()[skip..skip + bytes]);
            }
            return Some(ImplPacket::cached(PacketView::new(
                self.output_format,
                Fixed::from_frames(next_dest),
                genuine,
                &self.output_cache.as_bytes()[..bytes],
            )));
        }
    }

    fn cached_payload(&self) -> &[u8] {
        self.output_cache.as_bytes()
    }

    fn update_presentation_time_to_frac_frame(&mut self, f: Option<TimelineFunction>) {
        self.source.update_presentation_time_to_frac_frame(f);
    }

    fn add_source(&mut self, source: BoxedStage, options: AddSourceOptions) {
        if let Err(err) = self.check_source(source.as_ref()) {
            panic!("{}: {}", self.name, err);
        }
        self.source.add_source(source, options);
    }

    fn remove_source(&mut self, id: StageId) -> Option<BoxedStage> {
        self.source.remove_source(id)
    }

    fn set_thread(&mut self, slot: &ThreadSlot) {
        self.source.set_thread(slot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_stage, ramp, samples};
    use mix_effects::{
        DelayKernel, EffectKernel, GainKernel, ProcessError, ProcessorConfig, RemoteProcessor,
    };

    fn mono() -> Format {
        Format::float(1, 48_000)
    }

    fn custom_stage(
        config: ProcessorConfig,
        kernel: Box<dyn EffectKernel>,
        packets: Vec<(Fixed, Vec<f32>)>,
    ) -> CustomStage {
        let processor = RemoteProcessor::spawn(config, kernel).unwrap();
        let mut stage = Custom::create(CustomStageArgs::new("effect", Box::new(processor))).unwrap();
        let (source, _probe) = fake_stage(mono(), packets);
        stage.add_source(source, AddSourceOptions::default());
        stage
    }

    /// Reads `[0, frames)` packet by packet, filling absent frames with NaN.
    fn collect(stage: &mut CustomStage, ctx: &mut MixJobContext, frames: i64) -> Vec<f32> {
        let mut out = vec![f32::NAN; frames as usize];
        let mut position = Fixed::ZERO;
        while position < Fixed::from_frames(frames) {
            let count = (Fixed::from_frames(frames) - position).floor();
            match stage.read(ctx, position, count) {
                Some(packet) => {
                    let first = packet.start().floor() as usize;
                    for (i, s) in samples(packet.payload()).into_iter().enumerate() {
                        out[first + i] = s;
                    }
                    position = packet.end();
                }
                None => break,
            }
        }
        out
    }

    #[test]
    fn test_passthrough_without_latency() {
        let mut ctx = MixJobContext::for_testing();
        let config = ProcessorConfig::with_buffers(mono(), mono(), 4, 16);
        let mut stage = custom_stage(
            config,
            Box::new(GainKernel::new(1, 2.0)),
            vec![(Fixed::ZERO, ramp(1.0, 32))],
        );

        let out = collect(&mut stage, &mut ctx, 32);
        let expected: Vec<f32> = ramp(1.0, 32).iter().map(|s| s * 2.0).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_latency_is_compensated() {
        let mut ctx = MixJobContext::for_testing();
        let latency = 5;
        let config = ProcessorConfig::with_buffers(mono(), mono(), 4, 16).with_latency(latency);
        let mut stage = custom_stage(
            config,
            Box::new(DelayKernel::new(1, latency as usize)),
            vec![(Fixed::ZERO, ramp(1.0, 40))],
        );

        let out = collect(&mut stage, &mut ctx, 40);
        assert_eq!(out, ramp(1.0, 40), "output frame f must carry input frame f");
        assert_eq!(stage.inner().latency_frames_processed(), latency);
    }

    #[test]
    fn test_first_output_not_before_latency() {
        let mut ctx = MixJobContext::for_testing();
        let latency = 6;
        let config = ProcessorConfig::with_buffers(mono(), mono(), 4, 4).with_latency(latency);
        let mut stage = custom_stage(
            config,
            Box::new(DelayKernel::new(1, latency as usize)),
            vec![(Fixed::ZERO, ramp(1.0, 20))],
        );

        // 4-frame calls: the first call is pure latency, the second yields
        // two genuine frames.
        let packet = stage.read(&mut ctx, Fixed::ZERO, 4).unwrap();
        assert_eq!(packet.start(), Fixed::ZERO);
        assert_eq!(packet.length(), 2);
        assert_eq!(samples(packet.payload()), vec![1.0, 2.0]);
        drop(packet);
        assert_eq!(stage.inner().next_frame_to_process(), Some(8));
    }

    #[test]
    fn test_ring_out_after_input_ends() {
        let mut ctx = MixJobContext::for_testing();
        let latency = 3;
        let config = ProcessorConfig::with_buffers(mono(), mono(), 1, 8)
            .with_latency(latency)
            .with_ring_out(2);
        let mut stage = custom_stage(
            config,
            Box::new(DelayKernel::new(1, latency as usize)),
            vec![(Fixed::ZERO, ramp(1.0, 8))],
        );

        let out = collect(&mut stage, &mut ctx, 20);
        assert_eq!(&out[..8], &ramp(1.0, 8)[..]);
        // Ring-out: the padding supplies latency + ring_out frames of silence.
        assert!(out[8..10].iter().all(|s| *s == 0.0));
        assert!(out[13..].iter().all(|s| s.is_nan()), "nothing after the ring-out");
    }

    struct FailingKernel;

    impl EffectKernel for FailingKernel {
        fn name(&self) -> &str {
            "failing"
        }

        fn process(
            &mut self,
            _input: &[f32],
            _output: &mut [f32],
            _num_frames: usize,
            _options: &ProcessOptions,
        ) -> Result<(), ProcessError> {
            Err(ProcessError::Kernel("unavailable".to_string()))
        }
    }

    #[test]
    fn test_failure_substitutes_silence() {
        let mut ctx = MixJobContext::for_testing();
        let config = ProcessorConfig::in_place(mono(), 4, 8);
        let mut stage = custom_stage(config, Box::new(FailingKernel), vec![(Fixed::ZERO, ramp(1.0, 8))]);

        let packet = stage.read(&mut ctx, Fixed::ZERO, 8).unwrap();
        assert!(
            samples(packet.payload()).iter().all(|s| *s == 0.0),
            "in-place input must not leak through on failure"
        );
        drop(packet);
        assert!(ctx.subtask_metrics().is_empty(), "metrics only on success");
    }

    #[test]
    fn test_metrics_recorded() {
        let mut ctx = MixJobContext::for_testing();
        let config = ProcessorConfig::with_buffers(mono(), mono(), 4, 4);
        let mut stage = custom_stage(
            config,
            Box::new(GainKernel::new(1, 1.0)),
            vec![(Fixed::ZERO, ramp(1.0, 8))],
        );

        drop(stage.read(&mut ctx, Fixed::ZERO, 4));
        drop(stage.read(&mut ctx, Fixed::from_frames(4), 4));
        let names: Vec<_> = ctx.subtask_metrics().iter().map(|m| m.name.clone()).collect();
        assert_eq!(names, vec!["gain".to_string(), "effect.process".to_string()]);
    }

    #[test]
    fn test_no_source_data_skips_processing() {
        let mut ctx = MixJobContext::for_testing();
        let config = ProcessorConfig::with_buffers(mono(), mono(), 4, 8);
        let mut stage = custom_stage(config, Box::new(GainKernel::new(1, 1.0)), vec![]);

        assert!(stage.read(&mut ctx, Fixed::ZERO, 8).is_none());
        assert!(ctx.subtask_metrics().is_empty());
    }

    #[test]
    fn test_skip_reduces_absorbed_latency() {
        let mut ctx = MixJobContext::for_testing();
        let latency = 4;
        let config = ProcessorConfig::with_buffers(mono(), mono(), 4, 8).with_latency(latency);
        let mut stage = custom_stage(
            config,
            Box::new(DelayKernel::new(1, latency as usize)),
            vec![(Fixed::ZERO, ramp(1.0, 100))],
        );

        drop(stage.read(&mut ctx, Fixed::ZERO, 4));
        assert_eq!(stage.inner().latency_frames_processed(), 4);
        assert_eq!(stage.inner().next_frame_to_process(), Some(8));

        // Output so far ends at 4; jumping to 6 skips two frames.
        stage.advance(&mut ctx, Fixed::from_frames(6));
        assert_eq!(stage.inner().latency_frames_processed(), 2);
        assert_eq!(stage.inner().next_frame_to_process(), Some(8));
    }

    #[test]
    fn test_unaligned_reads_across_gap() {
        let mut ctx = MixJobContext::for_testing();
        let config = ProcessorConfig::with_buffers(mono(), mono(), 4, 16);
        let mut stage = custom_stage(
            config,
            Box::new(GainKernel::new(1, 1.0)),
            vec![(Fixed::from_frames(100), ramp(1.0, 10))],
        );

        // Each empty read processes a whole block ahead of the request.
        assert!(stage.read(&mut ctx, Fixed::ZERO, 1).is_none());
        assert_eq!(stage.inner().next_frame_to_process(), Some(4));
        assert!(stage.read(&mut ctx, Fixed::from_frames(1), 1).is_none());
        assert!(stage.read(&mut ctx, Fixed::from_frames(2), 97).is_none());

        let packet = stage.read(&mut ctx, Fixed::from_frames(99), 5).unwrap();
        assert_eq!(packet.start(), Fixed::from_frames(100), "first frame with data");
        assert_eq!(samples(packet.payload()), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_random_reads_over_gaps() {
        use rand::{Rng, SeedableRng};

        // Frame f of every data run carries the value f + 1.
        let runs = [(10, 20), (55, 15), (121, 5), (300, 40)];
        let input_at = |frame: i64| {
            runs.iter()
                .find(|(start, len)| (*start..*start + *len).contains(&frame))
                .map_or(0.0, |_| frame as f32 + 1.0)
        };

        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for (block, max, latency) in [(1, 4, 0), (4, 16, 3), (8, 8, 5), (3, 12, 7)] {
            let mut ctx = MixJobContext::for_testing();
            let config = ProcessorConfig::with_buffers(mono(), mono(), block, max)
                .with_latency(latency)
                .with_ring_out(2);
            let packets = runs
                .iter()
                .map(|(start, len)| {
                    (Fixed::from_frames(*start), ramp(*start as f32 + 1.0, *len as usize))
                })
                .collect();
            let mut stage = custom_stage(
                config,
                Box::new(DelayKernel::new(1, latency as usize)),
                packets,
            );

            let mut position = Fixed::ZERO;
            while position < Fixed::from_frames(400) {
                if rng.gen_bool(0.15) {
                    position = position + rng.gen_range(0..20);
                    stage.advance(&mut ctx, position);
                    continue;
                }
                let count = rng.gen_range(1..30);
                match stage.read(&mut ctx, position, count) {
                    Some(packet) => {
                        assert!(
                            packet.start() > position - 1
                                && packet.end() <= position + count
                                && packet.length() <= count,
                            "packet [{:?}, {:?}) outside request [{:?}, +{})",
                            packet.start(),
                            packet.end(),
                            position,
                            count
                        );
                        let first = packet.start().floor();
                        for (i, s) in samples(packet.payload()).into_iter().enumerate() {
                            let frame = first + i as i64;
                            assert_eq!(
                                s,
                                input_at(frame),
                                "block {} latency {}: frame {} misaligned",
                                block,
                                latency,
                                frame
                            );
                        }
                        position = packet.end();
                    }
                    None => position = position + count,
                }
            }
        }
    }

    #[test]
    fn test_format_mismatch_rejected() {
        let config = ProcessorConfig::with_buffers(mono(), mono(), 4, 8);
        let processor = RemoteProcessor::spawn(config, Box::new(GainKernel::new(1, 1.0))).unwrap();
        let stage = Custom::create(CustomStageArgs::new("effect", Box::new(processor))).unwrap();
        let (source, _probe) = fake_stage(Format::float(2, 48_000), vec![]);
        assert!(matches!(
            stage.inner().check_source(source.as_ref()),
            Err(CustomStageError::SourceFormatMismatch { .. })
        ));
    }
}
