//! Multi-source mixer stage
//!
//! Key features:
//! - Float32 destination buffer of `max_dest_frame_count_per_mix` frames,
//!   allocated once at construction
//! - Per-source gain from shared `GainControl`s, with chunks subdivided at
//!   scheduled gain changes
//! - Source frames placed by sample-and-hold on the destination grid
//! - Inaudible chunks are skipped rather than returned as silence

use crate::gain::GainControl;
use crate::mix_kernels::{accumulate_scaled, scale_into};
use mix_core::{
    sample_to_f32, AddSourceOptions, AlignedBuffer, BoxedStage, ClockId, ClockSnapshots, Fixed,
    Format, GainControlId, ImplPacket, MixJobContext, PacketView, PipelineStage, SampleType,
    Stage, StageArgs, StageId, StageImpl, ThreadSlot, TimelineFunction,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct MixerStageArgs {
    pub name: String,
    /// Must be float.
    pub format: Format,
    pub reference_clock: ClockId,
    pub max_dest_frame_count_per_mix: i64,
}

impl MixerStageArgs {
    pub fn new(name: impl Into<String>, format: Format, max_dest_frame_count_per_mix: i64) -> Self {
        Self {
            name: name.into(),
            format,
            reference_clock: ClockId::MONOTONIC,
            max_dest_frame_count_per_mix,
        }
    }
}

impl Default for MixerStageArgs {
    fn default() -> Self {
        Self::new("mixer", Format::default(), 480)
    }
}

struct MixerSource {
    stage: BoxedStage,
    gain_ids: BTreeSet<GainControlId>,
}

/// A run of destination frames `[start, end)` within a chunk mixed at one scale
#[derive(Debug, Clone, Copy, PartialEq)]
struct GainRange {
    start: i64,
    end: i64,
    scale: f32,
}

/// Stage logic behind `MixerStage`
pub struct Mixer {
    name: String,
    format: Format,
    reference_clock: ClockId,
    timeline: Option<TimelineFunction>,
    sources: Vec<MixerSource>,
    gain_controls: BTreeMap<GainControlId, GainControl>,
    max_frames: i64,
    dest: AlignedBuffer,
    scratch: Vec<f32>,
    gain_cuts: Vec<i64>,
    gain_ranges: Vec<GainRange>,
}

pub type MixerStage = Stage<Mixer>;

impl Mixer {
    /// # Panics
    /// If `args.format` is not float or the chunk size is not positive.
    pub fn create(args: MixerStageArgs) -> MixerStage {
        assert!(args.format.is_float(), "mixer '{}' format must be float", args.name);
        assert!(
            args.max_dest_frame_count_per_mix > 0,
            "mixer '{}' needs a positive chunk size",
            args.name
        );
        let samples = args.max_dest_frame_count_per_mix as usize * args.format.channels();
        let mixer = Mixer {
            name: args.name.clone(),
            format: args.format,
            reference_clock: args.reference_clock,
            timeline: None,
            sources: Vec::new(),
            gain_controls: BTreeMap::new(),
            max_frames: args.max_dest_frame_count_per_mix,
            dest: AlignedBuffer::zeroed(args.format.bytes_for_frames(args.max_dest_frame_count_per_mix)),
            scratch: vec![0.0; samples],
            gain_cuts: Vec::new(),
            gain_ranges: Vec::new(),
        };
        let stage_args =
            StageArgs::new(args.name, args.format).with_reference_clock(args.reference_clock);
        Stage::new(stage_args, mixer)
    }

    /// Registers a gain control that sources may reference by id.
    ///
    /// # Panics
    /// If a control with the same id is already registered.
    pub fn add_gain_control(&mut self, control: GainControl) {
        let id = control.id();
        assert!(
            self.gain_controls.insert(id, control).is_none(),
            "mixer '{}' already has gain control {:?}",
            self.name,
            id
        );
    }

    pub fn remove_gain_control(&mut self, id: GainControlId) -> Option<GainControl> {
        self.gain_controls.remove(&id)
    }

    pub fn gain_control(&self, id: GainControlId) -> Option<&GainControl> {
        self.gain_controls.get(&id)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Mixes every source into `dest[..frames]`. Returns true if any source
    /// contributed audible data.
    fn mix_chunk(&mut self, ctx: &mut MixJobContext, chunk_start: Fixed, frames: i64) -> bool {
        let channels = self.format.channels();
        let dest = &mut self.dest.as_f32_mut()[..frames as usize * channels];
        dest.fill(0.0);

        let mut written = false;
        for source in self.sources.iter_mut() {
            prepare_source_gains(
                &self.gain_controls,
                &source.gain_ids,
                self.timeline,
                self.reference_clock,
                ctx.clocks(),
                chunk_start,
                frames,
                &mut self.gain_cuts,
                &mut self.gain_ranges,
            );

            let mut source_written = false;
            for range in &self.gain_ranges {
                if range.scale == 0.0 {
                    continue;
                }
                let src_start = source_frame(
                    self.timeline,
                    self.reference_clock,
                    source.stage.as_ref(),
                    ctx.clocks(),
                    chunk_start + range.start,
                );
                let sub_dest = &mut dest[range.start as usize * channels..range.end as usize * channels];
                source_written |= mix_source(
                    source.stage.as_mut(),
                    ctx,
                    sub_dest,
                    &mut self.scratch,
                    src_start,
                    range.scale,
                    !written,
                );
            }
            written |= source_written;
        }
        written
    }
}

/// Maps destination frame `dest_frame` onto `source`'s frame timeline.
///
/// Both timelines map reference time to frames; without both the frames are
/// taken to be equal.
fn source_frame(
    timeline: Option<TimelineFunction>,
    reference_clock: ClockId,
    source: &dyn PipelineStage,
    clocks: &ClockSnapshots,
    dest_frame: Fixed,
) -> Fixed {
    match (timeline, source.presentation_time_to_frac_frame()) {
        (Some(dest), Some(src)) => {
            let time = dest.apply_inverse(dest_frame.raw());
            let time = clocks.translate(reference_clock, source.reference_clock(), time);
            Fixed::from_raw(src.apply(time))
        }
        _ => dest_frame,
    }
}

/// Splits `[chunk_start, chunk_start + frames)` into ranges of constant
/// gain for a source using `gain_ids`, written to `ranges`.
#[allow(clippy::too_many_arguments)]
fn prepare_source_gains(
    controls: &BTreeMap<GainControlId, GainControl>,
    gain_ids: &BTreeSet<GainControlId>,
    timeline: Option<TimelineFunction>,
    reference_clock: ClockId,
    clocks: &ClockSnapshots,
    chunk_start: Fixed,
    frames: i64,
    cuts: &mut Vec<i64>,
    ranges: &mut Vec<GainRange>,
) {
    ranges.clear();
    let active = move || gain_ids.iter().filter_map(move |id| controls.get(id));

    let Some(tl) = timeline else {
        let scale = active().map(|c| c.state().scale()).product();
        ranges.push(GainRange {
            start: 0,
            end: frames,
            scale,
        });
        return;
    };

    let chunk_time = tl.apply_inverse(chunk_start.raw());
    let end_time = tl.apply_inverse((chunk_start + frames).raw());
    cuts.clear();
    for control in active() {
        let clock = control.reference_clock();
        let after = clocks.translate(reference_clock, clock, chunk_time);
        let before = clocks.translate(reference_clock, clock, end_time);
        for time in control.changes_between(after, before) {
            let time = clocks.translate(clock, reference_clock, time);
            let offset = (Fixed::from_raw(tl.apply(time)) - chunk_start).ceiling();
            if offset > 0 && offset < frames {
                cuts.push(offset);
            }
        }
    }
    cuts.sort_unstable();
    cuts.dedup();

    let mut start = 0;
    for end in cuts.iter().copied().chain(std::iter::once(frames)) {
        let time = tl.apply_inverse((chunk_start + start).raw());
        let scale = active()
            .map(|c| {
                let local = clocks.translate(reference_clock, c.reference_clock(), time);
                c.state_at(local).scale()
            })
            .product();
        ranges.push(GainRange { start, end, scale });
        start = end;
    }
}

/// Mixes `source` frames from `src_start` into `dest` at `scale`, writing
/// instead of accumulating when `overwrite` is set. Returns true if any
/// frame landed in `dest`.
fn mix_source(
    source: &mut dyn PipelineStage,
    ctx: &mut MixJobContext,
    dest: &mut [f32],
    scratch: &mut [f32],
    src_start: Fixed,
    scale: f32,
    overwrite: bool,
) -> bool {
    let format = source.format();
    let channels = format.channels();
    let frames = (dest.len() / channels) as i64;
    let src_end = src_start + frames;

    let mut position = match source.next_readable_frame() {
        Some(next) if next > src_start => next,
        _ => src_start,
    };
    let mut wrote = false;
    while position < src_end {
        let count = (src_end - position).floor();
        if count <= 0 {
            break;
        }
        let Some(packet) = source.read(ctx, position, count) else {
            break;
        };

        // Sample-and-hold: a frame at fractional p lands on ceil(p).
        let first_slot = (packet.start() - src_start).ceiling();
        let lo = (-first_slot).max(0);
        let hi = packet.length().min(frames - first_slot);
        if hi > lo {
            let bpf = format.bytes_per_frame();
            let payload = &packet.payload()[lo as usize * bpf..hi as usize * bpf];
            let out = &mut dest[(first_slot + lo) as usize * channels..(first_slot + hi) as usize * channels];
            let samples = load_samples(format.sample_type(), payload, scratch);
            if overwrite {
                scale_into(out, samples, scale);
            } else {
                accumulate_scaled(out, samples, scale);
            }
            wrote = true;
        }
        position = packet.end();
    }
    wrote
}

/// `payload` as float samples, converting through `scratch` unless it is
/// already aligned float data.
fn load_samples<'a>(sample_type: SampleType, payload: &'a [u8], scratch: &'a mut [f32]) -> &'a [f32] {
    if sample_type == SampleType::Float32 {
        if let Ok(samples) = bytemuck::try_cast_slice::<u8, f32>(payload) {
            return samples;
        }
    }
    let width = sample_type.bytes_per_sample();
    let count = payload.len() / width;
    for (out, bytes) in scratch[..count].iter_mut().zip(payload.chunks_exact(width)) {
        *out = sample_to_f32(sample_type, bytes);
    }
    &scratch[..count]
}

impl StageImpl for Mixer {
    fn drain_commands(&mut self) {
        for control in self.gain_controls.values_mut() {
            control.drain_commands();
        }
    }

    fn advance_self_impl(&mut self, _frame: Fixed) {}

    fn advance_sources_impl(&mut self, ctx: &mut MixJobContext, frame: Fixed) {
        if let Some(tl) = self.timeline {
            let time = tl.apply_inverse(frame.raw());
            for control in self.gain_controls.values_mut() {
                control.advance(ctx.clocks().translate(
                    self.reference_clock,
                    control.reference_clock(),
                    time,
                ));
            }
        }

        for source in self.sources.iter_mut() {
            let target = source_frame(
                self.timeline,
                self.reference_clock,
                source.stage.as_ref(),
                ctx.clocks(),
                frame,
            );
            source.stage.advance(ctx, target);
        }
    }

    fn read_impl(
        &mut self,
        ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<ImplPacket<'_>> {
        let end = start_frame + frame_count;
        let mut chunk_start = start_frame;
        loop {
            let frames = (end - chunk_start).floor().min(self.max_frames);
            if frames <= 0 {
                return None;
            }
            if self.mix_chunk(ctx, chunk_start, frames) {
                let bytes = self.format.bytes_for_frames(frames);
                return Some(ImplPacket::cached(PacketView::new(
                    self.format,
                    chunk_start,
                    frames,
                    &self.dest.as_bytes()[..bytes],
                )));
            }
            log::trace!("{}: chunk at {:?} inaudible", self.name, chunk_start);
            chunk_start = chunk_start + frames;
        }
    }

    fn cached_payload(&self) -> &[u8] {
        self.dest.as_bytes()
    }

    fn update_presentation_time_to_frac_frame(&mut self, f: Option<TimelineFunction>) {
        self.timeline = f;
    }

    fn add_source(&mut self, source: BoxedStage, options: AddSourceOptions) {
        assert!(
            !self.sources.iter().any(|s| s.stage.id() == source.id()),
            "mixer '{}' already has source '{}'",
            self.name,
            source.name()
        );
        let format = source.format();
        assert!(
            format.channels() == self.format.channels()
                && format.frames_per_second() == self.format.frames_per_second(),
            "mixer '{}' cannot mix source '{}' format {:?} into {:?}",
            self.name,
            source.name(),
            format,
            self.format
        );
        self.sources.push(MixerSource {
            stage: source,
            gain_ids: options.gain_ids,
        });
    }

    fn remove_source(&mut self, id: StageId) -> Option<BoxedStage> {
        let index = self.sources.iter().position(|s| s.stage.id() == id)?;
        Some(self.sources.remove(index).stage)
    }

    fn set_thread(&mut self, slot: &ThreadSlot) {
        for source in self.sources.iter_mut() {
            source.stage.set_thread(slot.clone());
        }
    }
}
