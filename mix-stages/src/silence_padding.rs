//! Silence padding after each run of source data
//!
//! Downstream processors such as filters keep producing output after their
//! input ends. This stage inserts up to `silence_frame_count` frames of
//! silence after every discontinuity in its source so that such a processor
//! can "ring out", then goes quiet (`None`) until the source has data again.

use mix_core::{
    AddSourceOptions, BoxedStage, Fixed, Format, ImplPacket, MixJobContext, PacketView,
    PipelineStage, Stage, StageArgs, StageId, StageImpl, ThreadSlot, TimelineFunction,
};

#[derive(Debug, Clone)]
pub struct SilencePaddingStageArgs {
    pub name: String,
    pub format: Format,
    /// Rounded up to whole frames.
    pub silence_frame_count: Fixed,
    /// When the gap before the next packet is fractional, emit `floor(gap)`
    /// frames (leaving a sub-frame gap) instead of `ceil(gap)` frames (which
    /// may overlap the next packet, as sample-and-hold consumers need).
    pub round_down_fractional_frames: bool,
}

impl SilencePaddingStageArgs {
    pub fn new(name: impl Into<String>, format: Format, silence_frame_count: Fixed) -> Self {
        Self {
            name: name.into(),
            format,
            silence_frame_count,
            round_down_fractional_frames: false,
        }
    }
}

/// Stage logic behind `SilencePaddingStage`
pub struct SilencePadding {
    format: Format,
    source: Option<BoxedStage>,
    silence_frame_count: i64,
    round_down: bool,
    silence: Vec<u8>,
    /// End of the last non-silent packet returned.
    last_data_frame: Option<Fixed>,
}

pub type SilencePaddingStage = Stage<SilencePadding>;

impl SilencePadding {
    pub fn create(args: SilencePaddingStageArgs) -> SilencePaddingStage {
        let silence_frame_count = args.silence_frame_count.ceiling().max(0);
        let silence = vec![
            args.format.sample_type().silence_byte();
            args.format.bytes_for_frames(silence_frame_count)
        ];
        let padding = SilencePadding {
            format: args.format,
            source: None,
            silence_frame_count,
            round_down: args.round_down_fractional_frames,
            silence,
            last_data_frame: None,
        };
        Stage::new(StageArgs::new(args.name, args.format), padding)
    }

    pub fn silence_frame_count(&self) -> i64 {
        self.silence_frame_count
    }

    pub fn source(&self) -> Option<&dyn PipelineStage> {
        self.source.as_deref()
    }
}

/// Frames of silence to emit after `last_data`, given where the next packet
/// (if any) starts.
fn silence_frames(
    last_data: Fixed,
    next_start: Option<Fixed>,
    silence_frame_count: i64,
    round_down: bool,
) -> i64 {
    let gap = match next_start {
        Some(next) => next - last_data,
        None => return silence_frame_count,
    };
    let frames = if round_down { gap.floor() } else { gap.ceiling() };
    frames.clamp(0, silence_frame_count)
}

impl StageImpl for SilencePadding {
    fn advance_self_impl(&mut self, frame: Fixed) {
        if let Some(last) = self.last_data_frame {
            if frame >= last + self.silence_frame_count {
                self.last_data_frame = None;
            }
        }
    }

    fn advance_sources_impl(&mut self, ctx: &mut MixJobContext, frame: Fixed) {
        if let Some(source) = self.source.as_mut() {
            source.advance(ctx, frame);
        }
    }

    fn read_impl(
        &mut self,
        ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<ImplPacket<'_>> {
        let end = start_frame + frame_count;

        // Skip ahead if the source already moved past the request start.
        let source_start = match self.source.as_ref()?.next_readable_frame() {
            Some(next) if next > start_frame => next,
            _ => start_frame,
        };
        let source_count = (end - source_start).floor();
        let next = match self.source.as_mut() {
            Some(source) if source_count > 0 => source.read(ctx, source_start, source_count),
            _ => None,
        };

        if let Some(last_data) = self.last_data_frame {
            let frames = silence_frames(
                last_data,
                next.as_ref().map(|p| p.start()),
                self.silence_frame_count,
                self.round_down,
            );
            if frames > 0 {
                let silence = PacketView::new(
                    self.format,
                    last_data,
                    frames,
                    &self.silence[..self.format.bytes_for_frames(frames)],
                );
                if silence.intersection_with(start_frame, frame_count).is_some() {
                    if let Some(mut packet) = next {
                        // Hand the real packet out again on the next read.
                        packet.set_frames_consumed(0);
                    }
                    return Some(ImplPacket::cached(silence));
                }
            }
        }

        let packet = next?;
        self.last_data_frame = Some(packet.end());
        Some(ImplPacket::forward(packet, None))
    }

    fn cached_payload(&self) -> &[u8] {
        &self.silence
    }

    fn update_presentation_time_to_frac_frame(&mut self, f: Option<TimelineFunction>) {
        if let Some(source) = self.source.as_mut() {
            source.update_presentation_time_to_frac_frame(f);
        }
    }

    fn add_source(&mut self, source: BoxedStage, _options: AddSourceOptions) {
        assert!(
            self.source.is_none(),
            "silence padding already has source '{}'",
            self.source.as_ref().map_or("", |s| s.name())
        );
        assert_eq!(
            source.format(),
            self.format,
            "source '{}' format does not match silence padding",
            source.name()
        );
        self.source = Some(source);
    }

    fn remove_source(&mut self, id: StageId) -> Option<BoxedStage> {
        if self.source.as_ref()?.id() != id {
            return None;
        }
        self.last_data_frame = None;
        self.source.take()
    }

    fn set_thread(&mut self, slot: &ThreadSlot) {
        if let Some(source) = self.source.as_mut() {
            source.set_thread(slot.clone());
        }
    }
}
