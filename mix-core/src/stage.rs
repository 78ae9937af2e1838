//! The pipeline-stage protocol
//!
//! Every stage obeys the same contract:
//!
//! * `read(ctx, start, count)` returns at most one packet whose frames lie in
//!   `(start - 1, start + count]`. The stage is borrowed by the packet until it
//!   is dropped, so a second `read`/`advance` while a packet is outstanding
//!   does not compile.
//! * Frame positions never move backward. A `read` before the stage's next
//!   readable frame is a fatal error.
//! * Dropping a packet advances the stage past the consumed frames.
//! * `advance(ctx, frame)` promises that frames before `frame` will never be
//!   requested again and lets the stage and its sources release state.
//!
//! Concrete stages implement `StageImpl`; `Stage<S>` wraps an implementation
//! with the shared bookkeeping (position, packet cache, release slot, thread
//! check) and exposes it as a `PipelineStage`.

use crate::clock::ClockId;
use crate::context::MixJobContext;
use crate::fixed::Fixed;
use crate::format::Format;
use crate::packet::{Packet, PacketView, ReleaseSlot};
use crate::thread::ThreadSlot;
use crate::timeline::TimelineFunction;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a stage instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(u64);

impl StageId {
    pub fn next() -> Self {
        StageId(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of a shared gain control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GainControlId(pub u64);

/// Per-edge options for `add_source`
#[derive(Debug, Clone, Default)]
pub struct AddSourceOptions {
    /// Gain controls applied to the source's samples (mixer only).
    pub gain_ids: BTreeSet<GainControlId>,
}

pub type BoxedStage = Box<dyn PipelineStage>;

/// Object-safe interface shared by every stage variant
pub trait PipelineStage: Send {
    fn id(&self) -> StageId;
    fn name(&self) -> &str;
    fn format(&self) -> Format;
    fn reference_clock(&self) -> ClockId;

    /// First frame that may still be read, or `None` before the first call.
    fn next_readable_frame(&self) -> Option<Fixed>;

    fn presentation_time_to_frac_frame(&self) -> Option<TimelineFunction>;

    /// Sets or clears (`None` = stopped) this stage's timeline.
    fn update_presentation_time_to_frac_frame(&mut self, f: Option<TimelineFunction>);

    fn read(
        &mut self,
        ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<Packet<'_>>;

    fn advance(&mut self, ctx: &mut MixJobContext, frame: Fixed);

    /// # Panics
    /// If the stage does not accept another source or `source` is already attached.
    fn add_source(&mut self, source: BoxedStage, options: AddSourceOptions);

    fn remove_source(&mut self, id: StageId) -> Option<BoxedStage>;

    /// Moves this stage (and its sources) onto the thread held by `slot`.
    fn set_thread(&mut self, slot: ThreadSlot);
}

/// A packet produced by `StageImpl::read_impl`
pub enum ImplPacket<'a> {
    /// Payload owned by the stage, valid until the stage advances past its
    /// end. Later reads inside the range are served from
    /// `StageImpl::cached_payload` without calling `read_impl`.
    Cached(PacketView<'a>),
    /// Payload valid only until the returned packet is dropped.
    Uncached(Packet<'a>),
}

impl<'a> ImplPacket<'a> {
    /// The view may extend past the request; only the intersection is
    /// returned but the whole range is cached.
    pub fn cached(view: PacketView<'a>) -> Self {
        ImplPacket::Cached(view)
    }

    pub fn uncached(view: PacketView<'a>) -> Self {
        ImplPacket::Uncached(Packet::new(view))
    }

    /// Passes a source packet through, optionally re-aligning its start
    /// (sample-and-hold). The source is released by however many frames the
    /// caller consumes.
    pub fn forward(packet: Packet<'a>, start: Option<Fixed>) -> Self {
        ImplPacket::Uncached(packet.forward(start, None))
    }

    /// Like `forward`, keeping only the first `length` frames.
    pub fn forward_truncated(packet: Packet<'a>, start: Option<Fixed>, length: i64) -> Self {
        ImplPacket::Uncached(packet.forward(start, Some(length)))
    }
}

/// Stage-specific behavior plugged into `Stage<S>`
pub trait StageImpl: Send {
    /// Drains cross-thread command queues. Runs first in every `read` and `advance`.
    fn drain_commands(&mut self) {}

    /// Releases local state for frames before `frame`.
    fn advance_self_impl(&mut self, frame: Fixed);

    /// Propagates `advance` to sources.
    fn advance_sources_impl(&mut self, ctx: &mut MixJobContext, frame: Fixed);

    /// Produces data for `[start_frame, start_frame + frame_count)`, or
    /// `None` if there is none. Never called while a cached packet overlaps
    /// `start_frame`.
    fn read_impl(
        &mut self,
        ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<ImplPacket<'_>>;

    /// Payload of the most recent `ImplPacket::Cached`, starting at its
    /// first frame.
    fn cached_payload(&self) -> &[u8] {
        &[]
    }

    fn update_presentation_time_to_frac_frame(&mut self, _f: Option<TimelineFunction>) {}

    fn add_source(&mut self, source: BoxedStage, _options: AddSourceOptions) {
        panic!("stage does not accept sources (got '{}')", source.name());
    }

    fn remove_source(&mut self, _id: StageId) -> Option<BoxedStage> {
        None
    }

    fn set_thread(&mut self, _slot: &ThreadSlot) {}
}

/// Construction parameters shared by every stage
#[derive(Debug, Clone)]
pub struct StageArgs {
    pub name: String,
    pub format: Format,
    pub reference_clock: ClockId,
}

impl StageArgs {
    pub fn new(name: impl Into<String>, format: Format) -> Self {
        Self {
            name: name.into(),
            format,
            reference_clock: ClockId::MONOTONIC,
        }
    }

    pub fn with_reference_clock(mut self, clock: ClockId) -> Self {
        self.reference_clock = clock;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedRange {
    start: Fixed,
    length: i64,
}

impl CachedRange {
    fn end(&self) -> Fixed {
        self.start + self.length
    }
}

#[derive(Debug)]
struct StageCore {
    id: StageId,
    name: String,
    format: Format,
    reference_clock: ClockId,
    thread: ThreadSlot,
    next_readable_frame: Option<Fixed>,
    cached: Option<CachedRange>,
    presentation_time_to_frac_frame: Option<TimelineFunction>,
    release: ReleaseSlot,
    pending_advance: Option<Fixed>,
}

impl StageCore {
    /// Moves the position forward to `frame`; the stage-specific part runs
    /// at the next `flush_advance`.
    fn advance_self(&mut self, frame: Fixed) {
        if matches!(self.next_readable_frame, Some(next) if frame <= next) {
            return;
        }
        self.next_readable_frame = Some(frame);
        if matches!(self.cached, Some(cached) if frame >= cached.end()) {
            self.cached = None;
        }
        self.pending_advance = Some(frame);
    }

    fn check_bounds(&self, packet: &PacketView<'_>, start_frame: Fixed, frame_count: i64) {
        assert!(
            packet.length() > 0 && packet.length() <= frame_count,
            "stage '{}' returned {} frames for a {} frame request",
            self.name,
            packet.length(),
            frame_count
        );
        assert!(
            packet.start() > start_frame - 1 && packet.end() <= start_frame + frame_count,
            "stage '{}' returned [{:?}, {:?}) for request [{:?}, {:?})",
            self.name,
            packet.start(),
            packet.end(),
            start_frame,
            start_frame + frame_count
        );
        assert_eq!(packet.format(), self.format, "stage '{}' format mismatch", self.name);
    }
}

/// A `StageImpl` plus the protocol bookkeeping
pub struct Stage<S> {
    core: StageCore,
    imp: S,
}

impl<S: StageImpl> Stage<S> {
    pub fn new(args: StageArgs, imp: S) -> Self {
        Self {
            core: StageCore {
                id: StageId::next(),
                name: args.name,
                format: args.format,
                reference_clock: args.reference_clock,
                thread: ThreadSlot::new(),
                next_readable_frame: None,
                cached: None,
                presentation_time_to_frac_frame: None,
                release: ReleaseSlot::new(),
                pending_advance: None,
            },
            imp,
        }
    }

    pub fn inner(&self) -> &S {
        &self.imp
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.imp
    }

    /// Folds in releases from dropped packets and runs deferred
    /// stage-specific advancement.
    fn flush_advance(&mut self) {
        if let Some(frame) = self.core.release.take() {
            self.core.advance_self(frame);
        }
        if let Some(frame) = self.core.pending_advance.take() {
            self.imp.advance_self_impl(frame);
        }
    }

    fn enter(&mut self) {
        self.core.thread.check_current(&self.core.name);
        self.imp.drain_commands();
        self.flush_advance();
    }
}

impl<S: StageImpl> PipelineStage for Stage<S> {
    fn id(&self) -> StageId {
        self.core.id
    }

    fn name(&self) -> &str {
        &self.core.name
    }

    fn format(&self) -> Format {
        self.core.format
    }

    fn reference_clock(&self) -> ClockId {
        self.core.reference_clock
    }

    fn next_readable_frame(&self) -> Option<Fixed> {
        match (self.core.next_readable_frame, self.core.release.peek()) {
            (Some(next), Some(released)) => Some(next.max(released)),
            (next, released) => next.or(released),
        }
    }

    fn presentation_time_to_frac_frame(&self) -> Option<TimelineFunction> {
        self.core.presentation_time_to_frac_frame
    }

    fn update_presentation_time_to_frac_frame(&mut self, f: Option<TimelineFunction>) {
        if let Some(f) = &f {
            assert!(f.invertible(), "stage '{}' given a non-invertible timeline", self.core.name);
        }
        self.core.presentation_time_to_frac_frame = f;
        self.imp.update_presentation_time_to_frac_frame(f);
    }

    fn read(
        &mut self,
        ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<Packet<'_>> {
        self.enter();
        assert!(
            frame_count > 0,
            "stage '{}' read with frame_count {}",
            self.core.name,
            frame_count
        );
        if let Some(next) = self.core.next_readable_frame {
            assert!(
                start_frame >= next,
                "stage '{}' read at {:?} before next readable frame {:?}",
                self.core.name,
                start_frame,
                next
            );
        }

        self.core.advance_self(start_frame);
        self.flush_advance();

        if let Some(cached) = self.core.cached {
            if start_frame < cached.end() {
                let full = PacketView::new(
                    self.core.format,
                    cached.start,
                    cached.length,
                    &self.imp.cached_payload()[..self.core.format.bytes_for_frames(cached.length)],
                );
                return match full.intersection_with(start_frame, frame_count) {
                    Some(view) => {
                        log::trace!(
                            "{}: cache hit [{:?}, {:?})",
                            self.core.name,
                            view.start(),
                            view.end()
                        );
                        let mut packet = Packet::new(view);
                        packet.push_release(&self.core.release);
                        Some(packet)
                    }
                    None => {
                        // The request ends before the cached range begins.
                        self.core.advance_self(start_frame + frame_count);
                        None
                    }
                };
            }
            self.core.cached = None;
        }

        match self.imp.read_impl(ctx, start_frame, frame_count) {
            None => {
                self.core.advance_self(start_frame + frame_count);
                None
            }
            Some(ImplPacket::Uncached(mut packet)) => {
                self.core.check_bounds(packet.view(), start_frame, frame_count);
                packet.push_release(&self.core.release);
                Some(packet)
            }
            Some(ImplPacket::Cached(view)) => {
                assert!(view.length() > 0, "stage '{}' cached an empty packet", self.core.name);
                self.core.cached = Some(CachedRange {
                    start: view.start(),
                    length: view.length(),
                });
                let isect = match view.intersection_with(start_frame, frame_count) {
                    Some(isect) => isect,
                    None => panic!(
                        "stage '{}' cached [{:?}, {:?}) outside request [{:?}, {:?})",
                        self.core.name,
                        view.start(),
                        view.end(),
                        start_frame,
                        start_frame + frame_count
                    ),
                };
                self.core.check_bounds(&isect, start_frame, frame_count);
                let mut packet = Packet::new(isect);
                packet.push_release(&self.core.release);
                Some(packet)
            }
        }
    }

    fn advance(&mut self, ctx: &mut MixJobContext, frame: Fixed) {
        self.enter();
        if matches!(self.core.next_readable_frame, Some(next) if frame <= next) {
            return;
        }
        self.core.advance_self(frame);
        self.flush_advance();
        if self.core.cached.is_some() {
            // The cache, not the sources, still backs frames at `frame`.
            return;
        }
        self.imp.advance_sources_impl(ctx, frame);
    }

    fn add_source(&mut self, source: BoxedStage, options: AddSourceOptions) {
        log::debug!("{}: add source '{}'", self.core.name, source.name());
        let mut source = source;
        source.set_thread(self.core.thread.clone());
        self.imp.add_source(source, options);
    }

    fn remove_source(&mut self, id: StageId) -> Option<BoxedStage> {
        let removed = self.imp.remove_source(id);
        if let Some(source) = &removed {
            log::debug!("{}: removed source '{}'", self.core.name, source.name());
        }
        removed
    }

    fn set_thread(&mut self, slot: ThreadSlot) {
        self.imp.set_thread(&slot);
        self.core.thread = slot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    /// Scripted stage serving one packet of `length` frames at `start`,
    /// whose samples equal their frame offset within the packet.
    struct FakeStage {
        format: Format,
        start: Fixed,
        length: i64,
        cached: bool,
        payload: Vec<u8>,
        read_impl_calls: usize,
        advance_self_calls: Vec<Fixed>,
        advance_sources_calls: Vec<Fixed>,
    }

    impl FakeStage {
        fn new(start: Fixed, length: i64, cached: bool) -> Self {
            let samples: Vec<f32> = (0..length).map(|i| i as f32).collect();
            Self {
                format: Format::float(1, 48_000),
                start,
                length,
                cached,
                payload: bytemuck::cast_slice(&samples).to_vec(),
                read_impl_calls: 0,
                advance_self_calls: Vec::new(),
                advance_sources_calls: Vec::new(),
            }
        }
    }

    impl StageImpl for FakeStage {
        fn advance_self_impl(&mut self, frame: Fixed) {
            self.advance_self_calls.push(frame);
        }

        fn advance_sources_impl(&mut self, _ctx: &mut MixJobContext, frame: Fixed) {
            self.advance_sources_calls.push(frame);
        }

        fn read_impl(
            &mut self,
            _ctx: &mut MixJobContext,
            start_frame: Fixed,
            frame_count: i64,
        ) -> Option<ImplPacket<'_>> {
            self.read_impl_calls += 1;
            let view = PacketView::new(self.format, self.start, self.length, &self.payload);
            if self.cached {
                if view.intersection_with(start_frame, frame_count).is_none() {
                    return None;
                }
                Some(ImplPacket::cached(view))
            } else {
                view.intersection_with(start_frame, frame_count)
                    .map(ImplPacket::uncached)
            }
        }

        fn cached_payload(&self) -> &[u8] {
            &self.payload
        }
    }

    fn fake(start: i64, length: i64, cached: bool) -> Stage<FakeStage> {
        Stage::new(
            StageArgs::new("fake", Format::float(1, 48_000)),
            FakeStage::new(Fixed::from_frames(start), length, cached),
        )
    }

    fn first_sample(packet: &Packet<'_>) -> f32 {
        bytemuck::pod_read_unaligned::<f32>(&packet.payload()[..4])
    }

    #[test]
    fn test_cache_reuse_skips_read_impl() {
        let mut ctx = MixJobContext::for_testing();
        let mut stage = fake(0, 100, true);

        {
            let packet = stage.read(&mut ctx, Fixed::ZERO, 10).unwrap();
            assert_eq!(packet.start(), Fixed::ZERO);
            assert_eq!(packet.length(), 10);
        }
        {
            let packet = stage.read(&mut ctx, Fixed::from_frames(10), 10).unwrap();
            assert_eq!(packet.start(), Fixed::from_frames(10));
            assert_eq!(first_sample(&packet), 10.0, "cache hit must slice at the offset");
        }
        assert_eq!(stage.inner().read_impl_calls, 1, "second read must be served from cache");
    }

    #[test]
    fn test_cache_invalidated_past_end() {
        let mut ctx = MixJobContext::for_testing();
        let mut stage = fake(0, 20, true);

        drop(stage.read(&mut ctx, Fixed::ZERO, 20));
        assert!(stage.read(&mut ctx, Fixed::from_frames(20), 10).is_none());
        assert_eq!(stage.inner().read_impl_calls, 2);
    }

    #[test]
    fn test_none_still_advances() {
        let mut ctx = MixJobContext::for_testing();
        let mut stage = fake(100, 10, false);

        assert!(stage.read(&mut ctx, Fixed::ZERO, 10).is_none());
        assert_eq!(stage.next_readable_frame(), Some(Fixed::from_frames(10)));
    }

    #[test]
    fn test_partial_consumption() {
        let mut ctx = MixJobContext::for_testing();
        let mut stage = fake(0, 10, false);

        {
            let mut packet = stage.read(&mut ctx, Fixed::ZERO, 10).unwrap();
            packet.set_frames_consumed(4);
        }
        assert_eq!(stage.next_readable_frame(), Some(Fixed::from_frames(4)));

        let packet = stage.read(&mut ctx, Fixed::from_frames(4), 10).unwrap();
        assert_eq!(packet.start(), Fixed::from_frames(4));
        assert_eq!(packet.length(), 6);
    }

    #[test]
    #[should_panic(expected = "before next readable frame")]
    fn test_read_backward_panics() {
        let mut ctx = MixJobContext::for_testing();
        let mut stage = fake(0, 10, false);
        drop(stage.read(&mut ctx, Fixed::from_frames(5), 5));
        drop(stage.read(&mut ctx, Fixed::from_frames(4), 5));
    }

    #[test]
    fn test_advance_blocked_by_cache() {
        let mut ctx = MixJobContext::for_testing();
        let mut stage = fake(0, 100, true);

        drop(stage.read(&mut ctx, Fixed::ZERO, 10));
        stage.advance(&mut ctx, Fixed::from_frames(50));
        assert!(
            stage.inner().advance_sources_calls.is_empty(),
            "sources must not advance while the cache overlaps"
        );

        stage.advance(&mut ctx, Fixed::from_frames(100));
        assert_eq!(stage.inner().advance_sources_calls, vec![Fixed::from_frames(100)]);
    }

    #[test]
    fn test_advance_is_noop_when_behind() {
        let mut ctx = MixJobContext::for_testing();
        let mut stage = fake(0, 10, false);

        stage.advance(&mut ctx, Fixed::from_frames(30));
        stage.advance(&mut ctx, Fixed::from_frames(20));
        assert_eq!(stage.inner().advance_sources_calls, vec![Fixed::from_frames(30)]);
        assert_eq!(stage.inner().advance_self_calls, vec![Fixed::from_frames(30)]);
    }

    #[test]
    fn test_release_runs_advance_self_impl() {
        let mut ctx = MixJobContext::for_testing();
        let mut stage = fake(0, 10, false);

        drop(stage.read(&mut ctx, Fixed::ZERO, 10));
        stage.advance(&mut ctx, Fixed::from_frames(10));
        assert_eq!(
            stage.inner().advance_self_calls,
            vec![Fixed::ZERO, Fixed::from_frames(10)]
        );
    }

    struct Misbehaving {
        payload: Vec<u8>,
    }

    impl StageImpl for Misbehaving {
        fn advance_self_impl(&mut self, _frame: Fixed) {}
        fn advance_sources_impl(&mut self, _ctx: &mut MixJobContext, _frame: Fixed) {}
        fn read_impl(
            &mut self,
            _ctx: &mut MixJobContext,
            start_frame: Fixed,
            _frame_count: i64,
        ) -> Option<ImplPacket<'_>> {
            // Always four frames, regardless of the request.
            Some(ImplPacket::uncached(PacketView::new(
                Format::float(1, 48_000),
                start_frame,
                4,
                &self.payload,
            )))
        }
    }

    #[test]
    #[should_panic(expected = "frame request")]
    fn test_oversized_packet_panics() {
        let mut ctx = MixJobContext::for_testing();
        let mut stage = Stage::new(
            StageArgs::new("bad", Format::float(1, 48_000)),
            Misbehaving { payload: vec![0; 16] },
        );
        drop(stage.read(&mut ctx, Fixed::ZERO, 2));
    }

    #[test]
    fn test_random_reads_respect_bounds() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for cached in [false, true] {
            let mut ctx = MixJobContext::for_testing();
            let mut stage = fake(3, 500, cached);
            let mut position = Fixed::ZERO;

            while position < Fixed::from_frames(600) {
                let count = rng.gen_range(1..40);
                if rng.gen_bool(0.2) {
                    position = position + Fixed::from_raw(rng.gen_range(0..20_000));
                    stage.advance(&mut ctx, position);
                    continue;
                }
                let next = match stage.read(&mut ctx, position, count) {
                    Some(mut packet) => {
                        assert!(packet.start() > position - 1);
                        assert!(packet.end() <= position + count);
                        assert!(packet.length() <= count);
                        let consumed = rng.gen_range(0..=packet.length());
                        packet.set_frames_consumed(consumed);
                        packet.start() + consumed
                    }
                    None => position + count,
                };
                position = position.max(next);
                assert!(stage.next_readable_frame().unwrap() >= position);
            }
        }
    }
}
