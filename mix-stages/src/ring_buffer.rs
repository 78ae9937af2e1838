//! Ring-buffer producer source
//!
//! Reads frames straight out of a ring that another party (hardware, or a
//! writer thread in tests) fills concurrently. Frame `f` lives at ring slot
//! `f mod frame_count`. A safe-read oracle tells the stage the newest frame
//! that is fully written; only the `frame_count` frames ending there are
//! valid.

use mix_core::{
    AlignedBuffer, ClockId, Fixed, Format, ImplPacket, MixJobContext, PacketView, Stage,
    StageArgs, StageImpl, TimelineFunction,
};
use std::sync::atomic::{self, AtomicI64, Ordering};
use std::sync::Arc;

/// Fixed-size ring of frames shared between a writer and a reader stage
///
/// There is no lock: the writer must only overwrite frames the reader's
/// safe-read window no longer covers. Bytes are only ever reached through
/// `base`, so no reference spans the whole ring.
pub struct RingBuffer {
    format: Format,
    frame_count: i64,
    base: *mut u8,
    len: usize,
    _storage: AlignedBuffer,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(format: Format, frame_count: i64) -> Arc<Self> {
        assert!(frame_count > 0, "ring buffer needs at least one frame");
        let mut storage = AlignedBuffer::zeroed(format.bytes_for_frames(frame_count));
        storage.fill(format.sample_type().silence_byte());
        let base = storage.as_bytes_mut().as_mut_ptr();
        Arc::new(Self {
            format,
            frame_count,
            base,
            len: storage.len(),
            _storage: storage,
        })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn frame_count(&self) -> i64 {
        self.frame_count
    }

    /// Copies whole frames from `bytes` into the ring starting at absolute
    /// frame `first_frame`, wrapping at the end of the ring. `bytes` may not
    /// exceed the ring.
    ///
    /// # Safety
    /// There must be a single writer at a time, and none of the written slots
    /// may be inside a reader's safe-read window: the frames must be published
    /// (through the safe-read oracle) only after this returns, and must have
    /// left every reader's window before they are overwritten.
    pub unsafe fn write_frames(&self, first_frame: i64, bytes: &[u8]) {
        let bpf = self.format.bytes_per_frame();
        assert_eq!(bytes.len() % bpf, 0, "partial frame written to ring");
        assert!(bytes.len() <= self.len, "write larger than the ring");

        let mut written = 0;
        let mut slot = first_frame.rem_euclid(self.frame_count) as usize * bpf;
        while written < bytes.len() {
            let chunk = (self.len - slot).min(bytes.len() - written);
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(written),
                self.base.add(slot),
                chunk,
            );
            written += chunk;
            slot = 0;
        }
        atomic::fence(Ordering::Release);
    }

    /// `count` frames starting at ring slot `slot`; the range must not wrap.
    fn slots(&self, slot: i64, count: i64) -> &[u8] {
        let bpf = self.format.bytes_per_frame();
        let first = slot as usize * bpf;
        let bytes = count as usize * bpf;
        assert!(first + bytes <= self.len, "ring read past the end");
        // The writer never touches slots inside the safe-read window.
        unsafe { std::slice::from_raw_parts(self.base.add(first), bytes) }
    }
}

/// Source of the newest fully written frame
pub trait SafeReadFrame: Send {
    fn safe_read_frame(&mut self, ctx: &MixJobContext) -> i64;
}

impl<F> SafeReadFrame for F
where
    F: FnMut(&MixJobContext) -> i64 + Send,
{
    fn safe_read_frame(&mut self, ctx: &MixJobContext) -> i64 {
        self(ctx)
    }
}

/// Writer-published position: the writer stores its newest complete frame
#[derive(Debug, Clone)]
pub struct AtomicWritePosition(Arc<AtomicI64>);

impl AtomicWritePosition {
    /// Nothing written yet.
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(-1)))
    }

    pub fn publish(&self, last_written_frame: i64) {
        self.0.store(last_written_frame, Ordering::Release);
    }

    pub fn load(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for AtomicWritePosition {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeReadFrame for AtomicWritePosition {
    fn safe_read_frame(&mut self, _ctx: &MixJobContext) -> i64 {
        self.load()
    }
}

/// Safe-read frame derived from a clock: a device writing one frame per
/// frame period, `frames_of_lead` frames behind the clock's frame position.
#[derive(Debug, Clone, Copy)]
pub struct ClockDrivenSafeRead {
    pub clock: ClockId,
    /// Reference time on `clock` to fractional frame.
    pub time_to_frac_frame: TimelineFunction,
    pub frames_of_lead: i64,
}

impl SafeReadFrame for ClockDrivenSafeRead {
    fn safe_read_frame(&mut self, ctx: &MixJobContext) -> i64 {
        let now = ctx
            .clocks()
            .translate(ClockId::MONOTONIC, self.clock, ctx.mono_start_time());
        Fixed::from_raw(self.time_to_frac_frame.apply(now)).floor() - 1 - self.frames_of_lead
    }
}

/// Stage logic behind `RingBufferProducerStage`
pub struct RingBufferProducer {
    ring: Arc<RingBuffer>,
    /// `None` treats every frame as readable (the ring loops forever).
    safe_read: Option<Box<dyn SafeReadFrame>>,
    missed_reads: u64,
}

pub type RingBufferProducerStage = Stage<RingBufferProducer>;

impl RingBufferProducer {
    pub fn create(
        name: impl Into<String>,
        ring: Arc<RingBuffer>,
        safe_read: Box<dyn SafeReadFrame>,
    ) -> RingBufferProducerStage {
        Self::with_oracle(name.into(), ring, Some(safe_read))
    }

    fn with_oracle(
        name: String,
        ring: Arc<RingBuffer>,
        safe_read: Option<Box<dyn SafeReadFrame>>,
    ) -> RingBufferProducerStage {
        let args = StageArgs::new(name, ring.format());
        Stage::new(
            args,
            RingBufferProducer {
                ring,
                safe_read,
                missed_reads: 0,
            },
        )
    }

    /// Reads that fell completely outside the safe-read window.
    pub fn missed_reads(&self) -> u64 {
        self.missed_reads
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }
}

/// A ring buffer whose every frame is always readable
pub struct SimpleRingBufferProducerStage;

impl SimpleRingBufferProducerStage {
    pub fn create(name: impl Into<String>, ring: Arc<RingBuffer>) -> RingBufferProducerStage {
        RingBufferProducer::with_oracle(name.into(), ring, None)
    }
}

impl StageImpl for RingBufferProducer {
    fn advance_self_impl(&mut self, _frame: Fixed) {}

    fn advance_sources_impl(&mut self, _ctx: &mut MixJobContext, _frame: Fixed) {}

    fn read_impl(
        &mut self,
        ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<ImplPacket<'_>> {
        // Ring frames sit on integral positions.
        let mut first = start_frame.floor();
        let mut end = (start_frame + frame_count).floor();

        if let Some(oracle) = self.safe_read.as_mut() {
            let valid_end = oracle.safe_read_frame(ctx) + 1;
            let valid_start = valid_end - self.ring.frame_count();
            if end <= valid_start || first >= valid_end {
                self.missed_reads += 1;
                log::warn!(
                    "ring read [{}, {}) outside safe window [{}, {})",
                    first,
                    end,
                    valid_start,
                    valid_end
                );
                return None;
            }
            first = first.max(valid_start);
            end = end.min(valid_end);
        }
        if end <= first {
            return None;
        }

        // Pairs with the writer's release fence.
        atomic::fence(Ordering::Acquire);

        let ring_frames = self.ring.frame_count();
        let slot = first.rem_euclid(ring_frames);
        let length = (end - first).min(ring_frames - slot);
        let ring = self.ring.as_ref();
        Some(ImplPacket::uncached(PacketView::new(
            ring.format(),
            Fixed::from_frames(first),
            length,
            ring.slots(slot, length),
        )))
    }
}
