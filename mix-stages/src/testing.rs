//! Scripted stages for unit tests

use mix_core::{
    AlignedBuffer, BoxedStage, Fixed, Format, ImplPacket, MixJobContext, PacketView, Stage,
    StageArgs, StageImpl,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a `FakeStage` observed, readable after the stage is boxed
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeProbe {
    read_impl_calls: Arc<AtomicUsize>,
    advanced_to: Arc<Mutex<Vec<Fixed>>>,
}

impl FakeProbe {
    pub(crate) fn read_impl_calls(&self) -> usize {
        self.read_impl_calls.load(Ordering::Relaxed)
    }

    pub(crate) fn advanced_to(&self) -> Vec<Fixed> {
        self.advanced_to.lock().clone()
    }
}

/// Serves a fixed list of packets as uncached data
pub(crate) struct FakeStage {
    format: Format,
    packets: Vec<(Fixed, i64, AlignedBuffer)>,
    probe: FakeProbe,
}

impl StageImpl for FakeStage {
    fn advance_self_impl(&mut self, _frame: Fixed) {}

    fn advance_sources_impl(&mut self, _ctx: &mut MixJobContext, frame: Fixed) {
        self.probe.advanced_to.lock().push(frame);
    }

    fn read_impl(
        &mut self,
        _ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<ImplPacket<'_>> {
        self.probe.read_impl_calls.fetch_add(1, Ordering::Relaxed);
        let format = self.format;
        self.packets.iter().find_map(|(start, length, buffer)| {
            PacketView::new(format, *start, *length, buffer.as_bytes())
                .intersection_with(start_frame, frame_count)
                .map(ImplPacket::uncached)
        })
    }
}

/// A float stage holding `packets`, each `(start, interleaved samples)`.
pub(crate) fn fake_stage(format: Format, packets: Vec<(Fixed, Vec<f32>)>) -> (BoxedStage, FakeProbe) {
    let probe = FakeProbe::default();
    let packets = packets
        .into_iter()
        .map(|(start, samples)| {
            let frames = (samples.len() / format.channels()) as i64;
            (start, frames, AlignedBuffer::from_f32(&samples))
        })
        .collect();
    let stage = Stage::new(
        StageArgs::new("fake", format),
        FakeStage {
            format,
            packets,
            probe: probe.clone(),
        },
    );
    (Box::new(stage), probe)
}

/// Mono samples `first, first + 1, ...` for `frames` frames.
pub(crate) fn ramp(first: f32, frames: usize) -> Vec<f32> {
    (0..frames).map(|i| first + i as f32).collect()
}

pub(crate) fn samples(payload: &[u8]) -> Vec<f32> {
    mix_core::f32_samples(payload).collect()
}
