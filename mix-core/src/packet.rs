//! Packets: borrowed frame ranges plus a release contract
//!
//! A `Packet` is returned by `PipelineStage::read`. Dropping it is the only
//! way the stages that produced it learn how far they have been consumed:
//! every stage the payload passed through holds a `ReleaseSlot`, and the
//! packet writes `start + frames_consumed` (in that stage's frame timeline)
//! into each slot exactly once, on drop.

use crate::fixed::Fixed;
use crate::format::Format;
use std::cell::Cell;

/// Maximum number of stages a single packet may be forwarded through.
pub const MAX_RELEASE_DEPTH: usize = 8;

/// Non-owning view of `length` contiguous frames starting at `start`
#[derive(Clone, Copy)]
pub struct PacketView<'a> {
    format: Format,
    start: Fixed,
    length: i64,
    payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// # Panics
    /// If `length` is negative or `payload` does not hold exactly `length` frames.
    pub fn new(format: Format, start: Fixed, length: i64, payload: &'a [u8]) -> Self {
        assert!(length >= 0, "packet length {} is negative", length);
        assert_eq!(
            payload.len(),
            format.bytes_for_frames(length),
            "payload size does not match {} frames",
            length
        );
        Self {
            format,
            start,
            length,
            payload,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn start(&self) -> Fixed {
        self.start
    }

    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn end(&self) -> Fixed {
        self.start + self.length
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// The sub-view of `count` frames beginning `offset` frames in.
    pub fn slice(&self, offset: i64, count: i64) -> PacketView<'a> {
        assert!(
            offset >= 0 && count >= 0 && offset + count <= self.length,
            "slice [{}, {}) outside packet of {} frames",
            offset,
            offset + count,
            self.length
        );
        let bpf = self.format.bytes_per_frame();
        let first = offset as usize * bpf;
        let last = first + count as usize * bpf;
        PacketView {
            format: self.format,
            start: self.start + offset,
            length: count,
            payload: &self.payload[first..last],
        }
    }

    /// Frames of this packet a request for `[start, start + count)` may
    /// return, or `None` if there are none.
    ///
    /// A packet frame at position `p` belongs to the request iff
    /// `p > start - 1` and `p + 1 <= start + count`; the result keeps this
    /// packet's fractional alignment.
    pub fn intersection_with(&self, start: Fixed, count: i64) -> Option<PacketView<'a>> {
        if count <= 0 || self.length == 0 {
            return None;
        }
        let first = (start - self.start).floor().max(0);
        let last = (start + count - self.start).floor().min(self.length);
        if last <= first {
            return None;
        }
        Some(self.slice(first, last - first))
    }
}

impl std::fmt::Debug for PacketView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketView")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("format", &self.format)
            .finish()
    }
}

/// Release target owned by a stage
///
/// Holds the furthest frame any dropped packet has released the stage to;
/// the stage folds it into its position at the top of its next call.
#[derive(Debug, Default)]
pub struct ReleaseSlot(Cell<Option<Fixed>>);

impl ReleaseSlot {
    pub fn new() -> Self {
        Self(Cell::new(None))
    }

    pub fn release(&self, frame: Fixed) {
        let next = match self.0.get() {
            Some(prev) if prev >= frame => prev,
            _ => frame,
        };
        self.0.set(Some(next));
    }

    pub fn take(&self) -> Option<Fixed> {
        self.0.take()
    }

    pub fn peek(&self) -> Option<Fixed> {
        self.0.get()
    }
}

#[derive(Clone, Copy)]
struct ReleaseLink<'a> {
    start: Fixed,
    slot: &'a ReleaseSlot,
}

/// A view plus the consumption contract of the stages that produced it
pub struct Packet<'a> {
    view: PacketView<'a>,
    frames_consumed: i64,
    links: [Option<ReleaseLink<'a>>; MAX_RELEASE_DEPTH],
}

impl<'a> Packet<'a> {
    /// A packet that releases nothing when dropped.
    pub(crate) fn new(view: PacketView<'a>) -> Self {
        Self {
            view,
            frames_consumed: view.length(),
            links: [None; MAX_RELEASE_DEPTH],
        }
    }

    /// Re-wraps this packet with an optionally re-aligned start and truncated
    /// length. The stages that produced `self` are released when the returned
    /// packet is dropped, by the number of frames it consumed.
    pub(crate) fn forward(mut self, start: Option<Fixed>, length: Option<i64>) -> Packet<'a> {
        let length = length.unwrap_or(self.view.length());
        assert!(
            length > 0 && length <= self.view.length(),
            "cannot forward {} of {} frames",
            length,
            self.view.length()
        );
        let mut view = self.view.slice(0, length);
        if let Some(start) = start {
            view.start = start;
        }
        let links = std::mem::replace(&mut self.links, [None; MAX_RELEASE_DEPTH]);
        Packet {
            view,
            frames_consumed: length,
            links,
        }
    }

    /// Adds a release target at this packet's current start.
    pub(crate) fn push_release(&mut self, slot: &'a ReleaseSlot) {
        let link = ReleaseLink {
            start: self.view.start(),
            slot,
        };
        match self.links.iter_mut().find(|l| l.is_none()) {
            Some(free) => *free = Some(link),
            None => panic!(
                "packet forwarded through more than {} stages",
                MAX_RELEASE_DEPTH
            ),
        }
    }

    pub fn view(&self) -> &PacketView<'a> {
        &self.view
    }

    pub fn format(&self) -> Format {
        self.view.format()
    }

    pub fn start(&self) -> Fixed {
        self.view.start()
    }

    pub fn end(&self) -> Fixed {
        self.view.end()
    }

    pub fn length(&self) -> i64 {
        self.view.length()
    }

    pub fn payload(&self) -> &'a [u8] {
        self.view.payload()
    }

    pub fn frames_consumed(&self) -> i64 {
        self.frames_consumed
    }

    /// Declares that only the first `frames` frames were used; the rest will
    /// be returned again by the next `read`. Defaults to the full length.
    pub fn set_frames_consumed(&mut self, frames: i64) {
        assert!(
            (0..=self.length()).contains(&frames),
            "frames_consumed {} outside [0, {}]",
            frames,
            self.length()
        );
        self.frames_consumed = frames;
    }
}

impl Drop for Packet<'_> {
    fn drop(&mut self) {
        let consumed = self.frames_consumed;
        for link in self.links.iter().flatten() {
            link.slot.release(link.start + consumed);
        }
    }
}

impl std::fmt::Debug for Packet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("start", &self.start())
            .field("length", &self.length())
            .field("frames_consumed", &self.frames_consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono() -> Format {
        Format::float(1, 48_000)
    }

    fn bytes(frames: usize) -> Vec<u8> {
        vec![0u8; frames * 4]
    }

    #[test]
    fn test_intersection_integral() {
        let payload = bytes(10);
        let view = PacketView::new(mono(), Fixed::from_frames(10), 10, &payload);

        let isect = view.intersection_with(Fixed::from_frames(15), 10).unwrap();
        assert_eq!(isect.start(), Fixed::from_frames(15));
        assert_eq!(isect.length(), 5);

        let isect = view.intersection_with(Fixed::from_frames(0), 12).unwrap();
        assert_eq!(isect.start(), Fixed::from_frames(10));
        assert_eq!(isect.length(), 2);

        assert!(view.intersection_with(Fixed::from_frames(20), 5).is_none());
        assert!(view.intersection_with(Fixed::from_frames(0), 10).is_none());
    }

    #[test]
    fn test_intersection_fractional() {
        let payload = bytes(10);
        let start = Fixed::from_f64(0.5);
        let view = PacketView::new(mono(), start, 10, &payload);

        let isect = view.intersection_with(Fixed::ZERO, 5).unwrap();
        assert_eq!(isect.start(), start);
        assert_eq!(isect.length(), 4, "frame at 4.5 would end past 5");
        assert!(isect.end() <= Fixed::from_frames(5));

        let isect = view.intersection_with(Fixed::ONE, 5).unwrap();
        assert_eq!(isect.start(), start, "0.5 > 1 - 1 so frame 0 is included");
        assert_eq!(isect.length(), 5);
    }

    #[test]
    fn test_release_on_drop() {
        let payload = bytes(8);
        let slot = ReleaseSlot::new();
        {
            let mut packet = Packet::new(PacketView::new(mono(), Fixed::from_frames(4), 8, &payload));
            packet.push_release(&slot);
            packet.set_frames_consumed(3);
        }
        assert_eq!(slot.take(), Some(Fixed::from_frames(7)));
        assert_eq!(slot.take(), None, "slot must be drained by take");
    }

    #[test]
    fn test_forward_releases_each_stage_in_its_own_timeline() {
        let payload = bytes(8);
        let source_slot = ReleaseSlot::new();
        let stage_slot = ReleaseSlot::new();
        {
            let mut source = Packet::new(PacketView::new(mono(), Fixed::from_frames(100), 8, &payload));
            source.push_release(&source_slot);

            // Re-aligned into a downstream timeline that is 100 frames behind.
            let mut forwarded = source.forward(Some(Fixed::from_frames(0)), Some(6));
            forwarded.push_release(&stage_slot);
            assert_eq!(forwarded.length(), 6);
            forwarded.set_frames_consumed(5);
        }
        assert_eq!(source_slot.take(), Some(Fixed::from_frames(105)));
        assert_eq!(stage_slot.take(), Some(Fixed::from_frames(5)));
    }

    #[test]
    fn test_release_slot_keeps_furthest() {
        let slot = ReleaseSlot::new();
        slot.release(Fixed::from_frames(10));
        slot.release(Fixed::from_frames(4));
        assert_eq!(slot.peek(), Some(Fixed::from_frames(10)));
    }

    #[test]
    #[should_panic(expected = "frames_consumed")]
    fn test_consume_too_many_panics() {
        let payload = bytes(2);
        let mut packet = Packet::new(PacketView::new(mono(), Fixed::ZERO, 2, &payload));
        packet.set_frames_consumed(3);
    }
}
