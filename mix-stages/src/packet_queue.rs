//! Packet-queue producer source
//!
//! A FIFO of client-pushed packets. Commands arrive from the client thread
//! over a channel and are applied at the top of the next `read`/`advance`.

use crate::error::CommandError;
use crate::fence::CompletionFence;
use crossbeam::channel::{self, Receiver, Sender};
use mix_core::{
    AlignedBuffer, Fixed, Format, ImplPacket, MixJobContext, PacketView, Stage, StageArgs,
    StageImpl,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// A client packet: `frame_count` frames starting `offset` bytes into `buffer`
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub start: Fixed,
    pub frame_count: i64,
    pub buffer: Arc<AlignedBuffer>,
    pub offset: usize,
}

impl QueuedPacket {
    pub fn new(start: Fixed, frame_count: i64, buffer: Arc<AlignedBuffer>, offset: usize) -> Self {
        Self {
            start,
            frame_count,
            buffer,
            offset,
        }
    }

    /// A packet owning a copy of interleaved float `samples`.
    pub fn from_f32(format: Format, start: Fixed, samples: &[f32]) -> Self {
        let frame_count = (samples.len() / format.channels()) as i64;
        Self::new(start, frame_count, Arc::new(AlignedBuffer::from_f32(samples)), 0)
    }

    pub fn end(&self) -> Fixed {
        self.start + self.frame_count
    }

    fn view(&self, format: Format) -> PacketView<'_> {
        let bytes = format.bytes_for_frames(self.frame_count);
        PacketView::new(
            format,
            self.start,
            self.frame_count,
            &self.buffer.as_bytes()[self.offset..self.offset + bytes],
        )
    }
}

enum PacketQueueCommand {
    Push {
        packet: QueuedPacket,
        fence: Option<CompletionFence>,
    },
    Clear {
        fence: Option<CompletionFence>,
    },
}

/// Client-side handle for a packet queue
#[derive(Debug, Clone)]
pub struct PacketQueueHandle {
    format: Format,
    commands: Sender<PacketQueueCommand>,
}

impl std::fmt::Debug for PacketQueueCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketQueueCommand::Push { packet, .. } => f.debug_tuple("Push").field(packet).finish(),
            PacketQueueCommand::Clear { .. } => f.write_str("Clear"),
        }
    }
}

impl PacketQueueHandle {
    /// Queues `packet`; `fence` is dropped once the packet is fully consumed
    /// or cleared.
    ///
    /// # Panics
    /// If `packet`'s byte range lies outside its buffer.
    pub fn push(
        &self,
        packet: QueuedPacket,
        fence: Option<CompletionFence>,
    ) -> Result<(), CommandError> {
        let bytes = self.format.bytes_for_frames(packet.frame_count);
        assert!(
            packet.frame_count > 0 && packet.offset + bytes <= packet.buffer.len(),
            "packet of {} frames at offset {} exceeds its {} byte buffer",
            packet.frame_count,
            packet.offset,
            packet.buffer.len()
        );
        self.commands
            .send(PacketQueueCommand::Push { packet, fence })
            .map_err(|_| CommandError::Disconnected)
    }

    /// Drops every queued packet.
    pub fn clear(&self, fence: Option<CompletionFence>) -> Result<(), CommandError> {
        self.commands
            .send(PacketQueueCommand::Clear { fence })
            .map_err(|_| CommandError::Disconnected)
    }
}

struct QueueEntry {
    packet: QueuedPacket,
    _fence: Option<CompletionFence>,
    read: bool,
}

/// Stage logic behind `SimplePacketQueueProducerStage`
pub struct SimplePacketQueue {
    format: Format,
    commands: Receiver<PacketQueueCommand>,
    queue: VecDeque<QueueEntry>,
    underflow_count: u64,
}

pub type SimplePacketQueueProducerStage = Stage<SimplePacketQueue>;

impl SimplePacketQueue {
    pub fn create(args: StageArgs) -> (SimplePacketQueueProducerStage, PacketQueueHandle) {
        let (tx, rx) = channel::unbounded();
        let handle = PacketQueueHandle {
            format: args.format,
            commands: tx,
        };
        let queue = SimplePacketQueue {
            format: args.format,
            commands: rx,
            queue: VecDeque::new(),
            underflow_count: 0,
        };
        (Stage::new(args, queue), handle)
    }

    /// Number of packets that were skipped, fully or partly, before being read.
    pub fn underflow_count(&self) -> u64 {
        self.underflow_count
    }

    pub fn queued_packets(&self) -> usize {
        self.queue.len()
    }

    fn report_underflow(&mut self, packet: &QueuedPacket, frame: Fixed) {
        self.underflow_count += 1;
        log::warn!(
            "packet queue underflow: packet [{:?}, {:?}) reached at {:?}",
            packet.start,
            packet.end(),
            frame
        );
    }
}

impl StageImpl for SimplePacketQueue {
    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                PacketQueueCommand::Push { packet, fence } => {
                    if let Some(last) = self.queue.back() {
                        if packet.start < last.packet.end() {
                            log::warn!(
                                "dropping packet at {:?}: overlaps previous packet ending at {:?}",
                                packet.start,
                                last.packet.end()
                            );
                            continue;
                        }
                    }
                    self.queue.push_back(QueueEntry {
                        packet,
                        _fence: fence,
                        read: false,
                    });
                }
                PacketQueueCommand::Clear { fence } => {
                    log::debug!("packet queue cleared ({} packets)", self.queue.len());
                    self.queue.clear();
                    drop(fence);
                }
            }
        }
    }

    fn advance_self_impl(&mut self, frame: Fixed) {
        while let Some(head) = self.queue.front() {
            if head.packet.end() > frame {
                break;
            }
            if !head.read {
                let packet = head.packet.clone();
                self.report_underflow(&packet, frame);
            }
            self.queue.pop_front();
        }
    }

    fn advance_sources_impl(&mut self, _ctx: &mut MixJobContext, _frame: Fixed) {}

    fn read_impl(
        &mut self,
        _ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<ImplPacket<'_>> {
        let late = match self.queue.front() {
            Some(head) => !head.read && head.packet.start < start_frame - 1,
            None => return None,
        };
        if late {
            if let Some(head) = self.queue.front() {
                let packet = head.packet.clone();
                self.report_underflow(&packet, start_frame);
            }
        }

        let format = self.format;
        let head = self.queue.front_mut()?;
        let view = head.packet.view(format).intersection_with(start_frame, frame_count)?;
        head.read = true;
        Some(ImplPacket::uncached(view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::completion_fence;
    use crate::testing::{ramp, samples};
    use mix_core::PipelineStage;

    fn mono() -> Format {
        Format::float(1, 48_000)
    }

    fn queue() -> (SimplePacketQueueProducerStage, PacketQueueHandle) {
        SimplePacketQueue::create(StageArgs::new("queue", mono()))
    }

    #[test]
    fn test_reads_packets_in_order() {
        let mut ctx = MixJobContext::for_testing();
        let (mut stage, handle) = queue();
        handle
            .push(QueuedPacket::from_f32(mono(), Fixed::ZERO, &ramp(0.0, 10)), None)
            .unwrap();
        handle
            .push(QueuedPacket::from_f32(mono(), Fixed::from_frames(10), &ramp(10.0, 10)), None)
            .unwrap();

        {
            let packet = stage.read(&mut ctx, Fixed::ZERO, 15).unwrap();
            assert_eq!(packet.start(), Fixed::ZERO);
            assert_eq!(packet.length(), 10, "one packet per read");
        }
        {
            let packet = stage.read(&mut ctx, Fixed::from_frames(10), 15).unwrap();
            assert_eq!(samples(packet.payload()), ramp(10.0, 10));
        }
        assert!(stage.read(&mut ctx, Fixed::from_frames(20), 5).is_none());
        assert_eq!(stage.inner().underflow_count(), 0);
    }

    #[test]
    fn test_fence_signals_when_consumed() {
        let mut ctx = MixJobContext::for_testing();
        let (mut stage, handle) = queue();
        let (fence, waiter) = completion_fence();
        handle
            .push(QueuedPacket::from_f32(mono(), Fixed::ZERO, &ramp(0.0, 10)), Some(fence))
            .unwrap();

        {
            let mut packet = stage.read(&mut ctx, Fixed::ZERO, 10).unwrap();
            packet.set_frames_consumed(5);
        }
        stage.advance(&mut ctx, Fixed::from_frames(5));
        assert!(!waiter.is_signaled(), "packet is half consumed");

        drop(stage.read(&mut ctx, Fixed::from_frames(5), 10));
        stage.advance(&mut ctx, Fixed::from_frames(10));
        assert!(waiter.is_signaled());
        assert_eq!(stage.inner().queued_packets(), 0);
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut ctx = MixJobContext::for_testing();
        let (mut stage, handle) = queue();
        let (push_fence, push_waiter) = completion_fence();
        let (clear_fence, clear_waiter) = completion_fence();
        handle
            .push(QueuedPacket::from_f32(mono(), Fixed::ZERO, &ramp(0.0, 10)), Some(push_fence))
            .unwrap();
        handle.clear(Some(clear_fence)).unwrap();

        assert!(stage.read(&mut ctx, Fixed::ZERO, 10).is_none());
        assert!(push_waiter.is_signaled());
        assert!(clear_waiter.is_signaled());
    }

    #[test]
    fn test_underflow_counted() {
        let mut ctx = MixJobContext::for_testing();
        let (mut stage, handle) = queue();
        handle
            .push(QueuedPacket::from_f32(mono(), Fixed::ZERO, &ramp(0.0, 10)), None)
            .unwrap();
        handle
            .push(QueuedPacket::from_f32(mono(), Fixed::from_frames(10), &ramp(10.0, 10)), None)
            .unwrap();

        // The first packet is never read; the second is entered mid-way.
        let packet = stage.read(&mut ctx, Fixed::from_frames(15), 10).unwrap();
        assert_eq!(packet.start(), Fixed::from_frames(15));
        assert_eq!(samples(packet.payload()), ramp(15.0, 5));
        drop(packet);
        assert_eq!(stage.inner().underflow_count(), 2);
    }

    #[test]
    fn test_disconnected_handle() {
        let (stage, handle) = queue();
        drop(stage);
        assert_eq!(handle.clear(None), Err(CommandError::Disconnected));
    }
}
