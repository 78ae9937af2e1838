//! Producer endpoint: start/stop and timeline translation
//!
//! A `ProducerStage` wraps an internal source that counts frames on its own
//! timeline. Start and Stop commands, sent from a client thread through a
//! `ProducerHandle`, decide when the internal source is audible and fix the
//! offset `internal_frame = downstream_frame + offset` while it is.

use crate::error::CommandError;
use crossbeam::channel::{self, Receiver, Sender};
use mix_core::{
    BoxedStage, Fixed, ImplPacket, MixJobContext, PipelineStage, Stage, StageArgs, StageImpl,
    ThreadSlot, TimelineFunction,
};
use std::collections::VecDeque;

/// Where a Start takes effect on the downstream timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Reference-clock time, converted with the downstream timeline.
    PresentationTime(i64),
    DownstreamFrame(Fixed),
}

/// Where a Stop takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPosition {
    PresentationTime(i64),
    DownstreamFrame(Fixed),
    /// Frame on the internal source's timeline.
    InternalFrame(Fixed),
}

/// Reported to command callbacks once a Start or Stop is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedAt {
    /// `None` while the downstream timeline is unknown.
    pub presentation_time: Option<i64>,
    pub downstream_frame: Fixed,
    pub internal_frame: Fixed,
}

pub type CommandCallback = Box<dyn FnOnce(AppliedAt) + Send>;

pub struct StartCommand {
    pub start_position: StartPosition,
    /// Internal frame played at `start_position`.
    pub start_frame: Fixed,
    pub callback: Option<CommandCallback>,
}

pub struct StopCommand {
    pub stop_position: StopPosition,
    pub callback: Option<CommandCallback>,
}

enum ProducerCommand {
    Start(StartCommand),
    Stop(StopCommand),
}

/// Client-side command sender for one producer
///
/// Enforces that commands alternate Start, Stop, Start, ... and that
/// commands never move backward: presentation times are compared with
/// presentation times and downstream frames with downstream frames, and a
/// Stop given as an internal frame may not precede its Start's internal
/// frame. Positions of different kinds cannot be compared without the
/// downstream timeline; a command that lands before an earlier one is
/// applied late with a warning on the pipeline thread.
pub struct ProducerHandle {
    commands: Sender<ProducerCommand>,
    started: bool,
    last_time: Option<i64>,
    last_frame: Option<Fixed>,
    /// Internal frame of the outstanding Start.
    start_frame: Option<Fixed>,
}

impl ProducerHandle {
    pub fn start(&mut self, command: StartCommand) -> Result<(), CommandError> {
        if self.started {
            return Err(CommandError::NotAlternating { expected: "stop" });
        }
        let (time, frame) = match command.start_position {
            StartPosition::PresentationTime(time) => (Some(self.check_time(time)?), None),
            StartPosition::DownstreamFrame(frame) => (None, Some(self.check_frame(frame)?)),
        };
        let start_frame = command.start_frame;
        self.commands
            .send(ProducerCommand::Start(command))
            .map_err(|_| CommandError::Disconnected)?;
        self.commit(time, frame);
        self.start_frame = Some(start_frame);
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self, command: StopCommand) -> Result<(), CommandError> {
        if !self.started {
            return Err(CommandError::NotAlternating { expected: "start" });
        }
        let (time, frame) = match command.stop_position {
            StopPosition::PresentationTime(time) => (Some(self.check_time(time)?), None),
            StopPosition::DownstreamFrame(frame) => (None, Some(self.check_frame(frame)?)),
            StopPosition::InternalFrame(frame) => {
                if let Some(previous) = self.start_frame.filter(|start| frame < *start) {
                    return Err(CommandError::FrameWentBackward { frame, previous });
                }
                (None, None)
            }
        };
        self.commands
            .send(ProducerCommand::Stop(command))
            .map_err(|_| CommandError::Disconnected)?;
        self.commit(time, frame);
        self.start_frame = None;
        self.started = false;
        Ok(())
    }

    fn check_time(&self, time: i64) -> Result<i64, CommandError> {
        match self.last_time {
            Some(previous) if time < previous => {
                Err(CommandError::TimeWentBackward { time, previous })
            }
            _ => Ok(time),
        }
    }

    fn check_frame(&self, frame: Fixed) -> Result<Fixed, CommandError> {
        match self.last_frame {
            Some(previous) if frame < previous => {
                Err(CommandError::FrameWentBackward { frame, previous })
            }
            _ => Ok(frame),
        }
    }

    fn commit(&mut self, time: Option<i64>, frame: Option<Fixed>) {
        if time.is_some() {
            self.last_time = time;
        }
        if frame.is_some() {
            self.last_frame = frame;
        }
    }
}

/// Stage logic behind `ProducerStage`
pub struct Producer {
    name: String,
    internal: BoxedStage,
    commands: Receiver<ProducerCommand>,
    pending: VecDeque<ProducerCommand>,
    /// `internal - downstream` while started.
    offset: Option<Fixed>,
    downstream_timeline: Option<TimelineFunction>,
    position: Option<Fixed>,
}

pub type ProducerStage = Stage<Producer>;

impl Producer {
    /// Wraps `internal`; the producer adopts its format and reference clock.
    pub fn create(name: impl Into<String>, internal: BoxedStage) -> (ProducerStage, ProducerHandle) {
        let name = name.into();
        let args = StageArgs::new(name.clone(), internal.format())
            .with_reference_clock(internal.reference_clock());
        let (tx, rx) = channel::unbounded();
        let producer = Producer {
            name,
            internal,
            commands: rx,
            pending: VecDeque::new(),
            offset: None,
            downstream_timeline: None,
            position: None,
        };
        let handle = ProducerHandle {
            commands: tx,
            started: false,
            last_time: None,
            last_frame: None,
            start_frame: None,
        };
        (Stage::new(args, producer), handle)
    }

    pub fn is_started(&self) -> bool {
        self.offset.is_some()
    }

    pub fn internal(&self) -> &dyn PipelineStage {
        self.internal.as_ref()
    }

    fn time_to_frame(&self, time: i64) -> Option<Fixed> {
        self.downstream_timeline
            .map(|tl| Fixed::from_raw(tl.apply(time)))
    }

    /// Downstream frame at which the front pending command applies, or
    /// `None` if it cannot be placed yet.
    fn next_boundary(&self) -> Option<Fixed> {
        match self.pending.front()? {
            ProducerCommand::Start(start) => match start.start_position {
                StartPosition::PresentationTime(time) => self.time_to_frame(time),
                StartPosition::DownstreamFrame(frame) => Some(frame),
            },
            ProducerCommand::Stop(stop) => match stop.stop_position {
                StopPosition::PresentationTime(time) => self.time_to_frame(time),
                StopPosition::DownstreamFrame(frame) => Some(frame),
                StopPosition::InternalFrame(frame) => match self.offset {
                    Some(offset) => Some(frame - offset),
                    None => Some(Fixed::MIN),
                },
            },
        }
    }

    /// Applies every pending command whose boundary is at or before `frame`.
    fn apply_due_commands(&mut self, frame: Fixed) {
        while let Some(boundary) = self.next_boundary() {
            if boundary > frame {
                break;
            }
            if let Some(position) = self.position {
                if boundary < position {
                    log::warn!(
                        "{}: command for frame {:?} applied late at {:?}",
                        self.name,
                        boundary,
                        position
                    );
                }
            }
            match self.pending.pop_front() {
                Some(ProducerCommand::Start(start)) => self.apply_start(start, boundary),
                Some(ProducerCommand::Stop(stop)) => self.apply_stop(stop, boundary),
                None => break,
            }
        }
    }

    fn applied_at(&self, downstream_frame: Fixed, internal_frame: Fixed) -> AppliedAt {
        AppliedAt {
            presentation_time: self
                .downstream_timeline
                .map(|tl| tl.apply_inverse(downstream_frame.raw())),
            downstream_frame,
            internal_frame,
        }
    }

    fn apply_start(&mut self, command: StartCommand, boundary: Fixed) {
        let offset = command.start_frame - boundary;
        self.offset = Some(offset);
        self.update_internal_timeline();
        log::debug!(
            "{}: started at downstream {:?} = internal {:?}",
            self.name,
            boundary,
            command.start_frame
        );
        if let Some(callback) = command.callback {
            callback(self.applied_at(boundary, command.start_frame));
        }
    }

    fn apply_stop(&mut self, command: StopCommand, boundary: Fixed) {
        let Some(offset) = self.offset.take() else {
            log::warn!("{}: stop while already stopped", self.name);
            return;
        };
        self.update_internal_timeline();
        log::debug!("{}: stopped at downstream {:?}", self.name, boundary);
        if let Some(callback) = command.callback {
            callback(self.applied_at(boundary, boundary + offset));
        }
    }

    fn update_internal_timeline(&mut self) {
        let internal = match (self.downstream_timeline, self.offset) {
            (Some(tl), Some(offset)) => Some(TimelineFunction::new(
                tl.subject_time() + offset.raw(),
                tl.reference_time(),
                tl.rate(),
            )),
            _ => None,
        };
        self.internal.update_presentation_time_to_frac_frame(internal);
    }

    /// The internal request covering downstream `[start, end)`, clamped to
    /// the internal source's readable range.
    fn internal_request(&self, start: Fixed, end: Fixed, offset: Fixed) -> Option<(Fixed, i64)> {
        let mut internal_start = start + offset;
        if let Some(next) = self.internal.next_readable_frame() {
            internal_start = internal_start.max(next);
        }
        let count = (end + offset - internal_start).floor();
        (count > 0).then_some((internal_start, count))
    }

    /// True if the internal source has data in downstream `[start, end)`.
    /// Nothing is consumed.
    fn has_data(&mut self, ctx: &mut MixJobContext, start: Fixed, end: Fixed, offset: Fixed) -> bool {
        let Some((internal_start, count)) = self.internal_request(start, end, offset) else {
            return false;
        };
        match self.internal.read(ctx, internal_start, count) {
            Some(mut packet) => {
                packet.set_frames_consumed(0);
                true
            }
            None => false,
        }
    }
}

impl StageImpl for Producer {
    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.pending.push_back(command);
        }
    }

    fn advance_self_impl(&mut self, frame: Fixed) {
        self.apply_due_commands(frame);
        self.position = Some(frame);
    }

    fn advance_sources_impl(&mut self, ctx: &mut MixJobContext, frame: Fixed) {
        if let Some(offset) = self.offset {
            self.internal.advance(ctx, frame + offset);
        }
    }

    fn read_impl(
        &mut self,
        ctx: &mut MixJobContext,
        start_frame: Fixed,
        frame_count: i64,
    ) -> Option<ImplPacket<'_>> {
        let end = start_frame + frame_count;
        let mut position = start_frame;

        // Walk command boundaries inside the request to the first started
        // span that has data.
        let (span_start, span_end, offset) = loop {
            self.apply_due_commands(position);
            let boundary = self.next_boundary().filter(|b| *b < end);
            match (self.offset, boundary) {
                (None, Some(boundary)) => position = boundary,
                (None, None) => return None,
                (Some(offset), None) => break (position, end, offset),
                (Some(offset), Some(boundary)) => {
                    if self.has_data(ctx, position, boundary, offset) {
                        break (position, boundary, offset);
                    }
                    position = boundary;
                }
            }
        };

        let (internal_start, count) = self.internal_request(span_start, span_end, offset)?;
        let packet = self.internal.read(ctx, internal_start, count)?;
        let downstream_start = packet.start() - offset;
        Some(ImplPacket::forward(packet, Some(downstream_start)))
    }

    fn update_presentation_time_to_frac_frame(&mut self, f: Option<TimelineFunction>) {
        self.downstream_timeline = f;
        self.update_internal_timeline();
    }

    fn set_thread(&mut self, slot: &ThreadSlot) {
        self.internal.set_thread(slot.clone());
    }
}
