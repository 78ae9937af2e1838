//! Shared gain controls
//!
//! A `GainControl` holds the current `{gain_db, muted}` state plus changes
//! scheduled at reference-clock times. Client threads enqueue changes through
//! a `GainControlHandle`; the mixer drains them on the pipeline thread and
//! applies them as it advances.

use crate::error::CommandError;
use crossbeam_queue::ArrayQueue;
use mix_core::{ClockId, GainControlId};
use std::sync::Arc;

/// At or below this gain a control is silent.
pub const MUTED_GAIN_DB: f32 = -160.0;

/// Highest gain a control accepts.
pub const MAX_GAIN_DB: f32 = 24.0;

/// Converts decibels to a linear scale. 0 dB is exactly 1.0.
pub fn db_to_scale(gain_db: f32) -> f32 {
    if gain_db <= MUTED_GAIN_DB {
        0.0
    } else if gain_db == 0.0 {
        1.0
    } else {
        10f32.powf(gain_db / 20.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainState {
    pub gain_db: f32,
    pub muted: bool,
}

impl GainState {
    pub fn scale(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            db_to_scale(self.gain_db)
        }
    }
}

impl Default for GainState {
    fn default() -> Self {
        Self {
            gain_db: 0.0,
            muted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainChange {
    SetGain(f32),
    SetMute(bool),
}

impl GainChange {
    fn apply_to(self, state: &mut GainState) {
        match self {
            GainChange::SetGain(gain_db) => state.gain_db = gain_db.min(MAX_GAIN_DB),
            GainChange::SetMute(muted) => state.muted = muted,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GainCommand {
    change: GainChange,
    /// Reference time to apply at; `None` applies at the next advance.
    at: Option<i64>,
}

/// Client-side handle for one gain control
#[derive(Debug, Clone)]
pub struct GainControlHandle {
    id: GainControlId,
    commands: Arc<ArrayQueue<GainCommand>>,
}

impl GainControlHandle {
    pub fn id(&self) -> GainControlId {
        self.id
    }

    pub fn set_gain(&self, gain_db: f32, at: Option<i64>) -> Result<(), CommandError> {
        self.push(GainChange::SetGain(gain_db), at)
    }

    pub fn set_mute(&self, muted: bool, at: Option<i64>) -> Result<(), CommandError> {
        self.push(GainChange::SetMute(muted), at)
    }

    fn push(&self, change: GainChange, at: Option<i64>) -> Result<(), CommandError> {
        self.commands
            .push(GainCommand { change, at })
            .map_err(|_| CommandError::QueueFull)
    }
}

/// Gain state owned by the pipeline thread
#[derive(Debug)]
pub struct GainControl {
    id: GainControlId,
    reference_clock: ClockId,
    state: GainState,
    /// Sorted by time; equal times keep arrival order.
    scheduled: Vec<(i64, GainChange)>,
    commands: Arc<ArrayQueue<GainCommand>>,
}

impl GainControl {
    /// Creates a control whose schedule is keyed by `reference_clock` time.
    /// At most `queue_depth` commands may be pending between drains.
    pub fn new(
        id: GainControlId,
        reference_clock: ClockId,
        queue_depth: usize,
    ) -> (GainControl, GainControlHandle) {
        let commands = Arc::new(ArrayQueue::new(queue_depth.max(1)));
        let control = GainControl {
            id,
            reference_clock,
            state: GainState::default(),
            scheduled: Vec::new(),
            commands: commands.clone(),
        };
        (control, GainControlHandle { id, commands })
    }

    pub fn id(&self) -> GainControlId {
        self.id
    }

    pub fn reference_clock(&self) -> ClockId {
        self.reference_clock
    }

    pub fn state(&self) -> GainState {
        self.state
    }

    /// Moves queued commands in. Immediate changes take effect here, so the
    /// next read already mixes with them.
    pub fn drain_commands(&mut self) {
        let mut changed = false;
        while let Some(command) = self.commands.pop() {
            match command.at {
                None => {
                    command.change.apply_to(&mut self.state);
                    changed = true;
                }
                Some(at) => {
                    let index = self.scheduled.partition_point(|(t, _)| *t <= at);
                    self.scheduled.insert(index, (at, command.change));
                }
            }
        }
        if changed {
            log::debug!("gain control {:?} now {:?}", self.id, self.state);
        }
    }

    /// Applies every scheduled change at or before `reference_time`.
    pub fn advance(&mut self, reference_time: i64) {
        let due = self.scheduled.partition_point(|(t, _)| *t <= reference_time);
        for (_, change) in self.scheduled.drain(..due) {
            change.apply_to(&mut self.state);
        }
        if due > 0 {
            log::debug!("gain control {:?} now {:?}", self.id, self.state);
        }
    }

    /// The state in effect at `reference_time`, counting scheduled changes
    /// not yet applied.
    pub fn state_at(&self, reference_time: i64) -> GainState {
        let mut state = self.state;
        for (_, change) in self.scheduled.iter().take_while(|(t, _)| *t <= reference_time) {
            change.apply_to(&mut state);
        }
        state
    }

    /// Times of scheduled changes in `(after, before)`.
    pub fn changes_between(&self, after: i64, before: i64) -> impl Iterator<Item = i64> + '_ {
        self.scheduled
            .iter()
            .map(|(t, _)| *t)
            .skip_while(move |t| *t <= after)
            .take_while(move |t| *t < before)
    }
}
