//! Clock snapshots taken once per mix job
//!
//! Stages never read a clock directly. Every conversion between a stage's
//! reference clock and the system monotonic clock goes through the snapshot
//! carried by the `MixJobContext`, so all stages in one job agree.

use crate::timeline::TimelineFunction;
use std::collections::HashMap;

/// Opaque identity of a reference clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockId(pub u64);

impl ClockId {
    /// The system monotonic clock.
    pub const MONOTONIC: ClockId = ClockId(0);
}

/// Relationship between one reference clock and the monotonic clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSnapshot {
    id: ClockId,
    to_clock_mono: TimelineFunction,
    generation: u64,
}

impl ClockSnapshot {
    /// `to_clock_mono` maps reference-clock time to monotonic time.
    pub fn new(id: ClockId, to_clock_mono: TimelineFunction, generation: u64) -> Self {
        assert!(
            to_clock_mono.invertible(),
            "clock {:?} has a non-invertible mapping",
            id
        );
        Self {
            id,
            to_clock_mono,
            generation,
        }
    }

    pub fn id(&self) -> ClockId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn to_clock_mono(&self) -> TimelineFunction {
        self.to_clock_mono
    }

    pub fn reference_time_to_mono(&self, reference_time: i64) -> i64 {
        self.to_clock_mono.apply(reference_time)
    }

    pub fn mono_to_reference_time(&self, mono_time: i64) -> i64 {
        self.to_clock_mono.apply_inverse(mono_time)
    }
}

/// Snapshots of every clock a graph may reference
#[derive(Debug, Clone)]
pub struct ClockSnapshots {
    snapshots: HashMap<ClockId, ClockSnapshot>,
}

impl ClockSnapshots {
    /// A set containing only the monotonic clock.
    pub fn new() -> Self {
        let mut snapshots = HashMap::new();
        snapshots.insert(
            ClockId::MONOTONIC,
            ClockSnapshot::new(ClockId::MONOTONIC, TimelineFunction::identity(), 0),
        );
        Self { snapshots }
    }

    pub fn insert(&mut self, snapshot: ClockSnapshot) {
        self.snapshots.insert(snapshot.id(), snapshot);
    }

    /// # Panics
    /// If no snapshot was taken for `clock`; a graph must never reference an
    /// unknown clock.
    pub fn snapshot_for(&self, clock: ClockId) -> &ClockSnapshot {
        match self.snapshots.get(&clock) {
            Some(snapshot) => snapshot,
            None => panic!("no snapshot for clock {:?}", clock),
        }
    }

    /// Translates a time on clock `from` to the equivalent time on clock `to`.
    pub fn translate(&self, from: ClockId, to: ClockId, time: i64) -> i64 {
        if from == to {
            return time;
        }
        let mono = self.snapshot_for(from).reference_time_to_mono(time);
        self.snapshot_for(to).mono_to_reference_time(mono)
    }
}

impl Default for ClockSnapshots {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::TimelineRate;

    #[test]
    fn test_monotonic_is_identity() {
        let clocks = ClockSnapshots::new();
        let mono = clocks.snapshot_for(ClockId::MONOTONIC);
        assert_eq!(mono.reference_time_to_mono(1234), 1234);
        assert_eq!(mono.mono_to_reference_time(1234), 1234);
    }

    #[test]
    fn test_translate_between_offset_clocks() {
        let mut clocks = ClockSnapshots::new();
        // Clock 1 reads 500ns ahead of monotonic.
        clocks.insert(ClockSnapshot::new(
            ClockId(1),
            TimelineFunction::new(0, 500, TimelineRate::IDENTITY),
            1,
        ));
        assert_eq!(clocks.translate(ClockId(1), ClockId::MONOTONIC, 1_500), 1_000);
        assert_eq!(clocks.translate(ClockId::MONOTONIC, ClockId(1), 1_000), 1_500);
        assert_eq!(clocks.translate(ClockId(1), ClockId(1), 42), 42);
    }

    #[test]
    #[should_panic(expected = "no snapshot for clock")]
    fn test_unknown_clock_panics() {
        let clocks = ClockSnapshots::new();
        clocks.snapshot_for(ClockId(99));
    }
}
