//! Error types for stage construction and cross-thread commands

use mix_core::{Fixed, Format};
use mix_effects::ConfigError;
use thiserror::Error;

/// A command rejected before it reached the pipeline thread
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("stage has been dropped")]
    Disconnected,
    #[error("expected a {expected} command")]
    NotAlternating { expected: &'static str },
    #[error("command time {time} precedes previous command time {previous}")]
    TimeWentBackward { time: i64, previous: i64 },
    #[error("command frame {frame:?} precedes previous command frame {previous:?}")]
    FrameWentBackward { frame: Fixed, previous: Fixed },
    #[error("gain command queue is full")]
    QueueFull,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CustomStageError {
    #[error("invalid processor config: {0}")]
    Config(#[from] ConfigError),
    #[error("source format {source_format:?} does not match processor input {input:?}")]
    SourceFormatMismatch { source_format: Format, input: Format },
}
