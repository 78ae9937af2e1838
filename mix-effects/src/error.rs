//! Effect processor error types

use thiserror::Error;

/// Rejected processor negotiation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("block_size_frames must be positive, got {0}")]
    InvalidBlockSize(i64),
    #[error("max_frames_per_call {max_frames_per_call} is not a positive multiple of block_size_frames {block_size_frames}")]
    InvalidMaxFramesPerCall {
        max_frames_per_call: i64,
        block_size_frames: i64,
    },
    #[error("{field} must not be negative, got {value}")]
    NegativeFrames { field: &'static str, value: i64 },
    #[error("{name} range [{offset}, {offset}+{size}) exceeds memory of {memory_len} bytes")]
    RangeOutOfBounds {
        name: &'static str,
        offset: usize,
        size: usize,
        memory_len: usize,
    },
    #[error("{name} range holds {size} bytes, need {required}")]
    RangeTooSmall {
        name: &'static str,
        size: usize,
        required: usize,
    },
    #[error("input and output ranges overlap without being identical")]
    PartialOverlap,
    #[error("input rate {input} does not match output rate {output}")]
    RateMismatch { input: u32, output: u32 },
    #[error("{0} format must be 32-bit float")]
    NotFloat(&'static str),
}

/// A failed `process` call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("effect processor disconnected")]
    Disconnected,
    #[error("cannot process {frames} frames (max {max_frames_per_call})")]
    InvalidFrameCount {
        frames: i64,
        max_frames_per_call: i64,
    },
    #[error("processor reported error: {0}")]
    Kernel(String),
}
