//! Error types for the pipeline core

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("invalid channel count: {0}")]
    InvalidChannels(usize),
    #[error("invalid frame rate: {0} frames/s")]
    InvalidFrameRate(u32),
}
