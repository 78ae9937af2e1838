//! Effect processor wire contract
//!
//! Negotiated once when an effect is attached: where the input and output
//! samples live, how many frames one call may process, and how much latency
//! and ring-out the effect adds.

use crate::error::ConfigError;
use mix_core::{AlignedBuffer, Format};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Memory shared between a stage and its effect processor
///
/// The mutex stands in for the flush/invalidate pair a real cross-process
/// mapping needs: whoever holds the guard sees the other side's writes.
#[derive(Debug)]
pub struct SharedMemory {
    buffer: Mutex<AlignedBuffer>,
    len: usize,
}

impl SharedMemory {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(AlignedBuffer::zeroed(len)),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lock(&self) -> MutexGuard<'_, AlignedBuffer> {
        self.buffer.lock()
    }
}

/// A byte range within a `SharedMemory`
#[derive(Debug, Clone)]
pub struct BufferRange {
    pub memory: Arc<SharedMemory>,
    pub offset: usize,
    pub size: usize,
}

impl BufferRange {
    pub fn new(memory: Arc<SharedMemory>, offset: usize, size: usize) -> Self {
        Self {
            memory,
            offset,
            size,
        }
    }

    /// A range covering all of a fresh `len`-byte memory.
    pub fn allocate(len: usize) -> Self {
        Self::new(SharedMemory::new(len), 0, len)
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// True if both ranges refer to exactly the same bytes (in-place processing).
    pub fn is_same_as(&self, other: &BufferRange) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
            && self.offset == other.offset
            && self.size == other.size
    }

    fn overlaps(&self, other: &BufferRange) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
            && self.offset < other.end()
            && other.offset < self.end()
    }

    fn validate(&self, name: &'static str, required: usize) -> Result<(), ConfigError> {
        if self.end() > self.memory.len() {
            return Err(ConfigError::RangeOutOfBounds {
                name,
                offset: self.offset,
                size: self.size,
                memory_len: self.memory.len(),
            });
        }
        if self.size < required {
            return Err(ConfigError::RangeTooSmall {
                name,
                size: self.size,
                required,
            });
        }
        Ok(())
    }
}

/// Negotiated processor configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub input: BufferRange,
    pub output: BufferRange,
    pub input_format: Format,
    pub output_format: Format,
    pub block_size_frames: i64,
    pub max_frames_per_call: i64,
    pub latency_frames: i64,
    pub ring_out_frames: i64,
}

impl ProcessorConfig {
    /// Config with freshly allocated, separate input and output buffers sized
    /// for `max_frames_per_call`.
    pub fn with_buffers(
        input_format: Format,
        output_format: Format,
        block_size_frames: i64,
        max_frames_per_call: i64,
    ) -> Self {
        let frames = max_frames_per_call.max(0);
        Self {
            input: BufferRange::allocate(input_format.bytes_for_frames(frames)),
            output: BufferRange::allocate(output_format.bytes_for_frames(frames)),
            input_format,
            output_format,
            block_size_frames,
            max_frames_per_call,
            latency_frames: 0,
            ring_out_frames: 0,
        }
    }

    /// Config processing in place: input and output share one range.
    pub fn in_place(format: Format, block_size_frames: i64, max_frames_per_call: i64) -> Self {
        let range = BufferRange::allocate(format.bytes_for_frames(max_frames_per_call.max(0)));
        Self {
            input: range.clone(),
            output: range,
            input_format: format,
            output_format: format,
            block_size_frames,
            max_frames_per_call,
            latency_frames: 0,
            ring_out_frames: 0,
        }
    }

    pub fn with_latency(mut self, latency_frames: i64) -> Self {
        self.latency_frames = latency_frames;
        self
    }

    pub fn with_ring_out(mut self, ring_out_frames: i64) -> Self {
        self.ring_out_frames = ring_out_frames;
        self
    }

    pub fn is_in_place(&self) -> bool {
        self.input.is_same_as(&self.output)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size_frames <= 0 {
            return Err(ConfigError::InvalidBlockSize(self.block_size_frames));
        }
        if self.max_frames_per_call <= 0 || self.max_frames_per_call % self.block_size_frames != 0 {
            return Err(ConfigError::InvalidMaxFramesPerCall {
                max_frames_per_call: self.max_frames_per_call,
                block_size_frames: self.block_size_frames,
            });
        }
        for (field, value) in [
            ("latency_frames", self.latency_frames),
            ("ring_out_frames", self.ring_out_frames),
        ] {
            if value < 0 {
                return Err(ConfigError::NegativeFrames { field, value });
            }
        }
        if !self.input_format.is_float() {
            return Err(ConfigError::NotFloat("input"));
        }
        if !self.output_format.is_float() {
            return Err(ConfigError::NotFloat("output"));
        }
        if self.input_format.frames_per_second() != self.output_format.frames_per_second() {
            return Err(ConfigError::RateMismatch {
                input: self.input_format.frames_per_second(),
                output: self.output_format.frames_per_second(),
            });
        }

        let frames = self.max_frames_per_call;
        self.input
            .validate("input", self.input_format.bytes_for_frames(frames))?;
        self.output
            .validate("output", self.output_format.bytes_for_frames(frames))?;

        if self.input.overlaps(&self.output) && !self.is_in_place() {
            return Err(ConfigError::PartialOverlap);
        }
        Ok(())
    }
}

/// Per-call options passed alongside `process`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOptions {
    /// Gain already applied upstream of the effect, in dB.
    pub total_applied_gain_db: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo() -> Format {
        Format::float(2, 48_000)
    }

    #[test]
    fn test_valid_configs() {
        let config = ProcessorConfig::with_buffers(stereo(), stereo(), 10, 480);
        assert!(config.validate().is_ok());
        assert!(!config.is_in_place());

        let config = ProcessorConfig::in_place(stereo(), 1, 256).with_latency(32);
        assert!(config.validate().is_ok());
        assert!(config.is_in_place());
    }

    #[test]
    fn test_block_size_rules() {
        let config = ProcessorConfig::with_buffers(stereo(), stereo(), 0, 480);
        assert_eq!(config.validate(), Err(ConfigError::InvalidBlockSize(0)));

        let config = ProcessorConfig::with_buffers(stereo(), stereo(), 100, 480);
        assert!(
            matches!(config.validate(), Err(ConfigError::InvalidMaxFramesPerCall { .. })),
            "480 is not a multiple of 100"
        );
    }

    #[test]
    fn test_range_too_small() {
        let mut config = ProcessorConfig::with_buffers(stereo(), stereo(), 10, 100);
        config.output = BufferRange::allocate(16);
        assert_eq!(
            config.validate(),
            Err(ConfigError::RangeTooSmall {
                name: "output",
                size: 16,
                required: 800,
            })
        );
    }

    #[test]
    fn test_range_out_of_bounds() {
        let mut config = ProcessorConfig::with_buffers(stereo(), stereo(), 10, 10);
        config.input = BufferRange::new(SharedMemory::new(80), 8, 80);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RangeOutOfBounds { name: "input", .. })
        ));
    }

    #[test]
    fn test_partial_overlap_rejected() {
        let memory = SharedMemory::new(1024);
        let mut config = ProcessorConfig::with_buffers(stereo(), stereo(), 10, 10);
        config.input = BufferRange::new(memory.clone(), 0, 80);
        config.output = BufferRange::new(memory, 40, 80);
        assert_eq!(config.validate(), Err(ConfigError::PartialOverlap));
    }

    #[test]
    fn test_format_rules() {
        let int16 = Format::new(mix_core::SampleType::Int16, 2, 48_000).unwrap();
        let config = ProcessorConfig::with_buffers(int16, stereo(), 10, 10);
        assert_eq!(config.validate(), Err(ConfigError::NotFloat("input")));

        let config = ProcessorConfig::with_buffers(stereo(), Format::float(2, 44_100), 10, 10);
        assert!(matches!(config.validate(), Err(ConfigError::RateMismatch { .. })));

        let config = ProcessorConfig::with_buffers(stereo(), stereo(), 10, 10).with_latency(-1);
        assert!(matches!(config.validate(), Err(ConfigError::NegativeFrames { .. })));
    }
}
