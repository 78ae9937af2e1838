//! PCM stream formats

use crate::error::FormatError;
use crate::fixed::FRAC_BITS;
use crate::timeline::TimelineRate;

/// Sample encoding within a frame
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    Uint8 = 1,     // Unsigned 8-bit, silence is 0x80
    Int16 = 2,     // Signed 16-bit
    Int24In32 = 3, // Signed 24-bit, left-justified in 32 bits
    Int32 = 4,     // Signed 32-bit
    Float32 = 5,   // 32-bit float (mix format)
}

impl SampleType {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleType::Uint8 => 1,
            SampleType::Int16 => 2,
            SampleType::Int24In32 | SampleType::Int32 | SampleType::Float32 => 4,
        }
    }

    /// Byte pattern that encodes a zero-valued sample.
    pub fn silence_byte(self) -> u8 {
        match self {
            SampleType::Uint8 => 0x80,
            _ => 0,
        }
    }
}

/// Sample type, channel count and frame rate of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Format {
    sample_type: SampleType,
    channels: usize,
    frames_per_second: u32,
}

pub const MAX_CHANNELS: usize = 64;
pub const MAX_FRAMES_PER_SECOND: u32 = 768_000;

impl Format {
    pub fn new(
        sample_type: SampleType,
        channels: usize,
        frames_per_second: u32,
    ) -> Result<Self, FormatError> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(FormatError::InvalidChannels(channels));
        }
        if frames_per_second == 0 || frames_per_second > MAX_FRAMES_PER_SECOND {
            return Err(FormatError::InvalidFrameRate(frames_per_second));
        }
        Ok(Self {
            sample_type,
            channels,
            frames_per_second,
        })
    }

    /// Float32 format; panics on an invalid shape.
    pub fn float(channels: usize, frames_per_second: u32) -> Self {
        match Self::new(SampleType::Float32, channels, frames_per_second) {
            Ok(format) => format,
            Err(err) => panic!("invalid float format: {}", err),
        }
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames_per_second(&self) -> u32 {
        self.frames_per_second
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.sample_type.bytes_per_sample() * self.channels
    }

    pub fn bytes_for_frames(&self, frames: i64) -> usize {
        debug_assert!(frames >= 0);
        frames as usize * self.bytes_per_frame()
    }

    pub fn is_float(&self) -> bool {
        self.sample_type == SampleType::Float32
    }

    /// Rate of `Fixed` raw units per nanosecond.
    pub fn frac_frames_per_ns(&self) -> TimelineRate {
        TimelineRate::new(
            (self.frames_per_second as u64) << FRAC_BITS,
            1_000_000_000,
        )
    }

    /// Rate of integral frames per nanosecond.
    pub fn frames_per_ns(&self) -> TimelineRate {
        TimelineRate::new(self.frames_per_second as u64, 1_000_000_000)
    }
}

impl Default for Format {
    fn default() -> Self {
        Self {
            sample_type: SampleType::Float32,
            channels: 2,
            frames_per_second: 48_000,
        }
    }
}

/// Normalizes one sample from `bytes` (native endian) to `[-1.0, 1.0]`.
///
/// `bytes` must hold exactly one sample of `sample_type`.
pub fn sample_to_f32(sample_type: SampleType, bytes: &[u8]) -> f32 {
    match sample_type {
        SampleType::Uint8 => (bytes[0] as f32 - 128.0) / 128.0,
        SampleType::Int16 => i16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / 32_768.0,
        SampleType::Int24In32 | SampleType::Int32 => {
            i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleType::Float32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}
