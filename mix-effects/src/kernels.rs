//! Built-in effect kernels

use crate::config::ProcessOptions;
use crate::error::ProcessError;
use crate::processor::EffectKernel;
use std::collections::VecDeque;

/// Multiplies every sample by a constant
#[derive(Debug, Clone)]
pub struct GainKernel {
    channels: usize,
    scale: f32,
}

impl GainKernel {
    pub fn new(channels: usize, scale: f32) -> Self {
        Self { channels, scale }
    }
}

impl EffectKernel for GainKernel {
    fn name(&self) -> &str {
        "gain"
    }

    fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        num_frames: usize,
        _options: &ProcessOptions,
    ) -> Result<(), ProcessError> {
        let samples = num_frames * self.channels;
        for (out, sample) in output[..samples].iter_mut().zip(&input[..samples]) {
            *out = sample * self.scale;
        }
        Ok(())
    }
}

/// Delays its input by a fixed number of frames
///
/// Emits `latency_frames` frames of silence before the first input frame,
/// which makes it a convenient stand-in for any effect with latency.
#[derive(Debug, Clone)]
pub struct DelayKernel {
    channels: usize,
    history: VecDeque<f32>,
}

impl DelayKernel {
    pub fn new(channels: usize, latency_frames: usize) -> Self {
        Self {
            channels,
            history: std::iter::repeat(0.0)
                .take(latency_frames * channels)
                .collect(),
        }
    }
}

impl EffectKernel for DelayKernel {
    fn name(&self) -> &str {
        "delay"
    }

    fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        num_frames: usize,
        _options: &ProcessOptions,
    ) -> Result<(), ProcessError> {
        let samples = num_frames * self.channels;
        self.history.extend(&input[..samples]);
        for out in output[..samples].iter_mut() {
            *out = self.history.pop_front().unwrap_or(0.0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_kernel() {
        let mut kernel = GainKernel::new(2, -1.0);
        let mut output = [0.0; 4];
        kernel
            .process(&[0.25, 0.5, 0.75, 1.0], &mut output, 2, &ProcessOptions::default())
            .unwrap();
        assert_eq!(output, [-0.25, -0.5, -0.75, -1.0]);
    }

    #[test]
    fn test_delay_kernel_stereo() {
        let mut kernel = DelayKernel::new(2, 1);
        let mut output = [9.0; 4];
        kernel
            .process(&[1.0, 2.0, 3.0, 4.0], &mut output, 2, &ProcessOptions::default())
            .unwrap();
        assert_eq!(output, [0.0, 0.0, 1.0, 2.0], "one frame of delay on both channels");
    }

    #[test]
    fn test_zero_latency_is_passthrough() {
        let mut kernel = DelayKernel::new(1, 0);
        let mut output = [0.0; 3];
        kernel
            .process(&[1.0, 2.0, 3.0], &mut output, 3, &ProcessOptions::default())
            .unwrap();
        assert_eq!(output, [1.0, 2.0, 3.0]);
    }
}
