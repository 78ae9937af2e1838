//! Mix Stages - concrete pipeline stages
//!
//! Producers, effects, padding and mixing built on the `mix-core` stage
//! protocol, plus the thread that drives a finished graph.
//!
//! Key features:
//! - Start/stop-controlled producers over packet queues and ring buffers
//! - Latency-compensated effect stage with automatic ring-out
//! - AVX SIMD mix kernels with scheduled gain changes
//! - Lock-free command queues drained on the pipeline thread

pub mod custom;
pub mod error;
pub mod fence;
pub mod gain;
pub mod mix_kernels;
pub mod mix_thread;
pub mod mixer;
pub mod packet_queue;
pub mod producer;
pub mod ring_buffer;
pub mod silence_padding;

#[cfg(test)]
mod testing;

pub use custom::*;
pub use error::*;
pub use fence::*;
pub use gain::*;
pub use mix_kernels::*;
pub use mix_thread::*;
pub use mixer::*;
pub use packet_queue::*;
pub use producer::*;
pub use ring_buffer::*;
pub use silence_padding::*;
