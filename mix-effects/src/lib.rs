//! Mix Effects - synchronous effect processor boundary
//!
//! Shared-memory wire contract and processors for effects that run outside
//! the mixing thread.
//!
//! Key features:
//! - Validated input/output buffer negotiation (in-place or separate)
//! - Blocking request/response processor on a dedicated thread
//! - Per-call wall/cpu/queue metrics

pub mod config;
pub mod error;
pub mod kernels;
pub mod processor;

pub use config::*;
pub use error::*;
pub use kernels::*;
pub use processor::*;
