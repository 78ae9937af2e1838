//! Mix Core - frame timeline and pipeline-stage protocol
//!
//! Building blocks shared by every mixing stage.
//!
//! Key features:
//! - Fixed-point fractional frame positions
//! - Affine presentation-time to frame timelines
//! - Borrow-checked packets that release their producers on drop
//! - Packet caching and monotonic position tracking for every stage

pub mod buffer;
pub mod clock;
pub mod context;
pub mod error;
pub mod fixed;
pub mod format;
pub mod packet;
pub mod stage;
pub mod thread;
pub mod timeline;

pub use buffer::*;
pub use clock::*;
pub use context::*;
pub use error::*;
pub use fixed::*;
pub use format::*;
pub use packet::*;
pub use stage::*;
pub use thread::*;
pub use timeline::*;
