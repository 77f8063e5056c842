//! VRAM management for a GPU driver: buffer objects compete for a fixed pool of
//! device blocks under an adaptive (CAR) replacement policy, are shared through
//! per-client handles and global names, and stay pinned while fenced GPU work
//! references them.

pub mod error;
pub mod hw;
pub mod mm;
pub mod utils;

pub use error::{MmError, MmResult};
pub use mm::bo::{CacheClass, ChannelBinding, Domain};
pub use mm::cache::{CacheStats, Placement};
pub use mm::device::{Device, DeviceBuilder, DeviceConfig, DeviceStats, ObjectInfo, Submission};
pub use mm::fence::{ChannelId, RetireWorker};
pub use mm::gem::{FileContext, GemObject};
