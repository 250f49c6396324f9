//! Media access: probing, frame sources, per-item decode handles, and the bounded handle cache.

pub mod cache;
pub mod handle;
pub mod probe;
pub mod source;

pub use cache::{CacheStats, MediaCache, PreloadReport};
pub use handle::{DecodeHandle, SeekOutcome};
pub use source::{FrameSource, FsMediaLoader, MediaLoader, Picture, StillImageSource};
