//! reelcast composites a timeline of media and text into frames and exports them through one of
//! several interchangeable encoder backends.
//!
//! The usual entry point is [`ExportEngine`]:
//!
//! - Describe the timeline as a [`Project`] and its assets through a [`MediaCatalog`]
//! - Start a run with [`ExportEngine::start_export`] and observe it through [`ExportRun`]
//! - Collect the encoded bytes from the terminal [`ExportOutcome`]
#![forbid(unsafe_code)]

/// Process-level tunables.
pub mod config;
/// Encoder backends and the contract they share.
pub mod encode;
/// Pre-flight memory projection.
pub mod estimate;
/// Run orchestration and the caller-facing engine.
pub mod export;
/// Host capability probing and backend selection.
pub mod factory;
/// Media probing, decoding and the handle cache.
pub mod media;
/// Read-only export inputs.
pub mod model;
/// Frame compositing.
pub mod render;
/// Discovery of the external transcoding tool.
pub mod tool;

mod foundation;

pub use crate::foundation::core::{Canvas, Fps, FrameIndex, Rect, Rgba8};
pub use crate::foundation::error::{ErrorKind, ExportError, ExportResult};

pub use crate::config::{ExportConfig, MemoryThresholds, SeekTimeoutPolicy};
pub use crate::encode::{BackendKind, EncodeConfig, EncodedOutput, EncoderBackend, FrameCollector};
pub use crate::estimate::{MemoryEstimate, MemoryEstimator, WarningLevel};
pub use crate::export::{
    CancellationToken, ExportContext, ExportEngine, ExportHistory, ExportOutcome, ExportOutput,
    ExportProgress, ExportRun, ExportState, HistoryEntry,
};
pub use crate::factory::{BackendFactory, CapabilityProbe, HostCapabilities, Recommendation};
pub use crate::media::{FsMediaLoader, MediaLoader};
pub use crate::model::media::{InMemoryCatalog, MediaCatalog, MediaId, MediaItem, MediaKind};
pub use crate::model::project::{
    Background, ElementKind, MediaElement, Project, TextElement, TextStyle, TimelineElement,
    Track, Transform,
};
pub use crate::model::settings::{BackendChoice, ExportFormat, ExportSettings, QualityTier};
pub use crate::render::{FrameRGBA, FrameRenderer};
pub use crate::tool::TranscodeTool;
