//! Frame rendering: compositing timeline snapshots into premultiplied RGBA frames.

/// Separable premultiplied blur and blurred cover backgrounds.
pub mod blur;
/// Premultiplied source-over compositing.
pub mod composite;
/// Aspect-preserving fit rectangles.
pub mod letterbox;
/// Timeline snapshot compositor.
pub mod renderer;
/// Reusable compositing target and the frame type handed to encoders.
pub mod surface;
/// Text rasterization.
pub mod text;
/// Black-frame verification.
pub mod verify;

pub use renderer::{ActiveElement, FrameRenderer, FrameReport, RenderStats, resolve_active_elements};
pub use surface::{FrameRGBA, Surface};
pub use text::TextRasterizer;
pub use verify::{BlackFrameDetector, FrameVerdict};
