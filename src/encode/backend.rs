use std::sync::Arc;
use std::time::Instant;

use crate::encode::capture::CaptureSource;
use crate::foundation::core::{Fps, FrameIndex};
use crate::foundation::error::{ExportError, ExportResult};
use crate::model::settings::{ExportFormat, QualityTier};
use crate::render::surface::FrameRGBA;

/// The encoder variants the factory can select.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Capture,
    InProcess,
    Native,
    Hardware,
}

impl BackendKind {
    pub const ALL: [Self; 4] = [Self::Capture, Self::InProcess, Self::Native, Self::Hardware];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::InProcess => "in-process",
            Self::Native => "native",
            Self::Hardware => "hardware",
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Capture => Capabilities {
                pushed_frames: false,
                capture_stream: true,
                hardware: false,
                out_of_process: false,
            },
            Self::InProcess => Capabilities {
                pushed_frames: true,
                capture_stream: false,
                hardware: false,
                out_of_process: false,
            },
            Self::Native => Capabilities {
                pushed_frames: true,
                capture_stream: false,
                hardware: false,
                out_of_process: true,
            },
            Self::Hardware => Capabilities {
                pushed_frames: true,
                capture_stream: false,
                hardware: true,
                out_of_process: true,
            },
        }
    }

    pub fn supported_formats(self) -> &'static [ExportFormat] {
        match self {
            Self::Capture => &[ExportFormat::H264],
            Self::InProcess | Self::Native => &[
                ExportFormat::Mp4,
                ExportFormat::Webm,
                ExportFormat::Mov,
                ExportFormat::H264,
            ],
            Self::Hardware => &[ExportFormat::Mp4, ExportFormat::Mov, ExportFormat::H264],
        }
    }

    pub fn supports(self, format: ExportFormat) -> bool {
        self.supported_formats().contains(&format)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "capture" => Ok(Self::Capture),
            "in-process" | "in_process" | "inprocess" => Ok(Self::InProcess),
            "native" => Ok(Self::Native),
            "hardware" => Ok(Self::Hardware),
            other => Err(ExportError::validation(format!("unknown backend '{other}'"))),
        }
    }
}

/// What a backend can consume and where it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Capabilities {
    pub pushed_frames: bool,
    pub capture_stream: bool,
    pub hardware: bool,
    pub out_of_process: bool,
}

/// Uniform progress report emitted by every backend.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct EncodeProgress {
    pub fraction_complete: f64,
    pub current_frame: u64,
    pub total_frames: u64,
    pub encode_rate_fps: f64,
}

pub type EncodeProgressFn = Arc<dyn Fn(EncodeProgress) + Send + Sync>;

/// Per-run encoder configuration handed to [`EncoderBackend::initialize`].
#[derive(Clone)]
pub struct EncodeConfig {
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub quality: QualityTier,
    pub format: ExportFormat,
    pub total_frames: u64,
    /// Background used to flatten alpha (straight RGB).
    pub background: [u8; 3],
    pub progress: Option<EncodeProgressFn>,
}

impl std::fmt::Debug for EncodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeConfig")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("fps", &self.fps)
            .field("quality", &self.quality)
            .field("format", &self.format)
            .field("total_frames", &self.total_frames)
            .field("background", &self.background)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl EncodeConfig {
    pub fn new(width: u32, height: u32, fps: Fps, format: ExportFormat, total_frames: u64) -> Self {
        Self {
            width,
            height,
            fps,
            quality: QualityTier::Medium,
            format,
            total_frames,
            background: [0, 0, 0],
            progress: None,
        }
    }

    pub fn with_quality(mut self, quality: QualityTier) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_progress(mut self, progress: EncodeProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    pub fn duration_secs(&self) -> f64 {
        self.fps.frames_to_secs(self.total_frames)
    }

    pub fn validate(&self) -> ExportResult<()> {
        if self.fps.num == 0 || self.fps.den == 0 {
            return Err(ExportError::validation("fps must be non-zero"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ExportError::validation("encoder width/height must be non-zero"));
        }
        if !self.width.is_multiple_of(2) || !self.height.is_multiple_of(2) {
            return Err(ExportError::validation(
                "encoder width/height must be even (required for 4:2:0 output)",
            ));
        }
        Ok(())
    }

    pub(crate) fn report(&self, current_frame: u64, encode_rate_fps: f64) {
        if let Some(cb) = &self.progress {
            let fraction_complete = if self.total_frames == 0 {
                1.0
            } else {
                (current_frame as f64 / self.total_frames as f64).min(1.0)
            };
            cb(EncodeProgress {
                fraction_complete,
                current_frame,
                total_frames: self.total_frames,
                encode_rate_fps,
            });
        }
    }
}

/// Encoded payload returned by [`EncoderBackend::finalize`].
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedOutput {
    pub bytes: Vec<u8>,
    pub format: ExportFormat,
    pub size_bytes: u64,
    pub duration_secs: f64,
    /// Frames the encoder consumed.
    pub frames: u64,
}

impl EncodedOutput {
    pub fn new(bytes: Vec<u8>, format: ExportFormat, frames: u64, fps: Fps) -> Self {
        Self {
            size_bytes: bytes.len() as u64,
            bytes,
            format,
            duration_secs: fps.frames_to_secs(frames),
            frames,
        }
    }
}

/// Strategy contract shared by every encoder variant.
///
/// Ordering contract: frames arrive in strictly increasing [`FrameIndex`] order and every
/// backend preserves that order in its output. `cancel` is idempotent and safe after `finalize`.
pub trait EncoderBackend: Send {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn supported_formats(&self) -> &'static [ExportFormat];

    /// Prepare codec and container state.
    ///
    /// Fails with a configuration error when the format or quality is unsupported.
    fn initialize(&mut self, cfg: EncodeConfig) -> ExportResult<()>;

    fn ingest_frame(&mut self, _idx: FrameIndex, _frame: &FrameRGBA) -> ExportResult<()> {
        Err(ExportError::configuration(format!(
            "{} backend does not accept pushed frames",
            self.name()
        )))
    }

    fn attach_capture_source(&mut self, _source: CaptureSource) -> ExportResult<()> {
        Err(ExportError::configuration(format!(
            "{} backend does not accept a capture stream",
            self.name()
        )))
    }

    /// Flush and return the encoded payload.
    fn finalize(&mut self) -> ExportResult<EncodedOutput>;

    fn cancel(&mut self);
}

/// Rejects duplicate and decreasing frame indices.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameOrder {
    last: Option<FrameIndex>,
    count: u64,
}

impl FrameOrder {
    pub fn check(&mut self, idx: FrameIndex) -> ExportResult<()> {
        if let Some(last) = self.last
            && idx <= last
        {
            return Err(ExportError::backend(format!(
                "out-of-order frame index {} after {}",
                idx.0, last.0
            )));
        }
        self.last = Some(idx);
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Average throughput since the first frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct RateMeter {
    started: Option<Instant>,
}

impl RateMeter {
    pub fn start(&mut self) {
        self.started.get_or_insert_with(Instant::now);
    }

    pub fn rate(&self, frames: u64) -> f64 {
        match self.started {
            Some(t0) => {
                let secs = t0.elapsed().as_secs_f64();
                if secs > 0.0 { frames as f64 / secs } else { 0.0 }
            }
            None => 0.0,
        }
    }
}

/// Check `cfg` against a backend's static format list.
pub(crate) fn ensure_format(
    name: &str,
    supported: &[ExportFormat],
    format: ExportFormat,
) -> ExportResult<()> {
    if supported.contains(&format) {
        return Ok(());
    }
    Err(ExportError::configuration(format!(
        "{name} backend cannot produce '{}' output",
        format.extension()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_order_rejects_repeats() {
        let mut order = FrameOrder::default();
        order.check(FrameIndex(0)).unwrap();
        order.check(FrameIndex(2)).unwrap();
        assert!(order.check(FrameIndex(2)).is_err());
        assert!(order.check(FrameIndex(1)).is_err());
        assert_eq!(order.count(), 2);
    }

    #[test]
    fn capture_only_emits_h264() {
        assert!(BackendKind::Capture.supports(ExportFormat::H264));
        assert!(!BackendKind::Capture.supports(ExportFormat::Mp4));
        assert!(!BackendKind::Hardware.supports(ExportFormat::Webm));
        assert!(BackendKind::Native.supports(ExportFormat::Webm));
    }

    #[test]
    fn odd_dimensions_are_invalid() {
        let cfg = EncodeConfig::new(63, 36, Fps::integer(30).unwrap(), ExportFormat::Mp4, 10);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn progress_is_capped_at_one() {
        use std::sync::Mutex;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cfg = EncodeConfig::new(64, 36, Fps::integer(30).unwrap(), ExportFormat::Mp4, 4)
            .with_progress(Arc::new(move |p| sink.lock().unwrap().push(p.fraction_complete)));
        cfg.report(2, 10.0);
        cfg.report(9, 10.0);
        assert_eq!(*seen.lock().unwrap(), vec![0.5, 1.0]);
    }

    #[test]
    fn backend_kind_parses_cli_names() {
        assert_eq!("in-process".parse::<BackendKind>().unwrap(), BackendKind::InProcess);
        assert!("gpu".parse::<BackendKind>().is_err());
    }
}
