use crate::encode::backend::BackendKind;
use crate::foundation::core::{Canvas, Fps};
use crate::foundation::error::{ExportError, ExportResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Low,
    #[serde(alias = "balanced")]
    Medium,
    High,
}

impl QualityTier {
    /// Next tier down, if any.
    pub fn lower(self) -> Option<Self> {
        match self {
            Self::Low => None,
            Self::Medium => Some(Self::Low),
            Self::High => Some(Self::Medium),
        }
    }

    /// Target bitrate for bitrate-driven encoders.
    pub fn bitrate_bps(self) -> u32 {
        match self {
            Self::Low => 2_500_000,
            Self::Medium => 5_000_000,
            Self::High => 8_000_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::str::FromStr for QualityTier {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "balanced" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(ExportError::validation(format!(
                "unknown quality tier '{other}'"
            ))),
        }
    }
}

/// Output container / stream format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Mp4,
    Webm,
    Mov,
    /// Raw H.264 Annex-B elementary stream.
    H264,
}

impl ExportFormat {
    pub const ALL: [Self; 4] = [Self::Mp4, Self::Webm, Self::Mov, Self::H264];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mov => "mov",
            Self::H264 => "h264",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::Webm => "video/webm",
            Self::Mov => "video/quicktime",
            Self::H264 => "video/h264",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.extension().eq_ignore_ascii_case(ext))
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s.trim())
            .ok_or_else(|| ExportError::validation(format!("unknown export format '{s}'")))
    }
}

/// Backend selection: let the factory decide, or pin one variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    #[default]
    Auto,
    Capture,
    #[serde(alias = "in-process")]
    InProcess,
    Native,
    Hardware,
}

impl BackendChoice {
    pub fn explicit(self) -> Option<BackendKind> {
        match self {
            Self::Auto => None,
            Self::Capture => Some(BackendKind::Capture),
            Self::InProcess => Some(BackendKind::InProcess),
            Self::Native => Some(BackendKind::Native),
            Self::Hardware => Some(BackendKind::Hardware),
        }
    }
}

impl From<BackendKind> for BackendChoice {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Capture => Self::Capture,
            BackendKind::InProcess => Self::InProcess,
            BackendKind::Native => Self::Native,
            BackendKind::Hardware => Self::Hardware,
        }
    }
}

/// Immutable per-run export settings.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExportSettings {
    pub quality: QualityTier,
    pub format: ExportFormat,
    pub fps: Fps,
    #[serde(default)]
    pub backend: BackendChoice,
    pub filename: String,
    /// Output size; defaults to the project canvas.
    #[serde(default)]
    pub resolution: Option<Canvas>,
    /// Proceed even when the memory estimate reaches the maximum level.
    #[serde(default)]
    pub override_memory_gate: bool,
}

impl ExportSettings {
    pub fn new(filename: impl Into<String>, format: ExportFormat, fps: Fps) -> Self {
        Self {
            quality: QualityTier::Medium,
            format,
            fps,
            backend: BackendChoice::Auto,
            filename: filename.into(),
            resolution: None,
            override_memory_gate: false,
        }
    }

    pub fn with_quality(mut self, quality: QualityTier) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_backend(mut self, backend: BackendChoice) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_resolution(mut self, canvas: Canvas) -> Self {
        self.resolution = Some(canvas);
        self
    }

    pub fn output_canvas(&self, project_canvas: Canvas) -> Canvas {
        self.resolution.unwrap_or(project_canvas)
    }

    /// Filename with the format extension appended when missing.
    pub fn output_filename(&self) -> String {
        let name = self.filename.trim();
        match name.rsplit_once('.') {
            Some((_, ext)) if ext.eq_ignore_ascii_case(self.format.extension()) => name.to_string(),
            _ => format!("{name}.{}", self.format.extension()),
        }
    }

    pub fn validate(&self, project_canvas: Canvas) -> ExportResult<()> {
        validate_filename(&self.filename, self.format)?;
        if self.fps.num == 0 || self.fps.den == 0 {
            return Err(ExportError::validation("fps must have num>0 and den>0"));
        }
        let canvas = self.output_canvas(project_canvas);
        if canvas.width == 0 || canvas.height == 0 {
            return Err(ExportError::validation("output width/height must be > 0"));
        }
        if !canvas.is_even() {
            return Err(ExportError::validation(format!(
                "output size {}x{} must be even (required for 4:2:0 output)",
                canvas.width, canvas.height
            )));
        }
        Ok(())
    }
}

fn validate_filename(name: &str, format: ExportFormat) -> ExportResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ExportError::validation("output filename must not be empty"));
    }
    if trimmed.len() > 255 {
        return Err(ExportError::validation("output filename is too long"));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(ExportError::validation("output filename is not a file name"));
    }
    const RESERVED: &[char] = &['/', '\\', '<', '>', ':', '"', '|', '?', '*'];
    if let Some(c) = trimmed
        .chars()
        .find(|c| RESERVED.contains(c) || c.is_control())
    {
        return Err(ExportError::validation(format!(
            "output filename contains invalid character {c:?}"
        )));
    }
    if let Some((_, ext)) = trimmed.rsplit_once('.')
        && let Some(other) = ExportFormat::from_extension(ext)
        && other != format
    {
        return Err(ExportError::validation(format!(
            "output filename extension '.{ext}' does not match format '{}'",
            format.extension()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(name: &str) -> ExportSettings {
        ExportSettings::new(name, ExportFormat::Mp4, Fps::integer(30).unwrap())
    }

    #[test]
    fn balanced_is_medium() {
        let q: QualityTier = serde_json::from_str("\"balanced\"").unwrap();
        assert_eq!(q, QualityTier::Medium);
        assert_eq!("balanced".parse::<QualityTier>().unwrap(), QualityTier::Medium);
    }

    #[test]
    fn lower_tier_chain() {
        assert_eq!(QualityTier::High.lower(), Some(QualityTier::Medium));
        assert_eq!(QualityTier::Low.lower(), None);
    }

    #[test]
    fn filename_gets_extension() {
        assert_eq!(settings("clip").output_filename(), "clip.mp4");
        assert_eq!(settings("clip.MP4").output_filename(), "clip.MP4");
        assert_eq!(settings("v1.final").output_filename(), "v1.final.mp4");
    }

    #[test]
    fn invalid_filenames_are_rejected() {
        let canvas = Canvas::new(64, 36);
        assert!(settings("").validate(canvas).is_err());
        assert!(settings("a/b").validate(canvas).is_err());
        assert!(settings("what?").validate(canvas).is_err());
        assert!(settings("clip.webm").validate(canvas).is_err());
        assert!(settings("clip").validate(canvas).is_ok());
    }

    #[test]
    fn odd_output_size_is_rejected() {
        let s = settings("clip").with_resolution(Canvas::new(63, 36));
        assert!(s.validate(Canvas::new(64, 36)).is_err());
    }

    #[test]
    fn backend_choice_parses_aliases() {
        let c: BackendChoice = serde_json::from_str("\"in-process\"").unwrap();
        assert_eq!(c.explicit(), Some(BackendKind::InProcess));
        assert_eq!(BackendChoice::Auto.explicit(), None);
    }
}
