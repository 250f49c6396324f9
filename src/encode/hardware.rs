use crate::encode::args;
use crate::encode::backend::{
    BackendKind, Capabilities, EncodeConfig, EncodedOutput, EncoderBackend, FrameOrder,
    ensure_format,
};
use crate::encode::session::FfmpegSession;
use crate::foundation::core::FrameIndex;
use crate::foundation::error::{ExportError, ExportResult};
use crate::model::settings::ExportFormat;
use crate::render::surface::FrameRGBA;
use crate::tool::TranscodeTool;

const SOFTWARE_FALLBACK: &str = "libx264";
/// Frames kept for replay while the hardware encoder has not yet reported output.
const REPLAY_LIMIT: usize = 120;

/// Native session driving a hardware H.264 encoder.
///
/// The tool reads input before it opens the encoder, so an encoder that cannot start usually
/// shows up a few frames in, or only when the session is finished. Until the session reports its
/// first encoded frame the backend keeps a copy of every frame it wrote; if the session dies in
/// that window it is replaced by a `libx264` session once and the copies are replayed into it.
pub struct HardwareBackend {
    tool: TranscodeTool,
    encoder: String,
    active: Option<String>,
    cfg: Option<EncodeConfig>,
    session: Option<FfmpegSession>,
    order: FrameOrder,
    replay: Vec<FrameRGBA>,
    /// The hardware session is past the replay window; its failures are final.
    committed: bool,
}

impl HardwareBackend {
    pub fn new(tool: TranscodeTool, encoder: impl Into<String>) -> Self {
        Self {
            tool,
            encoder: encoder.into(),
            active: None,
            cfg: None,
            session: None,
            order: FrameOrder::default(),
            replay: Vec::new(),
            committed: false,
        }
    }

    /// Encoder currently in use, after any fallback.
    pub fn active_encoder(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn fell_back(&self) -> bool {
        self.active.as_deref() == Some(SOFTWARE_FALLBACK)
    }

    fn can_fall_back(&self) -> bool {
        !self.committed && !self.fell_back()
    }

    fn spawn(&mut self, cfg: &EncodeConfig, encoder: &str) -> ExportResult<()> {
        let codec = if encoder == SOFTWARE_FALLBACK {
            args::software_codec_args(cfg.format, cfg.quality)
        } else {
            args::hardware_codec_args(encoder, cfg.quality)
        };
        self.session = Some(FfmpegSession::spawn(&self.tool, cfg, &codec)?);
        self.active = Some(encoder.to_string());
        Ok(())
    }

    fn session_mut(&mut self) -> ExportResult<&mut FfmpegSession> {
        self.session
            .as_mut()
            .ok_or_else(|| ExportError::backend("hardware session not running"))
    }

    /// Replace the hardware session with a software one and replay the frames it was given.
    fn fall_back(&mut self, cfg: &EncodeConfig, cause: &ExportError) -> ExportResult<()> {
        tracing::warn!(
            encoder = %self.encoder,
            error = %cause,
            replay = self.replay.len(),
            "hardware encoder session failed, falling back to {SOFTWARE_FALLBACK}"
        );
        if let Some(mut dead) = self.session.take() {
            dead.kill();
        }
        self.spawn(cfg, SOFTWARE_FALLBACK)?;
        let replay = std::mem::take(&mut self.replay);
        let session = self.session_mut()?;
        for frame in &replay {
            session.write_frame(frame)?;
        }
        Ok(())
    }

    /// Drop the replay copies once the hardware encoder has produced output.
    fn settle(&mut self) {
        let encoded = self.session.as_ref().map_or(0, FfmpegSession::frames_encoded);
        if encoded > 0 || self.replay.len() >= REPLAY_LIMIT {
            tracing::debug!(encoded, buffered = self.replay.len(), "hardware session committed");
            self.committed = true;
            self.replay = Vec::new();
        }
    }

    fn finish_session(&mut self, cfg: &EncodeConfig) -> ExportResult<EncodedOutput> {
        let session = self
            .session
            .take()
            .ok_or_else(|| ExportError::backend("hardware session not running"))?;
        let frames = session.frames_written();
        let bytes = session.finish()?;
        cfg.report(frames, 0.0);
        Ok(EncodedOutput::new(bytes, cfg.format, frames, cfg.fps))
    }
}

impl EncoderBackend for HardwareBackend {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn capabilities(&self) -> Capabilities {
        BackendKind::Hardware.capabilities()
    }

    fn supported_formats(&self) -> &'static [ExportFormat] {
        BackendKind::Hardware.supported_formats()
    }

    fn initialize(&mut self, cfg: EncodeConfig) -> ExportResult<()> {
        cfg.validate()?;
        ensure_format(self.name(), self.supported_formats(), cfg.format)?;
        self.replay.clear();
        self.committed = false;
        let encoder = self.encoder.clone();
        if let Err(e) = self.spawn(&cfg, &encoder) {
            self.fall_back(&cfg, &e)?;
        }
        tracing::info!(encoder = ?self.active, "hardware session started");
        self.order.reset();
        self.cfg = Some(cfg);
        Ok(())
    }

    fn ingest_frame(&mut self, idx: FrameIndex, frame: &FrameRGBA) -> ExportResult<()> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| ExportError::backend("hardware session not initialized"))?;
        self.order.check(idx)?;
        if !self.can_fall_back() {
            return self.session_mut()?.write_frame(frame);
        }

        let session = self.session_mut()?;
        let mut result = session.write_frame(frame);
        if result.is_ok() && session.has_exited() {
            result = Err(ExportError::backend("hardware encoder exited before its input ended"));
        }
        self.replay.push(frame.clone());
        match result {
            Ok(()) => {
                self.settle();
                Ok(())
            }
            Err(e) => self.fall_back(&cfg, &e),
        }
    }

    fn finalize(&mut self) -> ExportResult<EncodedOutput> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| ExportError::backend("hardware session not initialized"))?;
        let fallback_allowed = self.can_fall_back();
        match self.finish_session(&cfg) {
            Err(e) if fallback_allowed => {
                self.fall_back(&cfg, &e)?;
                self.finish_session(&cfg)
            }
            other => other,
        }
    }

    fn cancel(&mut self) {
        self.replay.clear();
        if let Some(mut session) = self.session.take() {
            session.kill();
        }
    }
}
