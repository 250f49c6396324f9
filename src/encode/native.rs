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

/// Out-of-process transcoder fed raw frames over a pipe.
pub struct NativeBackend {
    tool: TranscodeTool,
    cfg: Option<EncodeConfig>,
    session: Option<FfmpegSession>,
    order: FrameOrder,
}

impl NativeBackend {
    pub fn new(tool: TranscodeTool) -> Self {
        Self {
            tool,
            cfg: None,
            session: None,
            order: FrameOrder::default(),
        }
    }
}

impl EncoderBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn capabilities(&self) -> Capabilities {
        BackendKind::Native.capabilities()
    }

    fn supported_formats(&self) -> &'static [ExportFormat] {
        BackendKind::Native.supported_formats()
    }

    fn initialize(&mut self, cfg: EncodeConfig) -> ExportResult<()> {
        cfg.validate()?;
        ensure_format(self.name(), self.supported_formats(), cfg.format)?;
        let codec = args::software_codec_args(cfg.format, cfg.quality);
        self.session = Some(FfmpegSession::spawn(&self.tool, &cfg, &codec)?);
        self.order.reset();
        self.cfg = Some(cfg);
        Ok(())
    }

    fn ingest_frame(&mut self, idx: FrameIndex, frame: &FrameRGBA) -> ExportResult<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ExportError::backend("native transcoder not running"))?;
        self.order.check(idx)?;
        session.write_frame(frame)
    }

    fn finalize(&mut self) -> ExportResult<EncodedOutput> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| ExportError::backend("native transcoder not initialized"))?;
        let session = self
            .session
            .take()
            .ok_or_else(|| ExportError::backend("native transcoder not running"))?;
        let frames = session.frames_written();
        let bytes = session.finish()?;
        cfg.report(frames, 0.0);
        Ok(EncodedOutput::new(bytes, cfg.format, frames, cfg.fps))
    }

    fn cancel(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.kill();
            tracing::debug!("native transcoder killed");
        }
    }
}
