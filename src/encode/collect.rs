use std::sync::Arc;

use parking_lot::Mutex;

use crate::encode::backend::{
    Capabilities, EncodeConfig, EncodedOutput, EncoderBackend, FrameOrder, RateMeter,
};
use crate::foundation::core::FrameIndex;
use crate::foundation::error::{ExportError, ExportResult};
use crate::model::settings::ExportFormat;
use crate::render::surface::FrameRGBA;

/// Lifecycle counters shared with whoever holds a [`CollectorProbe`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectorState {
    pub initialized: bool,
    pub frames_ingested: u64,
    pub finalized: bool,
    pub cancel_calls: u32,
    pub last_index: Option<FrameIndex>,
}

/// Observer handle for a [`FrameCollector`] that has been moved into an orchestrator.
#[derive(Clone, Debug, Default)]
pub struct CollectorProbe {
    state: Arc<Mutex<CollectorState>>,
    frames: Arc<Mutex<Vec<(FrameIndex, FrameRGBA)>>>,
}

impl CollectorProbe {
    pub fn state(&self) -> CollectorState {
        self.state.lock().clone()
    }

    /// Frames collected so far, in timeline order.
    pub fn frames(&self) -> Vec<(FrameIndex, FrameRGBA)> {
        self.frames.lock().clone()
    }
}

/// In-memory backend for tests and debugging.
///
/// Accepts every format; the payload is the concatenated premultiplied RGBA frames.
#[derive(Debug, Default)]
pub struct FrameCollector {
    cfg: Option<EncodeConfig>,
    probe: CollectorProbe,
    order: FrameOrder,
    meter: RateMeter,
    fail_at: Option<u64>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a collector plus a probe that observes it after it is boxed away.
    pub fn with_probe() -> (Self, CollectorProbe) {
        let c = Self::default();
        let probe = c.probe.clone();
        (c, probe)
    }

    /// Make the `n`-th ingested frame (0-based) fail with a backend error.
    pub fn failing_at(mut self, n: u64) -> Self {
        self.fail_at = Some(n);
        self
    }

    pub fn frames(&self) -> Vec<(FrameIndex, FrameRGBA)> {
        self.probe.frames()
    }
}

impl EncoderBackend for FrameCollector {
    fn name(&self) -> &'static str {
        "collector"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            pushed_frames: true,
            capture_stream: false,
            hardware: false,
            out_of_process: false,
        }
    }

    fn supported_formats(&self) -> &'static [ExportFormat] {
        &ExportFormat::ALL
    }

    fn initialize(&mut self, cfg: EncodeConfig) -> ExportResult<()> {
        cfg.validate()?;
        self.cfg = Some(cfg);
        self.order.reset();
        self.probe.frames.lock().clear();
        let mut st = self.probe.state.lock();
        st.initialized = true;
        st.frames_ingested = 0;
        st.finalized = false;
        st.last_index = None;
        Ok(())
    }

    fn ingest_frame(&mut self, idx: FrameIndex, frame: &FrameRGBA) -> ExportResult<()> {
        let cfg = self
            .cfg
            .as_ref()
            .ok_or_else(|| ExportError::backend("collector not initialized"))?;
        if self.fail_at == Some(self.order.count()) {
            return Err(ExportError::backend("collector configured to fail"));
        }
        self.order.check(idx)?;
        frame.validate()?;
        self.meter.start();
        self.probe.frames.lock().push((idx, frame.clone()));
        {
            let mut st = self.probe.state.lock();
            st.frames_ingested += 1;
            st.last_index = Some(idx);
        }
        cfg.report(self.order.count(), self.meter.rate(self.order.count()));
        Ok(())
    }

    fn finalize(&mut self) -> ExportResult<EncodedOutput> {
        let cfg = self
            .cfg
            .as_ref()
            .ok_or_else(|| ExportError::backend("collector not initialized"))?;
        let frames = self.probe.frames.lock();
        let bytes: Vec<u8> = frames.iter().flat_map(|(_, f)| f.data.iter().copied()).collect();
        let count = frames.len() as u64;
        drop(frames);
        self.probe.state.lock().finalized = true;
        Ok(EncodedOutput::new(bytes, cfg.format, count, cfg.fps))
    }

    fn cancel(&mut self) {
        self.probe.state.lock().cancel_calls += 1;
    }
}
