//! Incremental capture backend: frames are published to a bounded stream and encoded to an H.264
//! elementary stream by a worker thread as they arrive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use openh264::encoder::{Encoder, EncoderConfig as H264Config, UsageType};

use crate::encode::backend::{
    Capabilities, BackendKind, EncodeConfig, EncodedOutput, EncoderBackend, FrameOrder, RateMeter,
    ensure_format,
};
use crate::foundation::core::FrameIndex;
use crate::foundation::error::{ExportError, ExportResult};
use crate::model::settings::ExportFormat;
use crate::render::surface::FrameRGBA;

const POLL: Duration = Duration::from_millis(100);

/// A frame on the capture stream.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub index: FrameIndex,
    pub frame: FrameRGBA,
}

/// Producer half of a capture stream, held by the orchestrator.
#[derive(Debug)]
pub struct CaptureTap {
    tx: Option<Sender<CapturedFrame>>,
}

/// Consumer half of a capture stream, attached to the backend.
#[derive(Debug)]
pub struct CaptureSource {
    rx: Receiver<CapturedFrame>,
}

/// Create a capture stream holding at most `depth` frames in flight.
pub fn capture_stream(depth: usize) -> (CaptureTap, CaptureSource) {
    let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
    (CaptureTap { tx: Some(tx) }, CaptureSource { rx })
}

impl CaptureTap {
    /// Publish a frame, blocking while the stream is full.
    pub fn publish(&self, index: FrameIndex, frame: &FrameRGBA) -> ExportResult<()> {
        let Some(tx) = &self.tx else {
            return Err(ExportError::backend("capture stream is closed"));
        };
        tx.send(CapturedFrame {
            index,
            frame: frame.clone(),
        })
        .map_err(|_| ExportError::backend("capture encoder stopped accepting frames"))
    }

    /// Signal end of stream.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

impl CaptureSource {
    pub fn into_receiver(self) -> Receiver<CapturedFrame> {
        self.rx
    }
}

type WorkerResult = ExportResult<(Vec<u8>, u64)>;

/// H.264 elementary-stream encoder fed from a [`CaptureSource`].
#[derive(Default)]
pub struct CaptureBackend {
    cfg: Option<EncodeConfig>,
    worker: Option<JoinHandle<WorkerResult>>,
    cancelled: Arc<AtomicBool>,
}

impl CaptureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn join_worker(&mut self) -> Option<WorkerResult> {
        let handle = self.worker.take()?;
        Some(
            handle
                .join()
                .unwrap_or_else(|_| Err(ExportError::backend("capture encoder thread panicked"))),
        )
    }
}

impl EncoderBackend for CaptureBackend {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn capabilities(&self) -> Capabilities {
        BackendKind::Capture.capabilities()
    }

    fn supported_formats(&self) -> &'static [ExportFormat] {
        BackendKind::Capture.supported_formats()
    }

    fn initialize(&mut self, cfg: EncodeConfig) -> ExportResult<()> {
        cfg.validate()?;
        ensure_format(self.name(), self.supported_formats(), cfg.format)?;
        self.cancelled.store(false, Ordering::SeqCst);
        self.cfg = Some(cfg);
        Ok(())
    }

    fn attach_capture_source(&mut self, source: CaptureSource) -> ExportResult<()> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| ExportError::backend("capture backend not initialized"))?;
        if self.worker.is_some() {
            return Err(ExportError::backend("capture source already attached"));
        }
        let cancelled = self.cancelled.clone();
        let rx = source.into_receiver();
        let handle = std::thread::Builder::new()
            .name("reelcast-capture".to_string())
            .spawn(move || encode_stream(&cfg, &rx, &cancelled))
            .map_err(|e| ExportError::backend(format!("failed to start capture encoder: {e}")))?;
        self.worker = Some(handle);
        Ok(())
    }

    fn finalize(&mut self) -> ExportResult<EncodedOutput> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| ExportError::backend("capture backend not initialized"))?;
        let (bytes, frames) = self
            .join_worker()
            .ok_or_else(|| ExportError::backend("no capture source attached"))??;
        tracing::debug!(frames, bytes = bytes.len(), "capture stream finalized");
        Ok(EncodedOutput::new(bytes, cfg.format, frames, cfg.fps))
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(Err(e)) = self.join_worker()
            && !e.is_cancelled()
        {
            tracing::debug!(error = %e, "capture encoder stopped with error during cancel");
        }
    }
}

fn encode_stream(
    cfg: &EncodeConfig,
    rx: &Receiver<CapturedFrame>,
    cancelled: &AtomicBool,
) -> WorkerResult {
    let h264_cfg = H264Config::new()
        .set_bitrate_bps(cfg.quality.bitrate_bps())
        .max_frame_rate(cfg.fps.as_f64() as f32)
        .usage_type(UsageType::ScreenContentRealTime)
        .enable_skip_frame(false);
    let mut encoder = Encoder::with_api_config(openh264::OpenH264API::from_source(), h264_cfg)
        .map_err(|e| ExportError::backend(format!("failed to create H.264 encoder: {e}")))?;

    let mut order = FrameOrder::default();
    let mut meter = RateMeter::default();
    let mut out = Vec::new();
    let mut flat = Vec::with_capacity(cfg.frame_bytes());
    let mut yuv = Vec::new();

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(ExportError::Cancelled);
        }
        let captured = match rx.recv_timeout(POLL) {
            Ok(c) => c,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        order.check(captured.index)?;
        meter.start();
        let frame = &captured.frame;
        if frame.width != cfg.width || frame.height != cfg.height {
            return Err(ExportError::validation(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width, frame.height, cfg.width, cfg.height
            )));
        }
        frame.validate()?;
        frame.flatten_into(&mut flat, cfg.background);
        rgba_to_i420(&flat, cfg.width as usize, cfg.height as usize, &mut yuv);

        if order.count() == 1 {
            encoder.force_intra_frame();
        }
        let source = openh264::formats::YUVBuffer::from_vec(
            std::mem::take(&mut yuv),
            cfg.width as usize,
            cfg.height as usize,
        );
        let bitstream = encoder
            .encode(&source)
            .map_err(|e| ExportError::backend(format!("H.264 encode failed: {e}")))?;
        for l in 0..bitstream.num_layers() {
            let Some(layer) = bitstream.layer(l) else {
                continue;
            };
            for n in 0..layer.nal_count() {
                let Some(nal) = layer.nal_unit(n) else {
                    continue;
                };
                if !(nal.starts_with(&[0, 0, 0, 1]) || nal.starts_with(&[0, 0, 1])) {
                    out.extend_from_slice(&[0, 0, 0, 1]);
                }
                out.extend_from_slice(nal);
            }
        }
        cfg.report(order.count(), meter.rate(order.count()));
    }

    Ok((out, order.count()))
}

/// BT.601 limited-range conversion of opaque RGBA to planar I420; chroma is the 2x2 average.
pub fn rgba_to_i420(rgba: &[u8], width: usize, height: usize, out: &mut Vec<u8>) {
    let y_size = width * height;
    let cw = width / 2;
    let ch = height / 2;
    let uv_size = cw * ch;
    out.clear();
    out.resize(y_size + 2 * uv_size, 0);
    let (y_plane, uv) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = uv.split_at_mut(uv_size);

    for y in 0..height {
        for x in 0..width {
            let i = (y * width + x) * 4;
            let (r, g, b) = (i32::from(rgba[i]), i32::from(rgba[i + 1]), i32::from(rgba[i + 2]));
            y_plane[y * width + x] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8;
        }
    }
    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let i = ((cy * 2 + dy) * width + cx * 2 + dx) * 4;
                r += i32::from(rgba[i]);
                g += i32::from(rgba[i + 1]);
                b += i32::from(rgba[i + 2]);
            }
            let (r, g, b) = (r / 4, g / 4, b / 4);
            let idx = cy * cw + cx;
            u_plane[idx] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
            v_plane[idx] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        }
    }
}
