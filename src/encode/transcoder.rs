use std::io::{Read as _, Write as _};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use image::ImageEncoder as _;

use crate::encode::args;
use crate::encode::backend::{
    BackendKind, Capabilities, EncodeConfig, EncodedOutput, EncoderBackend, FrameOrder, RateMeter,
    ensure_format,
};
use crate::encode::vfs::{Vfs, frame_name};
use crate::foundation::core::FrameIndex;
use crate::foundation::error::{ExportError, ExportResult};
use crate::model::settings::ExportFormat;
use crate::render::surface::FrameRGBA;
use crate::tool::TranscodeTool;

type StageResult = ExportResult<Vfs>;

/// In-process transcoder: frames are staged as PNG files in a memory-limited [`Vfs`] and the
/// tool is run over the staged sequence on finalize, pipe to pipe.
pub struct TranscoderBackend {
    tool: TranscodeTool,
    vfs_limit: u64,
    queue_depth: usize,
    cfg: Option<EncodeConfig>,
    tx: Option<Sender<(FrameIndex, FrameRGBA)>>,
    worker: Option<JoinHandle<StageResult>>,
    order: FrameOrder,
    cancelled: Arc<AtomicBool>,
}

impl TranscoderBackend {
    pub fn new(tool: TranscodeTool, vfs_limit: u64, queue_depth: usize) -> Self {
        Self {
            tool,
            vfs_limit,
            queue_depth: queue_depth.max(1),
            cfg: None,
            tx: None,
            worker: None,
            order: FrameOrder::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn join_stage(&mut self) -> Option<StageResult> {
        drop(self.tx.take());
        let handle = self.worker.take()?;
        Some(
            handle
                .join()
                .unwrap_or_else(|_| Err(ExportError::backend("frame staging thread panicked"))),
        )
    }

    fn run_tool(&self, cfg: &EncodeConfig, mut vfs: Vfs) -> ExportResult<Vec<u8>> {
        let mut cmd = self.tool.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.args(["-loglevel", "error", "-f", "image2pipe", "-c:v", "png"]);
        cmd.args(["-framerate", &cfg.fps.as_ratio_arg(), "-i", "pipe:0"]);
        cmd.args(args::software_codec_args(cfg.format, cfg.quality));
        cmd.args(args::pipe_container_args(cfg.format));
        cmd.arg("pipe:1");

        let mut child = cmd
            .spawn()
            .map_err(|e| ExportError::backend(format!("failed to start transcoder: {e}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExportError::backend("failed to open transcoder stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExportError::backend("failed to open transcoder stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExportError::backend("failed to open transcoder stderr"))?;

        let staged = vfs.len();
        let files: Vec<Vec<u8>> = vfs.drain().map(|(_, bytes)| bytes).collect();
        let feeder = std::thread::spawn(move || -> std::io::Result<()> {
            for png in &files {
                stdin.write_all(png)?;
            }
            Ok(())
        });
        let stderr_drain = std::thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = stderr.read_to_end(&mut bytes);
            bytes
        });

        let mut out = Vec::new();
        stdout
            .read_to_end(&mut out)
            .map_err(|e| ExportError::backend(format!("failed to read transcoder output: {e}")))?;
        let status = child
            .wait()
            .map_err(|e| ExportError::backend(format!("failed to wait for transcoder: {e}")))?;
        let fed = feeder.join();
        let stderr_bytes = stderr_drain.join().unwrap_or_default();

        if !status.success() {
            return Err(ExportError::backend(format!(
                "transcoder exited with status {status}: {}",
                String::from_utf8_lossy(&stderr_bytes).trim()
            )));
        }
        match fed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ExportError::backend(format!("failed to feed staged frames: {e}")));
            }
            Err(_) => return Err(ExportError::backend("frame feeder thread panicked")),
        }
        tracing::debug!(staged, bytes = out.len(), "in-process transcode finished");
        Ok(out)
    }
}

impl EncoderBackend for TranscoderBackend {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn capabilities(&self) -> Capabilities {
        BackendKind::InProcess.capabilities()
    }

    fn supported_formats(&self) -> &'static [ExportFormat] {
        BackendKind::InProcess.supported_formats()
    }

    fn initialize(&mut self, cfg: EncodeConfig) -> ExportResult<()> {
        cfg.validate()?;
        ensure_format(self.name(), self.supported_formats(), cfg.format)?;

        let (tx, rx) = crossbeam_channel::bounded::<(FrameIndex, FrameRGBA)>(self.queue_depth);
        let stage_cfg = cfg.clone();
        let limit = self.vfs_limit;
        let cancelled = self.cancelled.clone();
        cancelled.store(false, Ordering::SeqCst);
        let worker = std::thread::Builder::new()
            .name("reelcast-stage".to_string())
            .spawn(move || {
                let mut vfs = Vfs::new(limit);
                let mut meter = RateMeter::default();
                let mut flat = Vec::with_capacity(stage_cfg.frame_bytes());
                let mut staged = 0u64;
                for (_, frame) in rx.iter() {
                    if cancelled.load(Ordering::SeqCst) {
                        return Err(ExportError::Cancelled);
                    }
                    meter.start();
                    frame.flatten_into(&mut flat, stage_cfg.background);
                    let png = encode_png_rgb(&flat, frame.width, frame.height)?;
                    vfs.write(frame_name(staged), png)?;
                    staged += 1;
                    stage_cfg.report(staged, meter.rate(staged));
                }
                Ok(vfs)
            })
            .map_err(|e| ExportError::backend(format!("failed to start frame staging: {e}")))?;

        self.tx = Some(tx);
        self.worker = Some(worker);
        self.order.reset();
        self.cfg = Some(cfg);
        Ok(())
    }

    fn ingest_frame(&mut self, idx: FrameIndex, frame: &FrameRGBA) -> ExportResult<()> {
        let cfg = self
            .cfg
            .as_ref()
            .ok_or_else(|| ExportError::backend("in-process transcoder not initialized"))?;
        self.order.check(idx)?;
        if frame.width != cfg.width || frame.height != cfg.height {
            return Err(ExportError::validation(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width, frame.height, cfg.width, cfg.height
            )));
        }
        frame.validate()?;
        let sent = match &self.tx {
            Some(tx) => tx.send((idx, frame.clone())).is_ok(),
            None => false,
        };
        if sent {
            return Ok(());
        }
        // The staging thread stopped; surface its error.
        match self.join_stage() {
            Some(Err(e)) => Err(e),
            _ => Err(ExportError::backend("frame staging stopped unexpectedly")),
        }
    }

    fn finalize(&mut self) -> ExportResult<EncodedOutput> {
        let cfg = self
            .cfg
            .clone()
            .ok_or_else(|| ExportError::backend("in-process transcoder not initialized"))?;
        let vfs = self
            .join_stage()
            .ok_or_else(|| ExportError::backend("in-process transcoder already finalized"))??;
        let frames = vfs.len() as u64;
        tracing::debug!(frames, staged_bytes = vfs.used_bytes(), "running in-process transcode");
        let bytes = self.run_tool(&cfg, vfs)?;
        cfg.report(frames, 0.0);
        Ok(EncodedOutput::new(bytes, cfg.format, frames, cfg.fps))
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(Err(e)) = self.join_stage()
            && !e.is_cancelled()
        {
            tracing::debug!(error = %e, "frame staging stopped with error during cancel");
        }
    }
}

fn encode_png_rgb(rgba: &[u8], width: u32, height: u32) -> ExportResult<Vec<u8>> {
    let rgb: Vec<u8> = rgba
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();
    let mut png = Vec::new();
    image::codecs::png::PngEncoder::new_with_quality(
        &mut png,
        image::codecs::png::CompressionType::Fast,
        image::codecs::png::FilterType::Sub,
    )
    .write_image(&rgb, width, height, image::ExtendedColorType::Rgb8)
    .map_err(|e| ExportError::backend(format!("failed to stage frame: {e}")))?;
    Ok(png)
}
