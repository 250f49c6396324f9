use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::ExportConfig;
use crate::encode::backend::BackendKind;
use crate::foundation::core::{Canvas, Rect};
use crate::media::source::Picture;
use crate::render::letterbox::fit_contain;
use crate::render::surface::Surface;
use crate::tool::TranscodeTool;

/// Used when the host does not expose its memory size.
pub const DEFAULT_DEVICE_MEMORY: u64 = 4 * 1024 * 1024 * 1024;

/// What the host can do, as measured once by a [`HostProber`].
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HostCapabilities {
    pub transcoder: Option<TranscodeTool>,
    /// Verified hardware H.264 encoders, best first.
    pub hardware_encoders: Vec<String>,
    pub device_memory_bytes: u64,
    /// True when `device_memory_bytes` is the fallback default.
    pub memory_is_estimate: bool,
    /// Synthetic render throughput in frames per second.
    pub render_fps: f64,
    pub cpu_count: usize,
    pub allow_native_process: bool,
    pub probed_at: chrono::DateTime<chrono::Utc>,
}

/// Whether a backend variant can run here, and why not.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Availability {
    pub usable: bool,
    pub reason: Option<String>,
}

impl Availability {
    pub(crate) fn yes() -> Self {
        Self {
            usable: true,
            reason: None,
        }
    }

    pub(crate) fn no(reason: impl Into<String>) -> Self {
        Self {
            usable: false,
            reason: Some(reason.into()),
        }
    }
}

impl HostCapabilities {
    pub fn availability(&self, kind: BackendKind) -> Availability {
        match kind {
            BackendKind::Capture => Availability::yes(),
            BackendKind::InProcess => {
                if self.transcoder.is_some() {
                    Availability::yes()
                } else {
                    Availability::no("transcoding tool not found")
                }
            }
            BackendKind::Native => {
                if self.transcoder.is_none() {
                    Availability::no("transcoding tool not found")
                } else if !self.allow_native_process {
                    Availability::no("host does not allow spawning the transcoding tool")
                } else {
                    Availability::yes()
                }
            }
            BackendKind::Hardware => {
                if self.transcoder.is_none() {
                    Availability::no("transcoding tool not found")
                } else if !self.allow_native_process {
                    Availability::no("host does not allow spawning the transcoding tool")
                } else if self.hardware_encoders.is_empty() {
                    Availability::no("no hardware H.264 encoder passed verification")
                } else {
                    Availability::yes()
                }
            }
        }
    }

    pub fn usable(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|k| self.availability(*k).usable)
            .collect()
    }

    /// Best verified hardware encoder.
    pub fn hardware_encoder(&self) -> Option<&str> {
        self.hardware_encoders.first().map(String::as_str)
    }
}

/// Source of [`HostCapabilities`].
pub trait HostProber: Send + Sync {
    fn probe(&self) -> HostCapabilities;
}

/// Probes the real host: tool discovery, hardware verification, memory and a render benchmark.
#[derive(Clone, Debug)]
pub struct SystemProber {
    transcoder_path: Option<std::path::PathBuf>,
    allow_native_process: bool,
    benchmark_frames: u32,
}

impl SystemProber {
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            transcoder_path: config.transcoder_path.clone(),
            allow_native_process: config.allow_native_process,
            benchmark_frames: config.benchmark_frames,
        }
    }
}

impl HostProber for SystemProber {
    fn probe(&self) -> HostCapabilities {
        let started = Instant::now();
        let transcoder = TranscodeTool::locate(self.transcoder_path.as_deref());
        let hardware_encoders = match (&transcoder, self.allow_native_process) {
            (Some(tool), true) => tool.verified_hardware_encoders(),
            _ => Vec::new(),
        };
        let (device_memory_bytes, memory_is_estimate) = match device_memory() {
            Some(bytes) => (bytes, false),
            None => (DEFAULT_DEVICE_MEMORY, true),
        };
        let render_fps = benchmark_render(self.benchmark_frames);
        let caps = HostCapabilities {
            transcoder,
            hardware_encoders,
            device_memory_bytes,
            memory_is_estimate,
            render_fps,
            cpu_count: num_cpus::get(),
            allow_native_process: self.allow_native_process,
            probed_at: chrono::Utc::now(),
        };
        tracing::info!(
            transcoder = ?caps.transcoder.as_ref().map(|t| t.path.display().to_string()),
            hardware = ?caps.hardware_encoders,
            device_memory = caps.device_memory_bytes,
            render_fps = caps.render_fps,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "probed host capabilities"
        );
        caps
    }
}

/// Returns the same capabilities every time.
#[derive(Clone, Debug)]
pub struct FixedProber(pub HostCapabilities);

impl HostProber for FixedProber {
    fn probe(&self) -> HostCapabilities {
        self.0.clone()
    }
}

/// `MemTotal` from `/proc/meminfo`, when available.
fn device_memory() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total(&text)
}

fn parse_meminfo_total(text: &str) -> Option<u64> {
    let line = text.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Render `frames` synthetic 640x360 frames through the surface path.
pub fn benchmark_render(frames: u32) -> f64 {
    let frames = frames.max(1);
    let canvas = Canvas::new(640, 360);
    let mut surface = Surface::new(canvas);
    let picture = Picture::solid(320, 240, [40, 90, 160, 255]);
    let target = fit_contain(picture.width, picture.height, canvas.rect());
    let t0 = Instant::now();
    for i in 0..frames {
        let shade = (i * 7 % 255) as u8;
        surface.clear([shade, shade, shade, 255]);
        if surface.draw_picture(&picture, target, 0.9).is_err() {
            return 0.0;
        }
        surface.fill_rect(Rect::new(16.0, 16.0, 200.0, 48.0), [255, 255, 255, 255], 0.5);
    }
    let secs = t0.elapsed().as_secs_f64();
    if secs > 0.0 { f64::from(frames) / secs } else { f64::from(frames) * 1000.0 }
}

/// Memoized capability probe shared across runs.
///
/// The first `get` probes under the lock so concurrent callers never probe twice; `refresh`
/// replaces the memoized result.
pub struct CapabilityProbe {
    prober: Arc<dyn HostProber>,
    cached: Mutex<Option<Arc<HostCapabilities>>>,
    probes: AtomicU64,
}

impl std::fmt::Debug for CapabilityProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityProbe")
            .field("probes", &self.probe_count())
            .field("cached", &self.cached.lock().is_some())
            .finish()
    }
}

impl CapabilityProbe {
    pub fn new(prober: Arc<dyn HostProber>) -> Self {
        Self {
            prober,
            cached: Mutex::new(None),
            probes: AtomicU64::new(0),
        }
    }

    pub fn system(config: &ExportConfig) -> Self {
        Self::new(Arc::new(SystemProber::new(config)))
    }

    pub fn fixed(caps: HostCapabilities) -> Self {
        Self::new(Arc::new(FixedProber(caps)))
    }

    pub fn get(&self) -> Arc<HostCapabilities> {
        let mut cached = self.cached.lock();
        if let Some(caps) = cached.as_ref() {
            return caps.clone();
        }
        let caps = Arc::new(self.prober.probe());
        self.probes.fetch_add(1, Ordering::Relaxed);
        *cached = Some(caps.clone());
        caps
    }

    pub fn refresh(&self) -> Arc<HostCapabilities> {
        let mut cached = self.cached.lock();
        let caps = Arc::new(self.prober.probe());
        self.probes.fetch_add(1, Ordering::Relaxed);
        *cached = Some(caps.clone());
        caps
    }

    /// Number of times the prober actually ran.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) fn test_capabilities(tool: bool, hardware: bool) -> HostCapabilities {
    HostCapabilities {
        transcoder: tool.then(|| TranscodeTool {
            path: "/usr/bin/ffmpeg".into(),
            probe_path: None,
            version: Some("ffmpeg version test".into()),
        }),
        hardware_encoders: if hardware { vec!["h264_nvenc".into()] } else { Vec::new() },
        device_memory_bytes: 8 * 1024 * 1024 * 1024,
        memory_is_estimate: false,
        render_fps: 240.0,
        cpu_count: 8,
        allow_native_process: true,
        probed_at: chrono::Utc::now(),
    }
}
