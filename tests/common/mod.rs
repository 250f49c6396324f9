#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use reelcast::encode::CollectorProbe;
use reelcast::factory::BackendBuilder;
use reelcast::media::source::{FrameSource, Picture, StillImageSource};
use reelcast::{
    Background, BackendFactory, BackendKind, CapabilityProbe, Canvas, ElementKind, ExportConfig,
    ExportContext, ExportEngine, ExportResult, FrameCollector, HostCapabilities, InMemoryCatalog,
    MediaElement, MediaId, MediaItem, MediaKind, MediaLoader, Project, Rgba8, SeekTimeoutPolicy,
    TimelineElement, Track, TranscodeTool, Transform,
};

/// Video whose colour depends on the requested source time.
pub struct RampVideo {
    duration: f64,
}

impl FrameSource for RampVideo {
    fn natural_size(&self) -> (u32, u32) {
        (16, 16)
    }

    fn duration_secs(&self) -> Option<f64> {
        Some(self.duration)
    }

    fn frame_at(&mut self, t: f64) -> ExportResult<Picture> {
        let level = ((t * 40.0) as u32 % 200 + 40) as u8;
        Ok(Picture::solid(16, 16, [level, 64, 255 - level, 255]))
    }
}

/// Opens every catalog item without touching the filesystem.
pub struct SyntheticLoader;

impl MediaLoader for SyntheticLoader {
    fn open(&self, item: &MediaItem) -> ExportResult<Box<dyn FrameSource>> {
        Ok(match item.kind {
            MediaKind::Video => Box::new(RampVideo {
                duration: item.duration_secs.unwrap_or(3600.0),
            }),
            _ => Box::new(StillImageSource::new(Picture::solid(16, 16, [200, 30, 30, 255]))),
        })
    }
}

pub fn catalog() -> InMemoryCatalog {
    [
        MediaItem::new("clip", MediaKind::Video, "clip.mp4")
            .with_size(16, 16)
            .with_duration(3600.0),
        MediaItem::new("still", MediaKind::Image, "still.png").with_size(16, 16),
    ]
    .into_iter()
    .collect()
}

pub fn media_element(id: &str, media_id: &str, start: f64, duration: f64) -> TimelineElement {
    TimelineElement {
        id: id.into(),
        start_secs: start,
        duration_secs: duration,
        hidden: false,
        transform: Transform::default(),
        kind: ElementKind::Media(MediaElement {
            media_id: MediaId::new(media_id),
            trim_in_secs: 0.0,
            trim_out_secs: None,
        }),
    }
}

pub fn project_with(id: &str, canvas: Canvas, elements: Vec<TimelineElement>) -> Arc<Project> {
    Arc::new(Project {
        id: id.into(),
        canvas,
        background: Background::Solid {
            color: Rgba8::rgb(10, 10, 10),
        },
        tracks: vec![Track {
            id: "main".into(),
            z_index: 0,
            hidden: false,
            elements,
        }],
    })
}

/// One video clip spanning `secs` on a small canvas.
pub fn clip_project(id: &str, secs: f64) -> Arc<Project> {
    let elements = if secs > 0.0 {
        vec![media_element("c0", "clip", 0.0, secs)]
    } else {
        Vec::new()
    };
    project_with(id, Canvas::new(32, 18), elements)
}

pub fn host(transcoder: Option<TranscodeTool>, device_memory_bytes: u64) -> HostCapabilities {
    HostCapabilities {
        transcoder,
        hardware_encoders: Vec::new(),
        device_memory_bytes,
        memory_is_estimate: false,
        render_fps: 120.0,
        cpu_count: 4,
        allow_native_process: true,
        probed_at: chrono::Utc::now(),
    }
}

pub fn test_config() -> ExportConfig {
    ExportConfig {
        frame_yield_micros: 0,
        ..ExportConfig::default()
    }
}

/// Builder that hands out `collector` the first time and fresh collectors afterwards.
pub fn collector_builder(collector: FrameCollector) -> BackendBuilder {
    let slot = Arc::new(Mutex::new(Some(collector)));
    Arc::new(move || match slot.lock().take() {
        Some(c) => Box::new(c),
        None => Box::new(FrameCollector::new()),
    })
}

/// Engine with no transcoding tool whose native backend is a frame collector.
pub fn collector_engine(config: ExportConfig, device_memory_bytes: u64) -> (ExportEngine, CollectorProbe) {
    collector_engine_with(
        config,
        device_memory_bytes,
        ExportContext::new(Arc::new(catalog()), Arc::new(SyntheticLoader)),
    )
}

pub fn collector_engine_with(
    config: ExportConfig,
    device_memory_bytes: u64,
    ctx: ExportContext,
) -> (ExportEngine, CollectorProbe) {
    let (collector, probe) = FrameCollector::with_probe();
    let mut factory = BackendFactory::new(
        config,
        Arc::new(CapabilityProbe::fixed(host(None, device_memory_bytes))),
    );
    factory.register(BackendKind::Native, collector_builder(collector));
    (ExportEngine::with_factory(factory, ctx), probe)
}

/// Video that answers its opening seek and then stalls on every later one.
#[derive(Default)]
pub struct StallingVideo {
    served_first: bool,
}

impl FrameSource for StallingVideo {
    fn natural_size(&self) -> (u32, u32) {
        (16, 16)
    }

    fn duration_secs(&self) -> Option<f64> {
        Some(3600.0)
    }

    fn frame_at(&mut self, _t: f64) -> ExportResult<Picture> {
        if self.served_first {
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
        self.served_first = true;
        Ok(Picture::solid(16, 16, [90, 90, 90, 255]))
    }
}

/// Videos stall; stills are opaque black.
pub struct DarkLoader;

impl MediaLoader for DarkLoader {
    fn open(&self, item: &MediaItem) -> ExportResult<Box<dyn FrameSource>> {
        Ok(match item.kind {
            MediaKind::Video => Box::new(StallingVideo::default()),
            _ => Box::new(StillImageSource::new(Picture::solid(16, 16, [0, 0, 0, 255]))),
        })
    }
}

/// Seek timeouts short enough for stalled decoders to fail quickly.
pub fn quick_seek_config() -> ExportConfig {
    ExportConfig {
        seek_timeout: SeekTimeoutPolicy {
            base_ms: 5.0,
            per_clip_minute_ms: 0.0,
            per_seek_second_ms: 0.0,
            min_ms: 5.0,
            max_ms: 10.0,
        },
        ..test_config()
    }
}

pub const GIB: u64 = 1024 * 1024 * 1024;
