use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::{ExportConfig, SeekTimeoutPolicy};
use crate::foundation::core::{Canvas, Rect, Rgba8};
use crate::foundation::error::{ExportError, ExportResult};
use crate::media::cache::{MediaCache, PreloadReport};
use crate::media::handle::SeekOutcome;
use crate::media::source::{MediaLoader, Picture};
use crate::model::media::{MediaCatalog, MediaId, MediaItem, MediaKind};
use crate::model::project::{
    Background, ElementKind, MediaElement, Project, TextElement, TimelineElement,
};
use crate::render::blur::blurred_cover;
use crate::render::letterbox::{fit_contain, has_bars};
use crate::render::surface::{FrameRGBA, Surface};
use crate::render::text::{TextRasterizer, TextRegion};
use crate::render::verify::{BlackFrameDetector, FrameVerdict};

const BLUR_DOWNSCALE: u32 = 8;
const PLACEHOLDER_FILL: Rgba8 = Rgba8::rgb(72, 72, 72);
const PLACEHOLDER_CROSS: Rgba8 = Rgba8::rgb(160, 160, 160);

/// An element visible at some timestamp, in draw order.
#[derive(Clone, Copy, Debug)]
pub struct ActiveElement<'a> {
    pub track_index: usize,
    pub z_index: i32,
    pub element: &'a TimelineElement,
}

/// Elements whose `[start, end)` contains `t`, bottom-most first.
///
/// Tracks are ordered by ascending `z_index`; ties keep project order. Hidden tracks and hidden
/// elements are excluded.
pub fn resolve_active_elements(project: &Project, t: f64) -> Vec<ActiveElement<'_>> {
    let mut tracks: Vec<(usize, &crate::model::project::Track)> = project
        .tracks
        .iter()
        .enumerate()
        .filter(|(_, tr)| !tr.hidden)
        .collect();
    tracks.sort_by_key(|(idx, tr)| (tr.z_index, *idx));

    let mut out = Vec::new();
    for (track_index, track) in tracks {
        for element in track.elements.iter().filter(|e| !e.hidden && e.contains(t)) {
            out.push(ActiveElement {
                track_index,
                z_index: track.z_index,
                element,
            });
        }
    }
    out
}

/// Cumulative renderer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RenderStats {
    pub frames: u64,
    pub placeholders: u64,
    pub seek_timeouts: u64,
    pub skipped_elements: u64,
    pub black_samples: u64,
    pub degraded_runs: u64,
}

/// What happened while rendering one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameReport {
    pub placeholders: u32,
    pub seek_timeouts: u32,
    pub skipped: u32,
    pub verdict: FrameVerdict,
}

impl Default for FrameReport {
    fn default() -> Self {
        Self {
            placeholders: 0,
            seek_timeouts: 0,
            skipped: 0,
            verdict: FrameVerdict::Skipped,
        }
    }
}

enum Layer<'a> {
    Picture(Picture),
    Placeholder,
    Text(&'a TextElement),
    Skip,
}

/// Composites timeline snapshots into frames.
///
/// Owns the run's media cache and compositing surface; neither is shared with other runs.
pub struct FrameRenderer {
    project: Arc<Project>,
    canvas: Canvas,
    scale: (f64, f64),
    items: HashMap<MediaId, MediaItem>,
    cache: MediaCache,
    surface: Surface,
    text: Option<TextRasterizer>,
    seek_policy: SeekTimeoutPolicy,
    detector: BlackFrameDetector,
    max_consecutive_seek_failures: u32,
    consecutive_seek_failures: u32,
    reported_missing: HashSet<MediaId>,
    stats: RenderStats,
}

impl FrameRenderer {
    /// Build a renderer producing `canvas`-sized frames.
    ///
    /// Media references are resolved against `catalog` once, here; ids the catalog does not know
    /// render as placeholders.
    pub fn new(
        project: Arc<Project>,
        catalog: &dyn MediaCatalog,
        loader: Arc<dyn MediaLoader>,
        canvas: Canvas,
        config: &ExportConfig,
    ) -> Self {
        let items = project
            .referenced_media()
            .into_iter()
            .filter_map(|id| catalog.resolve_media_item(&id).map(|item| (id, item)))
            .collect();
        let scale = (
            f64::from(canvas.width) / f64::from(project.canvas.width.max(1)),
            f64::from(canvas.height) / f64::from(project.canvas.height.max(1)),
        );
        Self {
            canvas,
            scale,
            items,
            cache: MediaCache::new(config.media_cache_capacity, loader, config.open_timeout()),
            surface: Surface::new(canvas),
            text: None,
            seek_policy: config.seek_timeout,
            detector: BlackFrameDetector::new(
                config.verify_every_n_frames,
                config.verify_pixel_stride,
                config.black_run_threshold,
            ),
            max_consecutive_seek_failures: config.max_consecutive_seek_failures,
            consecutive_seek_failures: 0,
            reported_missing: HashSet::new(),
            stats: RenderStats::default(),
            project,
        }
    }

    /// Use a specific text rasterizer instead of loading system fonts on first use.
    pub fn with_text_rasterizer(mut self, text: TextRasterizer) -> Self {
        self.text = Some(text);
        self
    }

    pub fn canvas(&self) -> Canvas {
        self.canvas
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    pub fn resolve_active_elements(&self, t: f64) -> Vec<ActiveElement<'_>> {
        resolve_active_elements(&self.project, t)
    }

    /// Catalog items for every visible visual media reference.
    pub fn visual_items(&self) -> Vec<MediaItem> {
        self.project
            .referenced_media()
            .iter()
            .filter_map(|id| self.items.get(id))
            .filter(|item| item.kind.is_visual())
            .cloned()
            .collect()
    }

    /// Open decode handles for referenced media ahead of the frame loop.
    pub fn preload(&mut self) -> PreloadReport {
        let items = self.visual_items();
        self.cache.preload_all(&items)
    }

    pub fn cache(&self) -> &MediaCache {
        &self.cache
    }

    /// Drop every decode handle.
    pub fn release_media(&mut self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn frame(&self) -> FrameRGBA {
        self.surface.to_frame()
    }

    /// Composite the frame at timeline time `t` onto the surface.
    ///
    /// Per-element media problems are absorbed (placeholder, stale picture, or skip). The only
    /// error is escalation after too many consecutive frames in which every video element failed
    /// to seek.
    pub fn render_frame(&mut self, t: f64) -> ExportResult<FrameReport> {
        let project = Arc::clone(&self.project);
        let active = resolve_active_elements(&project, t);
        let mut report = FrameReport::default();

        let mut videos = 0u32;
        let mut failed_videos = 0u32;
        let mut layers = Vec::with_capacity(active.len());
        for a in &active {
            let layer = match &a.element.kind {
                ElementKind::Text(text) => Layer::Text(text),
                ElementKind::Media(m) => {
                    let (layer, video_ok) = self.acquire_media(a.element, m, t, &mut report);
                    if let Some(ok) = video_ok {
                        videos += 1;
                        if !ok {
                            failed_videos += 1;
                        }
                    }
                    layer
                }
            };
            layers.push((a.element, layer));
        }

        self.fill_background(&project.background, &layers)?;

        for (element, layer) in &layers {
            let target = self.element_box(element);
            let opacity = element.transform.opacity.clamp(0.0, 1.0);
            match layer {
                Layer::Picture(p) => self.draw_media(p, target, opacity, &project.background)?,
                Layer::Placeholder => self.draw_placeholder(target, opacity),
                Layer::Text(text) => {
                    if !self.draw_text(text, target, opacity)? {
                        report.skipped += 1;
                    }
                }
                Layer::Skip => {}
            }
        }

        if videos > 0 && failed_videos == videos {
            self.consecutive_seek_failures += 1;
            if self.consecutive_seek_failures > self.max_consecutive_seek_failures {
                return Err(ExportError::transient(format!(
                    "video seeks failed on {} consecutive frames",
                    self.consecutive_seek_failures
                )));
            }
        } else {
            self.consecutive_seek_failures = 0;
        }

        report.verdict = self.detector.observe(self.surface.data());
        match report.verdict {
            FrameVerdict::Black { run } => {
                self.stats.black_samples += 1;
                tracing::warn!(t, run, "sampled frame is black");
            }
            FrameVerdict::DegradedRun { run } => {
                self.stats.black_samples += 1;
                self.stats.degraded_runs += 1;
                tracing::warn!(t, run, "persistent black frames; output quality is degraded");
            }
            FrameVerdict::Ok | FrameVerdict::Skipped => {}
        }

        self.stats.frames += 1;
        self.stats.placeholders += u64::from(report.placeholders);
        self.stats.seek_timeouts += u64::from(report.seek_timeouts);
        self.stats.skipped_elements += u64::from(report.skipped);
        Ok(report)
    }

    /// Returns the layer plus, for video media, whether its seek settled.
    fn acquire_media<'a>(
        &mut self,
        element: &TimelineElement,
        media: &MediaElement,
        t: f64,
        report: &mut FrameReport,
    ) -> (Layer<'a>, Option<bool>) {
        let Some(item) = self.items.get(&media.media_id).cloned() else {
            if self.reported_missing.insert(media.media_id.clone()) {
                tracing::warn!(
                    element = %element.id,
                    media = %media.media_id,
                    "media is not in the catalog; drawing placeholder"
                );
            }
            report.placeholders += 1;
            return (Layer::Placeholder, None);
        };
        if item.kind == MediaKind::Audio {
            report.placeholders += 1;
            return (Layer::Placeholder, None);
        }

        let handle = match self.cache.get(&item) {
            Ok(h) => h,
            Err(_) => {
                report.placeholders += 1;
                return (Layer::Placeholder, None);
            }
        };
        if handle.is_still() {
            return match handle.seek(0.0, std::time::Duration::ZERO) {
                SeekOutcome::Ready(p) => (Layer::Picture(p), None),
                _ => (Layer::Placeholder, None),
            };
        }

        let natural = handle.duration_secs().or(item.duration_secs);
        let src_t = media.source_time(element.start_secs, t, natural);
        let clip_secs = natural.unwrap_or(element.duration_secs);
        let timeout = self
            .seek_policy
            .timeout_for(clip_secs, src_t - handle.last_time());

        match handle.seek(src_t, timeout) {
            SeekOutcome::Ready(p) => (Layer::Picture(p), Some(true)),
            SeekOutcome::Stale { picture, error } => {
                tracing::warn!(media = %item.id, t, error = %error, "seek failed; reusing last good frame");
                report.seek_timeouts += 1;
                (Layer::Picture(picture), Some(false))
            }
            SeekOutcome::Unavailable(error) => {
                tracing::warn!(media = %item.id, t, error = %error, "seek failed with no prior frame; skipping element");
                report.seek_timeouts += 1;
                report.skipped += 1;
                (Layer::Skip, Some(false))
            }
        }
    }

    fn element_box(&self, element: &TimelineElement) -> Rect {
        let r = element.transform.target_box(self.project.canvas);
        let (sx, sy) = self.scale;
        Rect::new(r.x0 * sx, r.y0 * sy, r.x1 * sx, r.y1 * sy)
    }

    fn fill_background(&mut self, background: &Background, layers: &[(&TimelineElement, Layer<'_>)]) -> ExportResult<()> {
        match background {
            Background::Solid { color } => self.surface.clear(color.to_premul()),
            Background::BlurredMedia { fallback, radius } => {
                self.surface.clear(fallback.to_premul());
                let bottom = layers.iter().find_map(|(_, layer)| match layer {
                    Layer::Picture(p) => Some(p),
                    _ => None,
                });
                if let Some(picture) = bottom {
                    let (w, h) = (self.canvas.width, self.canvas.height);
                    let blurred = blurred_cover(picture, w, h, *radius, BLUR_DOWNSCALE)?;
                    self.surface.blit(&blurred.rgba8_premul, w, h, 0, 0, 1.0)?;
                }
            }
        }
        Ok(())
    }

    fn draw_media(
        &mut self,
        picture: &Picture,
        target: Rect,
        opacity: f32,
        background: &Background,
    ) -> ExportResult<()> {
        let dst = fit_contain(picture.width, picture.height, target);
        if has_bars(dst, target) {
            match background {
                Background::Solid { color } => {
                    self.surface.fill_rect(target, color.to_premul(), opacity);
                }
                Background::BlurredMedia { radius, .. } => {
                    // Bars only show where the box meets the surface.
                    let visible = target.intersect(self.surface.rect());
                    let w = visible.width().round();
                    let h = visible.height().round();
                    if w >= 1.0 && h >= 1.0 {
                        let fill = blurred_cover(picture, w as u32, h as u32, *radius, BLUR_DOWNSCALE)?;
                        self.surface.draw_picture(&fill, visible, opacity)?;
                    }
                }
            }
        }
        self.surface.draw_picture(picture, dst, opacity)
    }

    fn draw_placeholder(&mut self, target: Rect, opacity: f32) {
        self.surface
            .fill_rect(target, PLACEHOLDER_FILL.to_premul(), opacity);
        let x0 = target.x0.round() as i64;
        let y0 = target.y0.round() as i64;
        let x1 = (target.x1.round() as i64 - 1).max(x0);
        let y1 = (target.y1.round() as i64 - 1).max(y0);
        let cross = PLACEHOLDER_CROSS.to_premul();
        self.surface.draw_line((x0, y0), (x1, y1), cross, opacity);
        self.surface.draw_line((x0, y1), (x1, y0), cross, opacity);
    }

    /// Returns `false` when the text could not be laid out.
    fn draw_text(&mut self, text: &TextElement, target: Rect, opacity: f32) -> ExportResult<bool> {
        let w = target.width().round();
        let h = target.height().round();
        if w < 1.0 || h < 1.0 || text.content.trim().is_empty() {
            return Ok(true);
        }
        let bx = target.x0.round();
        let by = target.y0.round();
        let vx0 = bx.max(0.0);
        let vy0 = by.max(0.0);
        let vx1 = (bx + w).min(f64::from(self.canvas.width));
        let vy1 = (by + h).min(f64::from(self.canvas.height));
        if vx0 >= vx1 || vy0 >= vy1 {
            return Ok(true);
        }
        let region = TextRegion {
            x: (vx0 - bx) as u32,
            y: (vy0 - by) as u32,
            width: (vx1 - vx0) as u32,
            height: (vy1 - vy0) as u32,
        };

        let rasterizer = self.text.get_or_insert_with(TextRasterizer::with_system_fonts);
        let mut style = text.style.clone();
        // Font size is authored in project pixels.
        style.font_size *= self.scale.1 as f32;
        match rasterizer.rasterize_region(&text.content, &style, w as u32, h as u32, region) {
            Ok(picture) => {
                self.surface.blit(
                    &picture.rgba8_premul,
                    picture.width,
                    picture.height,
                    vx0 as i64,
                    vy0 as i64,
                    opacity,
                )?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "text element skipped");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::source::{FrameSource, StillImageSource};
    use crate::model::media::InMemoryCatalog;
    use crate::model::project::{Track, Transform};

    struct Solids;

    impl MediaLoader for Solids {
        fn open(&self, item: &MediaItem) -> ExportResult<Box<dyn FrameSource>> {
            let color = match item.id.as_str() {
                "red" => [255, 0, 0, 255],
                "green" => [0, 255, 0, 255],
                _ => [0, 0, 255, 255],
            };
            Ok(Box::new(StillImageSource::new(Picture::solid(16, 9, color))))
        }
    }

    fn media(id: &str, media_id: &str, start: f64, dur: f64) -> TimelineElement {
        TimelineElement {
            id: id.to_string(),
            start_secs: start,
            duration_secs: dur,
            hidden: false,
            transform: Transform::default(),
            kind: ElementKind::Media(MediaElement {
                media_id: MediaId::new(media_id),
                trim_in_secs: 0.0,
                trim_out_secs: None,
            }),
        }
    }

    fn track(id: &str, z: i32, elements: Vec<TimelineElement>) -> Track {
        Track {
            id: id.to_string(),
            z_index: z,
            hidden: false,
            elements,
        }
    }

    fn project(tracks: Vec<Track>) -> Arc<Project> {
        Arc::new(Project {
            id: "p".to_string(),
            canvas: Canvas::new(32, 18),
            background: Background::default(),
            tracks,
        })
    }

    fn catalog() -> InMemoryCatalog {
        ["red", "green"]
            .into_iter()
            .map(|id| MediaItem::new(id, MediaKind::Image, format!("{id}.png")).with_size(16, 9))
            .collect()
    }

    fn renderer(p: Arc<Project>) -> FrameRenderer {
        let config = ExportConfig {
            open_timeout_ms: 2_000,
            ..ExportConfig::default()
        };
        let canvas = p.canvas;
        FrameRenderer::new(p, &catalog(), Arc::new(Solids), canvas, &config)
    }

    #[test]
    fn active_elements_follow_z_order_and_skip_hidden() {
        let mut hidden = media("h", "red", 0.0, 5.0);
        hidden.hidden = true;
        let p = project(vec![
            track("top", 5, vec![media("a", "red", 0.0, 2.0)]),
            track("bottom", -1, vec![media("b", "green", 1.0, 2.0), hidden]),
        ]);
        let ids: Vec<&str> = resolve_active_elements(&p, 1.5)
            .iter()
            .map(|a| a.element.id.as_str())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(resolve_active_elements(&p, 3.0).is_empty());
    }

    #[test]
    fn later_tracks_draw_on_top() {
        let p = project(vec![
            track("t0", 0, vec![media("a", "red", 0.0, 1.0)]),
            track("t1", 1, vec![media("b", "green", 0.0, 1.0)]),
        ]);
        let mut r = renderer(p);
        r.render_frame(0.0).unwrap();
        assert_eq!(r.surface().pixel(16, 9), Some([0, 255, 0, 255]));
    }

    #[test]
    fn missing_media_draws_placeholder_and_continues() {
        let p = project(vec![track("t0", 0, vec![media("a", "ghost", 0.0, 1.0)])]);
        let mut r = renderer(p);
        let report = r.render_frame(0.0).unwrap();
        assert_eq!(report.placeholders, 1);
        assert_eq!(r.surface().pixel(10, 3), Some(PLACEHOLDER_FILL.to_premul()));
        assert_eq!(r.stats().placeholders, 1);
    }

    #[test]
    fn letterbox_bars_take_background_colour() {
        let mut el = media("a", "red", 0.0, 1.0);
        el.transform = Transform {
            x: 8.0,
            width: Some(16.0),
            height: Some(18.0),
            ..Transform::default()
        };
        let p = Arc::new(Project {
            id: "p".to_string(),
            canvas: Canvas::new(32, 18),
            background: Background::Solid {
                color: Rgba8::rgb(0, 0, 40),
            },
            tracks: vec![track("t0", 0, vec![el])],
        });
        let mut r = renderer(p);
        r.render_frame(0.0).unwrap();
        assert_eq!(r.surface().pixel(16, 9), Some([255, 0, 0, 255]));
        assert_eq!(r.surface().pixel(16, 1), Some([0, 0, 40, 255]));
    }

    #[test]
    fn output_canvas_scales_element_boxes() {
        let p = project(vec![track("t0", 0, vec![media("a", "red", 0.0, 1.0)])]);
        let config = ExportConfig::default();
        let mut r = FrameRenderer::new(p, &catalog(), Arc::new(Solids), Canvas::new(64, 36), &config);
        r.render_frame(0.0).unwrap();
        assert_eq!(r.surface().pixel(63, 35), Some([255, 0, 0, 255]));
    }

    #[test]
    fn release_media_empties_the_cache() {
        let p = project(vec![track(
            "t0",
            0,
            vec![media("a", "red", 0.0, 1.0), media("b", "green", 0.0, 1.0)],
        )]);
        let mut r = renderer(p);
        let report = r.preload();
        assert_eq!(report.loaded.len(), 2);
        r.release_media();
        assert!(r.cache().is_empty());
    }

    #[test]
    fn blurred_background_uses_bottom_media() {
        let mut el = media("a", "green", 0.0, 1.0);
        el.transform = Transform {
            x: 12.0,
            y: 5.0,
            width: Some(8.0),
            height: Some(8.0),
            ..Transform::default()
        };
        let p = Arc::new(Project {
            id: "p".to_string(),
            canvas: Canvas::new(32, 18),
            background: Background::BlurredMedia {
                fallback: Rgba8::BLACK,
                radius: 16,
            },
            tracks: vec![track("t0", 0, vec![el])],
        });
        let mut r = renderer(p);
        r.render_frame(0.0).unwrap();
        let corner = r.surface().pixel(0, 0).unwrap();
        assert!(corner[1] > 200, "expected green-tinted background, got {corner:?}");
    }

    #[test]
    fn fifty_times_scale_renders_only_the_visible_part() {
        let mut el = media("a", "red", 0.0, 1.0);
        el.transform.scale = 50.0;
        let p = Arc::new(Project {
            id: "p".to_string(),
            canvas: Canvas::new(32, 18),
            background: Background::BlurredMedia {
                fallback: Rgba8::BLACK,
                radius: 8,
            },
            tracks: vec![track("t0", 0, vec![el])],
        });
        let config = ExportConfig::default();
        let mut r = FrameRenderer::new(p, &catalog(), Arc::new(Solids), Canvas::new(1920, 1080), &config);
        r.render_frame(0.0).unwrap();
        assert_eq!(r.surface().pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(r.surface().pixel(1919, 1079), Some([255, 0, 0, 255]));
    }

    /// Answers the opening seek, then stalls far past any seek timeout.
    #[derive(Default)]
    struct Stalling {
        served_first: bool,
    }

    impl FrameSource for Stalling {
        fn natural_size(&self) -> (u32, u32) {
            (16, 9)
        }
        fn duration_secs(&self) -> Option<f64> {
            Some(60.0)
        }
        fn frame_at(&mut self, _t: f64) -> ExportResult<Picture> {
            if self.served_first {
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
            self.served_first = true;
            Ok(Picture::solid(16, 9, [0, 200, 0, 255]))
        }
    }

    struct StallingLoader;

    impl MediaLoader for StallingLoader {
        fn open(&self, _: &MediaItem) -> ExportResult<Box<dyn FrameSource>> {
            Ok(Box::new(Stalling::default()))
        }
    }

    fn stalling_renderer(max_failures: u32) -> FrameRenderer {
        let p = project(vec![track("t0", 0, vec![media("a", "vid", 0.0, 10.0)])]);
        let catalog: InMemoryCatalog = [MediaItem::new("vid", MediaKind::Video, "vid.mp4")
            .with_size(16, 9)
            .with_duration(60.0)]
        .into_iter()
        .collect();
        let config = ExportConfig {
            open_timeout_ms: 2_000,
            max_consecutive_seek_failures: max_failures,
            seek_timeout: SeekTimeoutPolicy {
                base_ms: 5.0,
                per_clip_minute_ms: 0.0,
                per_seek_second_ms: 0.0,
                min_ms: 5.0,
                max_ms: 10.0,
            },
            ..ExportConfig::default()
        };
        let canvas = p.canvas;
        FrameRenderer::new(p, &catalog, Arc::new(StallingLoader), canvas, &config)
    }

    #[test]
    fn seek_timeout_reuses_last_good_picture() {
        let mut r = stalling_renderer(90);
        let report = r.render_frame(0.5).unwrap();
        assert_eq!(report.seek_timeouts, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(r.surface().pixel(16, 9), Some([0, 200, 0, 255]));
        assert_eq!(r.stats().seek_timeouts, 1);
    }

    #[test]
    fn repeated_seek_failures_escalate() {
        let mut r = stalling_renderer(3);
        for i in 1..=3 {
            r.render_frame(f64::from(i) * 0.1).unwrap();
        }
        let err = r.render_frame(0.4).unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::TransientMedia);
        assert!(err.to_string().contains("4 consecutive frames"));
    }
}
