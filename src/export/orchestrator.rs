//! One export run: preflight, the frame loop, finalizing, and teardown.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::ExportConfig;
use crate::encode::backend::{BackendKind, EncodeConfig, EncodeProgress, EncodedOutput, EncoderBackend};
use crate::encode::capture::{CaptureTap, capture_stream};
use crate::estimate::MemoryEstimate;
use crate::export::cancel::CancellationToken;
use crate::export::history::{ExportHistory, HistoryEntry};
use crate::export::progress::{ExportProgress, ProgressHub, ProgressTracker};
use crate::export::state::{ExportState, StateCell};
use crate::factory::BackendFactory;
use crate::foundation::core::{Canvas, FrameIndex};
use crate::foundation::error::{ErrorKind, ExportError, ExportResult};
use crate::media::source::MediaLoader;
use crate::model::media::MediaCatalog;
use crate::model::project::Project;
use crate::model::settings::{ExportFormat, ExportSettings};
use crate::render::renderer::{FrameRenderer, RenderStats};
use crate::render::text::TextRasterizer;
use crate::render::verify::FrameVerdict;

/// Collaborators a run reads from: the media catalog, how media is opened, and optional fonts.
#[derive(Clone)]
pub struct ExportContext {
    pub catalog: Arc<dyn MediaCatalog>,
    pub loader: Arc<dyn MediaLoader>,
    /// Font database for text elements; system fonts are loaded on first use when unset.
    pub fonts: Option<Arc<usvg::fontdb::Database>>,
}

impl std::fmt::Debug for ExportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportContext")
            .field("fonts", &self.fonts.as_ref().map(|db| db.len()))
            .finish_non_exhaustive()
    }
}

impl ExportContext {
    pub fn new(catalog: Arc<dyn MediaCatalog>, loader: Arc<dyn MediaLoader>) -> Self {
        Self {
            catalog,
            loader,
            fonts: None,
        }
    }

    pub fn with_fonts(mut self, fonts: Arc<usvg::fontdb::Database>) -> Self {
        self.fonts = Some(fonts);
        self
    }
}

/// Shared handles a run reports through. The engine keeps clones to observe and steer the run.
#[derive(Clone, Debug)]
pub struct RunSetup {
    pub run_id: u64,
    pub state: StateCell,
    pub cancel: CancellationToken,
    pub hub: ProgressHub,
    pub history: Arc<Mutex<ExportHistory>>,
}

impl RunSetup {
    /// Standalone setup with its own history ring.
    pub fn new(run_id: u64, history_capacity: usize) -> Self {
        Self {
            run_id,
            state: StateCell::default(),
            cancel: CancellationToken::new(),
            hub: ProgressHub::default(),
            history: Arc::new(Mutex::new(ExportHistory::new(history_capacity))),
        }
    }
}

/// Encoded file handed back to the caller of a completed run.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportOutput {
    pub bytes: Vec<u8>,
    pub format: ExportFormat,
    pub size_bytes: u64,
    pub duration_secs: f64,
    pub filename: String,
    pub backend: BackendKind,
}

/// Terminal result of a run. `output` is only present when `state` is `Completed`.
#[derive(Clone, Debug)]
pub struct ExportOutcome {
    pub run_id: u64,
    pub state: ExportState,
    pub output: Option<ExportOutput>,
    pub message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub warnings: Vec<String>,
    pub stats: RenderStats,
    pub frames_rendered: u64,
    pub total_frames: u64,
    pub backend: Option<BackendKind>,
    pub memory: Option<MemoryEstimate>,
    /// Live decode handles left after teardown; zero once media is released.
    pub media_cache_len: usize,
}

impl ExportOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == ExportState::Completed
    }
}

/// Drives one run from `Preflight` to a terminal state.
///
/// Built by [`Orchestrator::prepare`], which performs every check that can fail before a frame
/// is drawn; [`Orchestrator::run`] never returns an error, only an [`ExportOutcome`].
pub struct Orchestrator {
    setup: RunSetup,
    project: Arc<Project>,
    settings: ExportSettings,
    config: ExportConfig,
    kind: BackendKind,
    backend: Box<dyn EncoderBackend>,
    renderer: FrameRenderer,
    canvas: Canvas,
    duration_secs: f64,
    total_frames: u64,
    frames_rendered: u64,
    progress: ProgressTracker,
    memory: MemoryEstimate,
    warnings: Vec<String>,
    started_at: chrono::DateTime<chrono::Utc>,
    started: Instant,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.setup.run_id)
            .field("project", &self.project.id)
            .field("backend", &self.kind)
            .field("canvas", &self.canvas)
            .field("total_frames", &self.total_frames)
            .field("state", &self.setup.state.get())
            .finish_non_exhaustive()
    }
}

struct PreflightFailure<'a> {
    setup: &'a RunSetup,
    project: &'a Project,
    settings: &'a ExportSettings,
    started_at: chrono::DateTime<chrono::Utc>,
    started: Instant,
    duration_secs: f64,
    total_frames: u64,
    backend: Option<BackendKind>,
}

impl PreflightFailure<'_> {
    fn record(&self, err: ExportError) -> ExportError {
        tracing::warn!(run_id = self.setup.run_id, project = %self.project.id, "export preflight failed: {err}");
        self.setup.state.transition(ExportState::Failed);
        self.setup.history.lock().push(HistoryEntry {
            run_id: self.setup.run_id,
            project_id: self.project.id.clone(),
            started_at: self.started_at,
            finished_at: chrono::Utc::now(),
            settings: self.settings.clone(),
            duration_secs: self.duration_secs,
            total_frames: self.total_frames,
            frames_rendered: 0,
            output_size_bytes: None,
            wall_clock_secs: self.started.elapsed().as_secs_f64(),
            success: false,
            state: ExportState::Failed,
            backend: self.backend,
            message: Some(err.to_string()),
            error_kind: Some(err.kind()),
        });
        err
    }
}

fn validate_run(
    config: &ExportConfig,
    project: &Project,
    settings: &ExportSettings,
    total_frames: u64,
) -> ExportResult<()> {
    config.validate()?;
    project.validate()?;
    settings.validate(project.canvas)?;
    if total_frames == 0 {
        return Err(ExportError::validation("timeline is empty; nothing to export"));
    }
    Ok(())
}

impl Orchestrator {
    /// Run every preflight step: validation, backend resolution, the memory gate, and encoder
    /// initialization.
    ///
    /// On error the run is moved to `Failed` and a failed history entry is recorded before the
    /// error is returned.
    pub fn prepare(
        factory: &BackendFactory,
        ctx: &ExportContext,
        project: Arc<Project>,
        settings: ExportSettings,
        explicit: Option<BackendKind>,
        setup: RunSetup,
    ) -> ExportResult<Self> {
        let started_at = chrono::Utc::now();
        let started = Instant::now();
        setup.state.transition(ExportState::Preflight);

        let duration_secs = project.total_duration_secs();
        let total_frames = settings.fps.total_frames(duration_secs);
        let mut failure = PreflightFailure {
            setup: &setup,
            project: &project,
            settings: &settings,
            started_at,
            started,
            duration_secs,
            total_frames,
            backend: None,
        };

        let config = factory.config().clone();
        if let Err(err) = validate_run(&config, &project, &settings, total_frames) {
            return Err(failure.record(err));
        }

        let canvas = settings.output_canvas(project.canvas);
        let mut renderer = FrameRenderer::new(
            Arc::clone(&project),
            ctx.catalog.as_ref(),
            Arc::clone(&ctx.loader),
            canvas,
            &config,
        );
        if let Some(fonts) = &ctx.fonts {
            renderer = renderer.with_text_rasterizer(TextRasterizer::with_fontdb(Arc::clone(fonts)));
        }
        let handle_count = renderer.visual_items().len().min(config.media_cache_capacity);

        let kind = match factory.resolve(&settings, canvas, duration_secs, handle_count, explicit) {
            Ok(kind) => kind,
            Err(err) => return Err(failure.record(err)),
        };
        failure.backend = Some(kind);

        let estimator = factory.estimator();
        let memory = estimator.estimate(&settings, canvas, duration_secs, kind, handle_count);
        if let Err(err) = estimator.check(&memory, settings.override_memory_gate) {
            return Err(failure.record(err));
        }
        let mut warnings = Vec::new();
        if let Some(advisory) = &memory.advisory {
            warnings.push(advisory.message.clone());
        }

        let mut progress = ProgressTracker::new(setup.run_id, setup.hub.clone());
        progress.set_total(total_frames);
        let encoded = progress.encoded_counter();

        let mut cfg = EncodeConfig::new(canvas.width, canvas.height, settings.fps, settings.format, total_frames)
            .with_quality(settings.quality)
            .with_progress(Arc::new(move |p: EncodeProgress| {
                encoded.fetch_max(p.current_frame, Ordering::Relaxed);
            }));
        let bg = project.background.base_color();
        cfg.background = [bg.r, bg.g, bg.b];

        let backend = factory.instantiate(kind).and_then(|mut backend| {
            backend.initialize(cfg)?;
            Ok(backend)
        });
        let backend = match backend {
            Ok(backend) => backend,
            Err(err) => return Err(failure.record(err)),
        };

        tracing::info!(
            run_id = setup.run_id,
            project = %project.id,
            backend = %kind,
            width = canvas.width,
            height = canvas.height,
            total_frames,
            memory_level = ?memory.level,
            "export prepared"
        );

        Ok(Self {
            setup,
            project,
            settings,
            config,
            kind,
            backend,
            renderer,
            canvas,
            duration_secs,
            total_frames,
            frames_rendered: 0,
            progress,
            memory,
            warnings,
            started_at,
            started,
        })
    }

    pub fn run_id(&self) -> u64 {
        self.setup.run_id
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn state(&self) -> &StateCell {
        &self.setup.state
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.setup.cancel
    }

    pub fn latest_progress(&self) -> Arc<Mutex<ExportProgress>> {
        self.progress.latest()
    }

    pub fn memory_estimate(&self) -> &MemoryEstimate {
        &self.memory
    }

    /// Render, encode and finalize. Always ends in a terminal state.
    pub fn run(mut self) -> ExportOutcome {
        let span = tracing::info_span!("export", run_id = self.setup.run_id, project = %self.project.id);
        let _guard = span.enter();

        match self.execute() {
            Ok(encoded) => self.complete(encoded),
            Err(err) => self.abort(err),
        }
    }

    fn execute(&mut self) -> ExportResult<EncodedOutput> {
        let report = self.renderer.preload();
        for (id, reason) in &report.failed {
            self.warnings.push(format!("media '{id}' could not be opened: {reason}"));
        }
        tracing::debug!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "media preloaded"
        );

        if self.setup.cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        self.setup.state.transition(ExportState::Rendering);
        self.progress.start();
        self.progress.status(ExportState::Rendering, "rendering");

        let mut tap = self.attach_capture()?;
        let fps = self.settings.fps;
        let frame_yield = self.config.frame_yield();
        let mut degraded_reported = false;

        for n in 0..self.total_frames {
            if self.setup.cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            let idx = FrameIndex(n);
            let report = self.renderer.render_frame(fps.frame_time_secs(idx))?;
            if matches!(report.verdict, FrameVerdict::DegradedRun { .. }) && !degraded_reported {
                degraded_reported = true;
                self.warnings.push(format!(
                    "output may contain black frames (detected around frame {n})"
                ));
            }

            let frame = self.renderer.frame();
            match &tap {
                Some(tap) => tap.publish(idx, &frame)?,
                None => self.backend.ingest_frame(idx, &frame)?,
            }
            self.frames_rendered = n + 1;
            self.progress.frame_done(self.frames_rendered);

            if frame_yield.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(frame_yield);
            }
        }

        if let Some(tap) = tap.as_mut() {
            tap.close();
        }
        if self.setup.cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        self.setup.state.transition(ExportState::Finalizing);
        self.progress.status(ExportState::Finalizing, "finalizing");
        let encoded = self.backend.finalize()?;
        if encoded.frames != self.total_frames {
            return Err(ExportError::backend(format!(
                "{} encoder produced {} of {} frames",
                self.kind, encoded.frames, self.total_frames
            )));
        }
        if self.setup.cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        Ok(encoded)
    }

    fn attach_capture(&mut self) -> ExportResult<Option<CaptureTap>> {
        let caps = self.backend.capabilities();
        if caps.pushed_frames || !caps.capture_stream {
            return Ok(None);
        }
        let (tap, source) = capture_stream(self.config.ingest_queue_depth);
        self.backend.attach_capture_source(source)?;
        Ok(Some(tap))
    }

    fn complete(mut self, encoded: EncodedOutput) -> ExportOutcome {
        self.renderer.release_media();
        self.setup.state.transition(ExportState::Completed);
        self.progress.complete();

        let output = ExportOutput {
            size_bytes: encoded.size_bytes,
            duration_secs: encoded.duration_secs,
            format: encoded.format,
            filename: self.settings.output_filename(),
            backend: self.kind,
            bytes: encoded.bytes,
        };
        tracing::info!(
            frames = self.frames_rendered,
            bytes = output.size_bytes,
            secs = self.started.elapsed().as_secs_f64(),
            "export completed"
        );
        self.record(ExportState::Completed, Some(output.size_bytes), None);
        self.outcome(ExportState::Completed, Some(output), None)
    }

    fn abort(mut self, err: ExportError) -> ExportOutcome {
        // Stop the encoder first so no partial file survives.
        self.backend.cancel();
        self.renderer.release_media();

        let state = if err.is_cancelled() {
            tracing::info!(frames = self.frames_rendered, "export cancelled");
            ExportState::Cancelled
        } else {
            tracing::error!(frames = self.frames_rendered, "export failed: {err}");
            ExportState::Failed
        };
        self.setup.state.transition(state);
        self.progress.status(state, err.to_string());
        self.record(state, None, Some(&err));
        self.outcome(state, None, Some(&err))
    }

    fn record(&self, state: ExportState, output_size_bytes: Option<u64>, err: Option<&ExportError>) {
        self.setup.history.lock().push(HistoryEntry {
            run_id: self.setup.run_id,
            project_id: self.project.id.clone(),
            started_at: self.started_at,
            finished_at: chrono::Utc::now(),
            settings: self.settings.clone(),
            duration_secs: self.duration_secs,
            total_frames: self.total_frames,
            frames_rendered: self.frames_rendered,
            output_size_bytes,
            wall_clock_secs: self.started.elapsed().as_secs_f64(),
            success: state == ExportState::Completed,
            state,
            backend: Some(self.kind),
            message: err.map(ToString::to_string),
            error_kind: err.map(ExportError::kind),
        });
    }

    fn outcome(
        &mut self,
        state: ExportState,
        output: Option<ExportOutput>,
        err: Option<&ExportError>,
    ) -> ExportOutcome {
        ExportOutcome {
            run_id: self.setup.run_id,
            state,
            output,
            message: err.map(ToString::to_string),
            error_kind: err.map(ExportError::kind),
            warnings: std::mem::take(&mut self.warnings),
            stats: self.renderer.stats(),
            frames_rendered: self.frames_rendered,
            total_frames: self.total_frames,
            backend: Some(self.kind),
            memory: Some(self.memory.clone()),
            media_cache_len: self.renderer.cache().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::FrameCollector;
    use crate::factory::CapabilityProbe;
    use crate::factory::probe::test_capabilities;
    use crate::foundation::core::{Fps, Rgba8};
    use crate::media::source::{FrameSource, Picture, StillImageSource};
    use crate::model::media::{InMemoryCatalog, MediaId, MediaItem, MediaKind};
    use crate::model::project::{
        Background, ElementKind, MediaElement, TimelineElement, Track, Transform,
    };

    struct Solid;

    impl MediaLoader for Solid {
        fn open(&self, _item: &MediaItem) -> ExportResult<Box<dyn FrameSource>> {
            Ok(Box::new(StillImageSource::new(Picture::solid(8, 8, [0, 200, 0, 255]))))
        }
    }

    fn project(secs: f64) -> Arc<Project> {
        let elements = if secs > 0.0 {
            vec![TimelineElement {
                id: "e".into(),
                start_secs: 0.0,
                duration_secs: secs,
                hidden: false,
                transform: Transform::default(),
                kind: ElementKind::Media(MediaElement {
                    media_id: MediaId::new("m"),
                    trim_in_secs: 0.0,
                    trim_out_secs: None,
                }),
            }]
        } else {
            Vec::new()
        };
        Arc::new(Project {
            id: "p".into(),
            canvas: Canvas::new(16, 8),
            background: Background::Solid { color: Rgba8::BLACK },
            tracks: vec![Track {
                id: "t".into(),
                z_index: 0,
                hidden: false,
                elements,
            }],
        })
    }

    fn fixture() -> (BackendFactory, ExportContext, crate::encode::CollectorProbe) {
        let config = ExportConfig {
            frame_yield_micros: 0,
            ..ExportConfig::default()
        };
        let mut factory = BackendFactory::new(
            config,
            Arc::new(CapabilityProbe::fixed(test_capabilities(false, false))),
        );
        let (collector, probe) = FrameCollector::with_probe();
        let slot = Arc::new(Mutex::new(Some(collector)));
        factory.register(
            BackendKind::Native,
            Arc::new(move || match slot.lock().take() {
                Some(c) => Box::new(c),
                None => Box::new(FrameCollector::new()),
            }),
        );
        let catalog: InMemoryCatalog =
            [MediaItem::new("m", MediaKind::Image, "m.png")].into_iter().collect();
        let ctx = ExportContext::new(Arc::new(catalog), Arc::new(Solid));
        (factory, ctx, probe)
    }

    fn settings() -> ExportSettings {
        ExportSettings::new("clip", ExportFormat::Mp4, Fps::integer(10).unwrap())
    }

    #[test]
    fn completes_with_exact_frame_count() {
        let (factory, ctx, probe) = fixture();
        let orch = factory.create_engine(&ctx, project(1.5), settings(), None).unwrap();
        assert_eq!(orch.total_frames(), 15);
        let outcome = orch.run();
        assert_eq!(outcome.state, ExportState::Completed);
        assert_eq!(outcome.frames_rendered, 15);
        assert_eq!(probe.state().frames_ingested, 15);
        let output = outcome.output.unwrap();
        assert_eq!(output.filename, "clip.mp4");
        assert_eq!(output.size_bytes, 15 * 16 * 8 * 4);
        assert_eq!(outcome.media_cache_len, 0);
    }

    #[test]
    fn empty_timeline_fails_before_backend_exists() {
        let (factory, ctx, probe) = fixture();
        let setup = RunSetup::new(3, 10);
        let history = setup.history.clone();
        let state = setup.state.clone();
        let err = Orchestrator::prepare(&factory, &ctx, project(0.0), settings(), None, setup)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!probe.state().initialized);
        assert_eq!(state.get(), ExportState::Failed);
        let h = history.lock();
        assert_eq!(h.len(), 1);
        assert!(!h.entries()[0].success);
    }

    #[test]
    fn cancel_before_run_is_cancelled_without_output() {
        let (factory, ctx, probe) = fixture();
        let orch = factory.create_engine(&ctx, project(1.0), settings(), None).unwrap();
        orch.cancel_token().cancel();
        let outcome = orch.run();
        assert_eq!(outcome.state, ExportState::Cancelled);
        assert!(outcome.output.is_none());
        assert_eq!(outcome.frames_rendered, 0);
        assert_eq!(probe.state().cancel_calls, 1);
    }
}
