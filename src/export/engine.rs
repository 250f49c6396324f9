use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::config::ExportConfig;
use crate::encode::backend::BackendKind;
use crate::export::cancel::CancellationToken;
use crate::export::history::{ExportHistory, HistoryEntry};
use crate::export::orchestrator::{ExportContext, ExportOutcome, Orchestrator, RunSetup};
use crate::export::progress::{ExportProgress, ProgressCallback, ProgressHub};
use crate::export::state::{ExportState, StateCell};
use crate::factory::{BackendFactory, HostCapabilities};
use crate::foundation::error::{ErrorKind, ExportError, ExportResult};
use crate::media::source::MediaLoader;
use crate::model::media::MediaCatalog;
use crate::model::project::Project;
use crate::model::settings::ExportSettings;
use crate::render::renderer::RenderStats;

/// Entry point for callers: starts runs, fans out progress, keeps history.
///
/// At most one run per project id is active at a time.
pub struct ExportEngine {
    factory: BackendFactory,
    ctx: ExportContext,
    history: Arc<Mutex<ExportHistory>>,
    hub: ProgressHub,
    active: Arc<Mutex<HashSet<String>>>,
    next_run: AtomicU64,
}

impl std::fmt::Debug for ExportEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportEngine")
            .field("factory", &self.factory)
            .field("active", &*self.active.lock())
            .field("history", &self.history.lock().len())
            .finish_non_exhaustive()
    }
}

impl ExportEngine {
    /// Engine probing the real host for encoders.
    pub fn new(
        config: ExportConfig,
        catalog: Arc<dyn MediaCatalog>,
        loader: Arc<dyn MediaLoader>,
    ) -> Self {
        Self::with_factory(BackendFactory::system(config), ExportContext::new(catalog, loader))
    }

    pub fn with_factory(factory: BackendFactory, ctx: ExportContext) -> Self {
        let capacity = factory.config().history_capacity;
        Self {
            factory,
            ctx,
            history: Arc::new(Mutex::new(ExportHistory::new(capacity))),
            hub: ProgressHub::default(),
            active: Arc::new(Mutex::new(HashSet::new())),
            next_run: AtomicU64::new(1),
        }
    }

    pub fn factory(&self) -> &BackendFactory {
        &self.factory
    }

    /// Mutable factory access, e.g. to register backend builders before the first run.
    pub fn factory_mut(&mut self) -> &mut BackendFactory {
        &mut self.factory
    }

    pub fn context(&self) -> &ExportContext {
        &self.ctx
    }

    pub fn capabilities(&self) -> Arc<HostCapabilities> {
        self.factory.probe_capabilities()
    }

    /// Subscribe to progress updates of every run started by this engine.
    pub fn on_progress(&self, cb: impl Fn(u64, &ExportProgress) + Send + Sync + 'static) {
        let cb: ProgressCallback = Arc::new(cb);
        self.hub.subscribe(cb);
    }

    /// Start an export on a background thread.
    ///
    /// Preflight runs before this returns: validation, configuration and memory-gate errors come
    /// back here and are also recorded in history.
    pub fn start_export(&self, project: Arc<Project>, settings: ExportSettings) -> ExportResult<ExportRun> {
        self.start_export_with(project, settings, None, CancellationToken::new())
    }

    /// Like [`Self::start_export`] with an explicit backend and a caller-owned cancellation token.
    pub fn start_export_with(
        &self,
        project: Arc<Project>,
        settings: ExportSettings,
        explicit: Option<BackendKind>,
        cancel: CancellationToken,
    ) -> ExportResult<ExportRun> {
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let guard = match ActiveGuard::acquire(&self.active, &project.id) {
            Some(guard) => guard,
            None => {
                let err = ExportError::validation(format!(
                    "export already running for project '{}'",
                    project.id
                ));
                self.record_rejected(run_id, &project, &settings, &err);
                return Err(err);
            }
        };

        let setup = RunSetup {
            run_id,
            state: StateCell::default(),
            cancel: cancel.clone(),
            hub: self.hub.clone(),
            history: self.history.clone(),
        };
        let state = setup.state.clone();
        let orch = Orchestrator::prepare(&self.factory, &self.ctx, project, settings, explicit, setup)?;
        let progress = orch.latest_progress();
        let backend = orch.backend_kind();
        let total_frames = orch.total_frames();

        let thread = std::thread::Builder::new()
            .name(format!("reelcast-export-{run_id}"))
            .spawn(move || {
                let _guard = guard;
                orch.run()
            })
            .map_err(|e| ExportError::resource(format!("spawn export thread: {e}")))?;

        Ok(ExportRun {
            id: run_id,
            backend,
            total_frames,
            state,
            cancel,
            progress,
            thread: Some(thread),
        })
    }

    /// Start and wait. Preflight errors are still returned as `Err`.
    pub fn export_blocking(&self, project: Arc<Project>, settings: ExportSettings) -> ExportResult<ExportOutcome> {
        Ok(self.start_export(project, settings)?.wait())
    }

    pub fn cancel(&self, run: &ExportRun) -> bool {
        run.cancel()
    }

    pub fn is_active(&self, project_id: &str) -> bool {
        self.active.lock().contains(project_id)
    }

    /// History entries, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().entries()
    }

    pub fn history_json(&self) -> ExportResult<String> {
        self.history.lock().to_json()
    }

    fn record_rejected(&self, run_id: u64, project: &Project, settings: &ExportSettings, err: &ExportError) {
        let now = chrono::Utc::now();
        let duration_secs = project.total_duration_secs();
        self.history.lock().push(HistoryEntry {
            run_id,
            project_id: project.id.clone(),
            started_at: now,
            finished_at: now,
            settings: settings.clone(),
            duration_secs,
            total_frames: settings.fps.total_frames(duration_secs),
            frames_rendered: 0,
            output_size_bytes: None,
            wall_clock_secs: 0.0,
            success: false,
            state: ExportState::Failed,
            backend: None,
            message: Some(err.to_string()),
            error_kind: Some(err.kind()),
        });
    }
}

/// Marks a project as exporting until dropped.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    project_id: String,
}

impl ActiveGuard {
    fn acquire(active: &Arc<Mutex<HashSet<String>>>, project_id: &str) -> Option<Self> {
        if !active.lock().insert(project_id.to_string()) {
            return None;
        }
        Some(Self {
            active: active.clone(),
            project_id: project_id.to_string(),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.project_id);
    }
}

/// Handle to a running export.
pub struct ExportRun {
    id: u64,
    backend: BackendKind,
    total_frames: u64,
    state: StateCell,
    cancel: CancellationToken,
    progress: Arc<Mutex<ExportProgress>>,
    thread: Option<JoinHandle<ExportOutcome>>,
}

impl std::fmt::Debug for ExportRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportRun")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl ExportRun {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn state(&self) -> ExportState {
        self.state.get()
    }

    /// Request cancellation at the next frame boundary. Idempotent.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn progress(&self) -> ExportProgress {
        self.progress.lock().clone()
    }

    /// Block until the run reaches a terminal state.
    pub fn wait(mut self) -> ExportOutcome {
        let Some(thread) = self.thread.take() else {
            return self.lost("export thread already joined");
        };
        match thread.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                self.state.transition(ExportState::Failed);
                self.lost("export thread panicked")
            }
        }
    }

    fn lost(&self, message: &str) -> ExportOutcome {
        tracing::error!(run_id = self.id, "{message}");
        ExportOutcome {
            run_id: self.id,
            state: ExportState::Failed,
            output: None,
            message: Some(message.to_string()),
            error_kind: Some(ErrorKind::Other),
            warnings: Vec::new(),
            stats: RenderStats::default(),
            frames_rendered: self.progress.lock().current_frame,
            total_frames: self.total_frames,
            backend: Some(self.backend),
            memory: None,
            media_cache_len: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::FrameCollector;
    use crate::factory::CapabilityProbe;
    use crate::factory::probe::test_capabilities;
    use crate::foundation::core::{Canvas, Fps};
    use crate::media::source::{FrameSource, Picture, StillImageSource};
    use crate::model::media::{InMemoryCatalog, MediaItem};
    use crate::model::project::{ElementKind, TextElement, TimelineElement, Track, Transform};
    use crate::model::settings::ExportFormat;

    struct Blank;

    impl MediaLoader for Blank {
        fn open(&self, _item: &MediaItem) -> ExportResult<Box<dyn FrameSource>> {
            Ok(Box::new(StillImageSource::new(Picture::solid(2, 2, [0, 0, 0, 255]))))
        }
    }

    fn engine() -> ExportEngine {
        let config = ExportConfig {
            frame_yield_micros: 0,
            ..ExportConfig::default()
        };
        let mut factory = BackendFactory::new(
            config,
            Arc::new(CapabilityProbe::fixed(test_capabilities(false, false))),
        );
        factory.register(BackendKind::Native, Arc::new(|| Box::new(FrameCollector::new())));
        ExportEngine::with_factory(
            factory,
            ExportContext::new(Arc::new(InMemoryCatalog::new()), Arc::new(Blank)),
        )
    }

    fn project(id: &str, secs: f64) -> Arc<Project> {
        Arc::new(Project {
            id: id.into(),
            canvas: Canvas::new(8, 8),
            background: Default::default(),
            tracks: vec![Track {
                id: "t".into(),
                z_index: 0,
                hidden: false,
                elements: vec![TimelineElement {
                    id: "gap".into(),
                    start_secs: secs,
                    duration_secs: 0.0,
                    hidden: false,
                    transform: Transform::default(),
                    kind: ElementKind::Text(TextElement {
                        content: String::new(),
                        style: Default::default(),
                    }),
                }],
            }],
        })
    }

    fn settings() -> ExportSettings {
        ExportSettings::new("out", ExportFormat::Mp4, Fps::integer(10).unwrap())
    }

    #[test]
    fn blocking_export_records_history() {
        let engine = engine();
        let outcome = engine.export_blocking(project("a", 1.0), settings()).unwrap();
        assert_eq!(outcome.state, ExportState::Completed);
        assert_eq!(outcome.frames_rendered, 10);
        let history = engine.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert!(!engine.is_active("a"));

        let json: serde_json::Value = serde_json::from_str(&engine.history_json().unwrap()).unwrap();
        assert_eq!(json[0]["project_id"], "a");
        assert_eq!(json[0]["frames_rendered"], 10);
    }

    #[test]
    fn second_run_of_same_project_is_rejected() {
        use std::sync::atomic::AtomicBool;

        let engine = engine();
        let hold = Arc::new(AtomicBool::new(true));
        let h = hold.clone();
        engine.on_progress(move |_, p| {
            while p.state == ExportState::Rendering && h.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });
        let first = engine.start_export(project("a", 10.0), settings()).unwrap();
        let err = engine.start_export(project("a", 1.0), settings()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("already running"));
        first.cancel();
        hold.store(false, Ordering::SeqCst);
        let outcome = first.wait();
        assert_eq!(outcome.state, ExportState::Cancelled);
        assert!(!engine.is_active("a"));
        assert!(engine.start_export(project("a", 0.5), settings()).unwrap().wait().is_completed());
    }

    #[test]
    fn progress_subscribers_see_every_frame() {
        let engine = engine();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let f = frames.clone();
        engine.on_progress(move |_, p| {
            if p.state == ExportState::Rendering && p.current_frame > 0 {
                f.lock().push(p.current_frame);
            }
        });
        let outcome = engine.export_blocking(project("b", 0.5), settings()).unwrap();
        assert!(outcome.is_completed());
        assert_eq!(*frames.lock(), vec![1, 2, 3, 4, 5]);
    }
}
