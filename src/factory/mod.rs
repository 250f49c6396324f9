//! Backend Factory: capability probing, recommendation, and backend instantiation.

pub mod probe;
pub mod recommend;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ExportConfig;
use crate::encode::backend::{BackendKind, EncoderBackend};
use crate::encode::{CaptureBackend, HardwareBackend, NativeBackend, TranscoderBackend};
use crate::estimate::MemoryEstimator;
use crate::export::orchestrator::{ExportContext, Orchestrator, RunSetup};
use crate::foundation::core::Canvas;
use crate::foundation::error::{ExportError, ExportResult};
use crate::model::project::Project;
use crate::model::settings::ExportSettings;

pub use probe::{Availability, CapabilityProbe, FixedProber, HostCapabilities, HostProber, SystemProber};
pub use recommend::{Recommendation, ScoredBackend, SpeedLabel, recommend};

/// Builds a backend instance in place of the built-in one for a kind.
pub type BackendBuilder = Arc<dyn Fn() -> Box<dyn EncoderBackend> + Send + Sync>;

pub struct BackendFactory {
    config: ExportConfig,
    probe: Arc<CapabilityProbe>,
    builders: HashMap<BackendKind, BackendBuilder>,
}

impl std::fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendFactory")
            .field("probe", &self.probe)
            .field("overridden", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendFactory {
    pub fn new(config: ExportConfig, probe: Arc<CapabilityProbe>) -> Self {
        Self {
            config,
            probe,
            builders: HashMap::new(),
        }
    }

    /// Factory probing the real host.
    pub fn system(config: ExportConfig) -> Self {
        let probe = Arc::new(CapabilityProbe::system(&config));
        Self::new(config, probe)
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Memoized host capabilities; probes on first use.
    pub fn probe_capabilities(&self) -> Arc<HostCapabilities> {
        self.probe.get()
    }

    pub fn refresh_capabilities(&self) -> Arc<HostCapabilities> {
        self.probe.refresh()
    }

    pub fn capability_probe(&self) -> &Arc<CapabilityProbe> {
        &self.probe
    }

    /// Replace how `kind` is built. A registered kind counts as available on this host.
    pub fn register(&mut self, kind: BackendKind, builder: BackendBuilder) {
        self.builders.insert(kind, builder);
    }

    pub fn estimator(&self) -> MemoryEstimator {
        MemoryEstimator::new(&self.config, self.probe_capabilities().device_memory_bytes)
    }

    pub fn recommend(
        &self,
        settings: &ExportSettings,
        canvas: Canvas,
        duration_secs: f64,
        handle_count: usize,
    ) -> Recommendation {
        recommend(
            |kind| self.availability(kind),
            &self.estimator(),
            settings,
            canvas,
            duration_secs,
            handle_count,
        )
    }

    /// Pick the backend for a run: the explicit choice when given, else the top recommendation.
    pub fn resolve(
        &self,
        settings: &ExportSettings,
        canvas: Canvas,
        duration_secs: f64,
        handle_count: usize,
        explicit: Option<BackendKind>,
    ) -> ExportResult<BackendKind> {
        if let Some(kind) = explicit.or(settings.backend.explicit()) {
            if !kind.supports(settings.format) {
                return Err(ExportError::configuration(format!(
                    "{kind} backend cannot produce '{}' output",
                    settings.format.extension()
                )));
            }
            let availability = self.availability(kind);
            if !availability.usable {
                return Err(ExportError::configuration(format!(
                    "{kind} backend is unavailable: {}",
                    availability.reason.unwrap_or_default()
                )));
            }
            return Ok(kind);
        }

        let rec = self.recommend(settings, canvas, duration_secs, handle_count);
        match rec.best() {
            Some(best) => {
                tracing::info!(
                    backend = %best.kind,
                    label = best.label.as_str(),
                    score = best.score,
                    "selected backend"
                );
                Ok(best.kind)
            }
            None => Err(ExportError::configuration(format!(
                "no available backend can produce '{}' output",
                settings.format.extension()
            ))),
        }
    }

    pub fn instantiate(&self, kind: BackendKind) -> ExportResult<Box<dyn EncoderBackend>> {
        if let Some(build) = self.builders.get(&kind) {
            return Ok(build());
        }
        let caps = self.probe_capabilities();
        let availability = caps.availability(kind);
        if !availability.usable {
            return Err(ExportError::configuration(format!(
                "{kind} backend is unavailable: {}",
                availability.reason.unwrap_or_default()
            )));
        }
        let tool = || {
            caps.transcoder
                .clone()
                .ok_or_else(|| ExportError::configuration("transcoding tool not found"))
        };
        Ok(match kind {
            BackendKind::Capture => Box::new(CaptureBackend::new()),
            BackendKind::InProcess => Box::new(TranscoderBackend::new(
                tool()?,
                self.config.vfs_limit_bytes,
                self.config.ingest_queue_depth,
            )),
            BackendKind::Native => Box::new(NativeBackend::new(tool()?)),
            BackendKind::Hardware => {
                let encoder = caps.hardware_encoder().ok_or_else(|| {
                    ExportError::configuration("no verified hardware encoder")
                })?;
                Box::new(HardwareBackend::new(tool()?, encoder))
            }
        })
    }

    /// Bind an orchestrator to the explicit variant or the top recommendation.
    pub fn create_engine(
        &self,
        ctx: &ExportContext,
        project: Arc<Project>,
        settings: ExportSettings,
        explicit: Option<BackendKind>,
    ) -> ExportResult<Orchestrator> {
        let setup = RunSetup::new(0, self.config.history_capacity);
        Orchestrator::prepare(self, ctx, project, settings, explicit, setup)
    }

    /// Availability of `kind` on this host; registered kinds always count as usable.
    pub fn availability(&self, kind: BackendKind) -> Availability {
        if self.builders.contains_key(&kind) {
            return Availability::yes();
        }
        self.probe_capabilities().availability(kind)
    }
}
