use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;

use crate::foundation::error::{ExportError, ExportResult};

/// Process-level tunables of the export pipeline.
///
/// Per-run choices live in [`crate::ExportSettings`]; this struct holds knobs that normally stay
/// fixed for the lifetime of a host. Every field has a default, so partial JSON files are fine.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// LRU bound on live media decode handles.
    pub media_cache_capacity: usize,
    pub seek_timeout: SeekTimeoutPolicy,
    /// How long a new handle may take to produce its first decodable frame.
    pub open_timeout_ms: u64,
    pub verify_every_n_frames: u32,
    pub verify_pixel_stride: usize,
    /// Consecutive black samples before a degraded-quality warning is raised.
    pub black_run_threshold: u32,
    /// Frames in a row where every video element failed to seek before the run is abandoned.
    pub max_consecutive_seek_failures: u32,
    pub history_capacity: usize,
    /// Cooperative pause between frames; `0` only yields the thread.
    pub frame_yield_micros: u64,
    /// Bounded queue depth between the orchestrator and worker-backed encoders.
    pub ingest_queue_depth: usize,
    pub vfs_limit_bytes: u64,
    /// Explicit transcoding tool; looked up on `PATH` when unset.
    pub transcoder_path: Option<PathBuf>,
    /// Whether this host may spawn the transcoding tool as a separate process.
    pub allow_native_process: bool,
    pub benchmark_frames: u32,
    pub memory_thresholds: MemoryThresholds,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            media_cache_capacity: 12,
            seek_timeout: SeekTimeoutPolicy::default(),
            open_timeout_ms: 5_000,
            verify_every_n_frames: 10,
            verify_pixel_stride: 10,
            black_run_threshold: 3,
            max_consecutive_seek_failures: 90,
            history_capacity: 50,
            frame_yield_micros: 50,
            ingest_queue_depth: 4,
            vfs_limit_bytes: 512 * 1024 * 1024,
            transcoder_path: None,
            allow_native_process: true,
            benchmark_frames: 12,
            memory_thresholds: MemoryThresholds::default(),
        }
    }
}

impl ExportConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> ExportResult<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read export config '{}'", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw).map_err(|e| {
            ExportError::validation(format!("invalid export config '{}': {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overlaid with `REELCAST_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("REELCAST_MEDIA_CACHE_CAPACITY").filter(|&n| n > 0) {
            self.media_cache_capacity = n;
        }
        if let Some(n) = env_parse::<usize>("REELCAST_HISTORY_CAPACITY").filter(|&n| n > 0) {
            self.history_capacity = n;
        }
        if let Some(n) = env_parse::<u64>("REELCAST_VFS_LIMIT_BYTES").filter(|&n| n > 0) {
            self.vfs_limit_bytes = n;
        }
        if let Some(b) = env_parse::<bool>("REELCAST_ALLOW_NATIVE") {
            self.allow_native_process = b;
        }
        if let Ok(p) = std::env::var("REELCAST_TRANSCODER")
            && !p.trim().is_empty()
        {
            self.transcoder_path = Some(PathBuf::from(p));
        }
        self
    }

    pub fn validate(&self) -> ExportResult<()> {
        if self.media_cache_capacity == 0 {
            return Err(ExportError::validation("media_cache_capacity must be >= 1"));
        }
        if self.history_capacity == 0 {
            return Err(ExportError::validation("history_capacity must be >= 1"));
        }
        if self.ingest_queue_depth == 0 {
            return Err(ExportError::validation("ingest_queue_depth must be >= 1"));
        }
        if self.verify_every_n_frames == 0 || self.verify_pixel_stride == 0 {
            return Err(ExportError::validation(
                "black-frame verification interval and stride must be >= 1",
            ));
        }
        self.seek_timeout.validate()?;
        self.memory_thresholds.validate()
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn frame_yield(&self) -> Duration {
        Duration::from_micros(self.frame_yield_micros)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Adaptive seek-settlement timeout.
///
/// `base + clip_minutes * per_clip_minute + seek_distance_secs * per_seek_second`, clamped to
/// `[min, max]`.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SeekTimeoutPolicy {
    pub base_ms: f64,
    pub per_clip_minute_ms: f64,
    pub per_seek_second_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl Default for SeekTimeoutPolicy {
    fn default() -> Self {
        Self {
            base_ms: 120.0,
            per_clip_minute_ms: 40.0,
            per_seek_second_ms: 25.0,
            min_ms: 50.0,
            max_ms: 500.0,
        }
    }
}

impl SeekTimeoutPolicy {
    pub fn timeout_for(&self, clip_duration_secs: f64, seek_distance_secs: f64) -> Duration {
        let clip_min = finite_or_zero(clip_duration_secs).max(0.0) / 60.0;
        let distance = finite_or_zero(seek_distance_secs).abs();
        let ms = self.base_ms + clip_min * self.per_clip_minute_ms + distance * self.per_seek_second_ms;
        Duration::from_micros((ms.clamp(self.min_ms, self.max_ms) * 1000.0).round() as u64)
    }

    fn validate(&self) -> ExportResult<()> {
        let all = [
            self.base_ms,
            self.per_clip_minute_ms,
            self.per_seek_second_ms,
            self.min_ms,
            self.max_ms,
        ];
        if all.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ExportError::validation(
                "seek timeout parameters must be finite and >= 0",
            ));
        }
        if self.min_ms > self.max_ms || self.min_ms <= 0.0 {
            return Err(ExportError::validation(
                "seek timeout bounds must satisfy 0 < min_ms <= max_ms",
            ));
        }
        Ok(())
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}

/// Fractions of device memory at which the estimator escalates.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MemoryThresholds {
    pub warning: f64,
    pub critical: f64,
    pub maximum: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning: 0.50,
            critical: 0.70,
            maximum: 0.90,
        }
    }
}

impl MemoryThresholds {
    fn validate(&self) -> ExportResult<()> {
        let ordered = 0.0 < self.warning && self.warning <= self.critical && self.critical <= self.maximum;
        if !ordered {
            return Err(ExportError::validation(
                "memory thresholds must satisfy 0 < warning <= critical <= maximum",
            ));
        }
        Ok(())
    }
}
