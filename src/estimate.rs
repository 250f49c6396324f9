//! Pre-flight peak memory projection and the gate built on it.

use crate::config::{ExportConfig, MemoryThresholds};
use crate::encode::backend::BackendKind;
use crate::foundation::core::Canvas;
use crate::foundation::error::{ExportError, ExportResult};
use crate::model::settings::{ExportSettings, QualityTier};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    None,
    Warning,
    Critical,
    Maximum,
}

/// Non-blocking suggestion attached to warning and critical estimates.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct MemoryAdvisory {
    /// Next lower tier, or `None` when already at the lowest.
    pub suggested_quality: Option<QualityTier>,
    pub estimated_savings_bytes: u64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct MemoryEstimate {
    pub bytes: u64,
    pub level: WarningLevel,
    pub device_memory_bytes: u64,
    /// `bytes / device_memory_bytes`.
    pub fraction: f64,
    pub advisory: Option<MemoryAdvisory>,
}

impl MemoryEstimate {
    pub fn blocks(&self) -> bool {
        self.level == WarningLevel::Maximum
    }
}

/// Frame buffers kept in flight per quality tier.
fn buffer_depth(quality: QualityTier) -> u64 {
    match quality {
        QualityTier::Low => 6,
        QualityTier::Medium => 12,
        QualityTier::High => 24,
    }
}

/// Relative working-set multiplier of each backend.
fn overhead(kind: BackendKind) -> f64 {
    match kind {
        BackendKind::Capture => 1.5,
        BackendKind::InProcess => 2.0,
        BackendKind::Native => 1.0,
        BackendKind::Hardware => 0.75,
    }
}

/// Frames each open media handle may hold decoded.
const FRAMES_PER_HANDLE: u64 = 8;

#[derive(Clone, Copy, Debug)]
pub struct MemoryEstimator {
    thresholds: MemoryThresholds,
    vfs_limit_bytes: u64,
    device_memory_bytes: u64,
}

impl MemoryEstimator {
    pub fn new(config: &ExportConfig, device_memory_bytes: u64) -> Self {
        Self {
            thresholds: config.memory_thresholds,
            vfs_limit_bytes: config.vfs_limit_bytes,
            device_memory_bytes: device_memory_bytes.max(1),
        }
    }

    pub fn device_memory_bytes(&self) -> u64 {
        self.device_memory_bytes
    }

    /// Projected peak bytes, before classification.
    pub fn projected_bytes(
        &self,
        quality: QualityTier,
        canvas: Canvas,
        total_frames: u64,
        kind: BackendKind,
        handle_count: usize,
    ) -> u64 {
        let frame = canvas.frame_bytes();
        let buffers = (frame * buffer_depth(quality)) as f64 * overhead(kind);
        let handles = handle_count as u64 * frame * FRAMES_PER_HANDLE;
        let staged = if kind == BackendKind::InProcess {
            (total_frames.saturating_mul(frame) / 4).min(self.vfs_limit_bytes)
        } else {
            0
        };
        buffers.round() as u64 + handles + staged
    }

    pub fn classify(&self, bytes: u64) -> WarningLevel {
        let fraction = bytes as f64 / self.device_memory_bytes as f64;
        if fraction >= self.thresholds.maximum {
            WarningLevel::Maximum
        } else if fraction >= self.thresholds.critical {
            WarningLevel::Critical
        } else if fraction >= self.thresholds.warning {
            WarningLevel::Warning
        } else {
            WarningLevel::None
        }
    }

    /// Estimate a run of `duration_secs` rendered at `canvas` through `kind`.
    pub fn estimate(
        &self,
        settings: &ExportSettings,
        canvas: Canvas,
        duration_secs: f64,
        kind: BackendKind,
        handle_count: usize,
    ) -> MemoryEstimate {
        let total_frames = settings.fps.total_frames(duration_secs);
        let bytes = self.projected_bytes(settings.quality, canvas, total_frames, kind, handle_count);
        let level = self.classify(bytes);
        let advisory = matches!(level, WarningLevel::Warning | WarningLevel::Critical).then(|| {
            match settings.quality.lower() {
                Some(lower) => {
                    let lower_bytes =
                        self.projected_bytes(lower, canvas, total_frames, kind, handle_count);
                    let savings = bytes.saturating_sub(lower_bytes);
                    MemoryAdvisory {
                        suggested_quality: Some(lower),
                        estimated_savings_bytes: savings,
                        message: format!(
                            "export may use {} of memory; '{}' quality would save about {}",
                            human_bytes(bytes),
                            lower.as_str(),
                            human_bytes(savings)
                        ),
                    }
                }
                None => MemoryAdvisory {
                    suggested_quality: None,
                    estimated_savings_bytes: 0,
                    message: format!(
                        "export may use {} of memory; consider a lower output resolution",
                        human_bytes(bytes)
                    ),
                },
            }
        });
        MemoryEstimate {
            bytes,
            level,
            device_memory_bytes: self.device_memory_bytes,
            fraction: bytes as f64 / self.device_memory_bytes as f64,
            advisory,
        }
    }

    /// Refuse `Maximum` estimates unless overridden; log advisories.
    pub fn check(&self, estimate: &MemoryEstimate, override_gate: bool) -> ExportResult<()> {
        if estimate.blocks() {
            if override_gate {
                tracing::warn!(
                    bytes = estimate.bytes,
                    device = estimate.device_memory_bytes,
                    "memory estimate exceeds maximum; continuing on explicit override"
                );
                return Ok(());
            }
            return Err(ExportError::resource(format!(
                "estimated memory {} exceeds {:.0}% of device memory ({})",
                human_bytes(estimate.bytes),
                self.thresholds.maximum * 100.0,
                human_bytes(estimate.device_memory_bytes)
            )));
        }
        if let Some(advisory) = &estimate.advisory {
            tracing::warn!(level = ?estimate.level, "{}", advisory.message);
        }
        Ok(())
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= 1024.0 * MIB {
        format!("{:.1} GiB", b / (1024.0 * MIB))
    } else {
        format!("{:.1} MiB", b / MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::core::Fps;
    use crate::model::settings::ExportFormat;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn settings(q: QualityTier) -> ExportSettings {
        ExportSettings::new("out", ExportFormat::Mp4, Fps::integer(30).unwrap()).with_quality(q)
    }

    #[test]
    fn small_export_has_no_warning() {
        let est = MemoryEstimator::new(&ExportConfig::default(), 8 * GIB);
        let e = est.estimate(&settings(QualityTier::Medium), Canvas::new(1280, 720), 10.0, BackendKind::Native, 2);
        assert_eq!(e.level, WarningLevel::None);
        assert!(e.advisory.is_none());
        est.check(&e, false).unwrap();
    }

    #[test]
    fn higher_tier_and_heavier_backend_cost_more() {
        let est = MemoryEstimator::new(&ExportConfig::default(), 8 * GIB);
        let c = Canvas::new(1920, 1080);
        let low = est.projected_bytes(QualityTier::Low, c, 300, BackendKind::Native, 0);
        let high = est.projected_bytes(QualityTier::High, c, 300, BackendKind::Native, 0);
        assert_eq!(high, low * 4);
        let staged = est.projected_bytes(QualityTier::Low, c, 300, BackendKind::InProcess, 0);
        assert!(staged > low * 2);
    }

    #[test]
    fn maximum_blocks_unless_overridden() {
        let est = MemoryEstimator::new(&ExportConfig::default(), 64 * 1024 * 1024);
        let e = est.estimate(&settings(QualityTier::High), Canvas::new(3840, 2160), 60.0, BackendKind::InProcess, 4);
        assert_eq!(e.level, WarningLevel::Maximum);
        let err = est.check(&e, false).unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Resource);
        est.check(&e, true).unwrap();
    }

    #[test]
    fn warning_suggests_next_lower_tier() {
        let c = Canvas::new(1920, 1080);
        let probe = MemoryEstimator::new(&ExportConfig::default(), GIB);
        let bytes = probe.projected_bytes(QualityTier::High, c, 30, BackendKind::Native, 0);
        // Device sized so the estimate lands at 60%: warning band.
        let est = MemoryEstimator::new(&ExportConfig::default(), (bytes as f64 / 0.6) as u64);
        let e = est.estimate(&settings(QualityTier::High), c, 1.0, BackendKind::Native, 0);
        assert_eq!(e.level, WarningLevel::Warning);
        let adv = e.advisory.unwrap();
        assert_eq!(adv.suggested_quality, Some(QualityTier::Medium));
        assert_eq!(adv.estimated_savings_bytes, bytes / 2);
    }
}
