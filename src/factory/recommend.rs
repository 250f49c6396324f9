use crate::encode::backend::BackendKind;
use crate::estimate::{MemoryEstimator, WarningLevel};
use crate::factory::probe::Availability;
use crate::foundation::core::Canvas;
use crate::model::settings::ExportSettings;

const W_MATCH: f64 = 0.5;
const W_SPEED: f64 = 0.3;
const W_MEMORY: f64 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedLabel {
    Fast,
    Balanced,
    Compatible,
}

impl SpeedLabel {
    pub fn of(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Hardware | BackendKind::Native => Self::Fast,
            BackendKind::InProcess => Self::Balanced,
            BackendKind::Capture => Self::Compatible,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Compatible => "compatible",
        }
    }
}

/// Relative encode throughput; only the ratios matter.
fn speed_factor(kind: BackendKind) -> f64 {
    match kind {
        BackendKind::Capture => 1.0,
        BackendKind::InProcess => 1.6,
        BackendKind::Native => 2.4,
        BackendKind::Hardware => 3.2,
    }
}

/// How well a variant's output matches a format-specific request: the tool variants mux the
/// requested container natively, capture emits a bare elementary stream.
fn capability_match(kind: BackendKind) -> f64 {
    match kind {
        BackendKind::Capture => 0.7,
        _ => 1.0,
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ScoredBackend {
    pub kind: BackendKind,
    pub score: f64,
    pub label: SpeedLabel,
    pub estimated_bytes: u64,
    pub memory_level: WarningLevel,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct Recommendation {
    /// Candidates, best first.
    pub ranked: Vec<ScoredBackend>,
    /// Variants left out, with the reason.
    pub excluded: Vec<(BackendKind, String)>,
}

impl Recommendation {
    pub fn best(&self) -> Option<&ScoredBackend> {
        self.ranked.first()
    }
}

/// Score every usable variant that supports the requested format.
///
/// `score = 0.5 × capability match + 0.3 × normalised speed + 0.2 × memory headroom`, where
/// speed is normalised against the fastest candidate and headroom is `1 - fraction` of device
/// memory. Ties keep [`BackendKind::ALL`] order reversed (hardware first).
pub fn recommend(
    availability: impl Fn(BackendKind) -> Availability,
    estimator: &MemoryEstimator,
    settings: &ExportSettings,
    canvas: Canvas,
    duration_secs: f64,
    handle_count: usize,
) -> Recommendation {
    let mut out = Recommendation::default();
    let mut candidates = Vec::new();
    for kind in BackendKind::ALL.into_iter().rev() {
        let availability = availability(kind);
        if !availability.usable {
            let reason = availability.reason.unwrap_or_else(|| "unavailable".to_string());
            out.excluded.push((kind, reason));
            continue;
        }
        if !kind.supports(settings.format) {
            out.excluded.push((
                kind,
                format!("cannot produce '{}' output", settings.format.extension()),
            ));
            continue;
        }
        candidates.push(kind);
    }

    let fastest = candidates
        .iter()
        .map(|k| speed_factor(*k))
        .fold(0.0f64, f64::max);
    for kind in candidates {
        let est = estimator.estimate(settings, canvas, duration_secs, kind, handle_count);
        let speed = if fastest > 0.0 { speed_factor(kind) / fastest } else { 0.0 };
        let headroom = (1.0 - est.fraction).clamp(0.0, 1.0);
        let score = W_MATCH * capability_match(kind) + W_SPEED * speed + W_MEMORY * headroom;
        out.ranked.push(ScoredBackend {
            kind,
            score,
            label: SpeedLabel::of(kind),
            estimated_bytes: est.bytes,
            memory_level: est.level,
        });
    }
    // Stable sort keeps the hardware-first order on ties.
    out.ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExportConfig;
    use crate::factory::probe::{HostCapabilities, test_capabilities};
    use crate::foundation::core::Fps;
    use crate::model::settings::ExportFormat;

    fn run(caps: &HostCapabilities, format: ExportFormat) -> Recommendation {
        let est = MemoryEstimator::new(&ExportConfig::default(), caps.device_memory_bytes);
        let settings = ExportSettings::new("out", format, Fps::integer(30).unwrap());
        recommend(|k| caps.availability(k), &est, &settings, Canvas::new(1280, 720), 10.0, 1)
    }

    #[test]
    fn hardware_wins_when_verified() {
        let r = run(&test_capabilities(true, true), ExportFormat::Mp4);
        let best = r.best().unwrap();
        assert_eq!(best.kind, BackendKind::Hardware);
        assert_eq!(best.label, SpeedLabel::Fast);
        assert!(r.excluded.iter().any(|(k, _)| *k == BackendKind::Capture));
    }

    #[test]
    fn webm_without_hardware_prefers_native() {
        let r = run(&test_capabilities(true, true), ExportFormat::Webm);
        assert_eq!(r.best().unwrap().kind, BackendKind::Native);
        assert!(r.ranked.iter().all(|s| s.kind != BackendKind::Hardware));
    }

    #[test]
    fn bare_host_only_offers_capture_for_h264() {
        let caps = test_capabilities(false, false);
        assert!(run(&caps, ExportFormat::Mp4).best().is_none());
        let r = run(&caps, ExportFormat::H264);
        assert_eq!(r.best().unwrap().kind, BackendKind::Capture);
        assert_eq!(r.best().unwrap().label, SpeedLabel::Compatible);
    }

    #[test]
    fn scores_are_ordered() {
        let r = run(&test_capabilities(true, true), ExportFormat::H264);
        assert!(r.ranked.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(r.ranked.len(), 4);
    }
}
