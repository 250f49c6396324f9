use crate::foundation::core::{Canvas, Rect, Rgba8};
use crate::foundation::error::{ExportError, ExportResult};
use crate::model::media::MediaId;

/// Aggregate root of an export: ordered tracks on a canvas.
///
/// The orchestrator holds the project behind an `Arc` and never mutates it during a run.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Project {
    pub id: String,
    pub canvas: Canvas,
    #[serde(default)]
    pub background: Background,
    pub tracks: Vec<Track>,
}

/// How the surface is filled before elements are drawn.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Background {
    Solid {
        color: Rgba8,
    },
    /// Blurred, cover-fitted copy of the bottom-most active visual media.
    BlurredMedia {
        fallback: Rgba8,
        radius: u32,
    },
}

impl Default for Background {
    fn default() -> Self {
        Self::Solid {
            color: Rgba8::BLACK,
        }
    }
}

impl Background {
    /// Colour used when nothing else fills the canvas.
    pub fn base_color(&self) -> Rgba8 {
        match self {
            Self::Solid { color } => *color,
            Self::BlurredMedia { fallback, .. } => *fallback,
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Track {
    pub id: String,
    /// Draw order; higher values are composited on top.
    pub z_index: i32,
    #[serde(default)]
    pub hidden: bool,
    pub elements: Vec<TimelineElement>,
}

/// A placed clip on a track.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TimelineElement {
    pub id: String,
    pub start_secs: f64,
    pub duration_secs: f64,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub transform: Transform,
    pub kind: ElementKind,
}

impl TimelineElement {
    pub fn end_secs(&self) -> f64 {
        self.start_secs + self.duration_secs
    }

    /// Half-open `[start, end)` containment.
    pub fn contains(&self, t: f64) -> bool {
        self.start_secs <= t && t < self.end_secs()
    }

    pub fn media_id(&self) -> Option<&MediaId> {
        match &self.kind {
            ElementKind::Media(m) => Some(&m.media_id),
            ElementKind::Text(_) => None,
        }
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    Media(MediaElement),
    Text(TextElement),
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct MediaElement {
    pub media_id: MediaId,
    /// Offset into the source where playback starts.
    #[serde(default)]
    pub trim_in_secs: f64,
    /// Source time at which playback stops, if trimmed.
    #[serde(default)]
    pub trim_out_secs: Option<f64>,
}

impl MediaElement {
    /// Map a timeline timestamp to source time.
    pub fn source_time(&self, element_start: f64, t: f64, natural_duration: Option<f64>) -> f64 {
        let mut src = self.trim_in_secs + (t - element_start);
        if let Some(out) = self.trim_out_secs {
            src = src.min(out.max(self.trim_in_secs));
        }
        if let Some(d) = natural_duration
            && d.is_finite()
            && d > 0.0
        {
            src = src.min(d);
        }
        src.max(0.0)
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TextElement {
    pub content: String,
    #[serde(default)]
    pub style: TextStyle,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TextStyle {
    pub font_family: String,
    pub font_size: f32,
    pub color: Rgba8,
    pub align: TextAlign,
    pub bold: bool,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_family: "sans-serif".to_string(),
            font_size: 48.0,
            color: Rgba8::WHITE,
            align: TextAlign::Center,
            bold: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

/// Placement of an element: a box at `(x, y)` in canvas pixels, scaled about its centre.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Transform {
    pub x: f64,
    pub y: f64,
    /// Box width; defaults to the canvas width.
    pub width: Option<f64>,
    /// Box height; defaults to the canvas height.
    pub height: Option<f64>,
    pub scale: f64,
    pub opacity: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: None,
            height: None,
            scale: 1.0,
            opacity: 1.0,
        }
    }
}

impl Transform {
    /// Target box in canvas pixel space.
    pub fn target_box(&self, canvas: Canvas) -> Rect {
        let w = self.width.unwrap_or(f64::from(canvas.width));
        let h = self.height.unwrap_or(f64::from(canvas.height));
        let cx = self.x + w / 2.0;
        let cy = self.y + h / 2.0;
        let sw = w * self.scale;
        let sh = h * self.scale;
        Rect::new(cx - sw / 2.0, cy - sh / 2.0, cx + sw / 2.0, cy + sh / 2.0)
    }
}

impl Project {
    /// End of the last element in seconds, 0 when the project has no elements.
    pub fn total_duration_secs(&self) -> f64 {
        self.tracks
            .iter()
            .flat_map(|t| t.elements.iter())
            .map(TimelineElement::end_secs)
            .filter(|v| v.is_finite())
            .fold(0.0, f64::max)
    }

    /// Every media id referenced by a visible element, in first-seen order, without duplicates.
    pub fn referenced_media(&self) -> Vec<MediaId> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for track in self.tracks.iter().filter(|t| !t.hidden) {
            for el in track.elements.iter().filter(|e| !e.hidden) {
                if let Some(id) = el.media_id()
                    && seen.insert(id.clone())
                {
                    out.push(id.clone());
                }
            }
        }
        out
    }

    pub fn validate(&self) -> ExportResult<()> {
        if self.canvas.width == 0 || self.canvas.height == 0 {
            return Err(ExportError::validation("canvas width/height must be > 0"));
        }

        for track in &self.tracks {
            for el in &track.elements {
                if !el.start_secs.is_finite() || el.start_secs < 0.0 {
                    return Err(ExportError::validation(format!(
                        "element '{}' has invalid start time",
                        el.id
                    )));
                }
                if !el.duration_secs.is_finite() || el.duration_secs < 0.0 {
                    return Err(ExportError::validation(format!(
                        "element '{}' has invalid duration",
                        el.id
                    )));
                }
                let t = &el.transform;
                let bad_extent = |v: Option<f64>| v.is_some_and(|v| !v.is_finite() || v < 0.0);
                if !t.scale.is_finite()
                    || t.scale < 0.0
                    || !t.opacity.is_finite()
                    || !t.x.is_finite()
                    || !t.y.is_finite()
                    || bad_extent(t.width)
                    || bad_extent(t.height)
                {
                    return Err(ExportError::validation(format!(
                        "element '{}' has invalid transform",
                        el.id
                    )));
                }
                if let ElementKind::Media(m) = &el.kind {
                    if !m.trim_in_secs.is_finite() || m.trim_in_secs < 0.0 {
                        return Err(ExportError::validation(format!(
                            "element '{}' has invalid trim-in",
                            el.id
                        )));
                    }
                    if let Some(out) = m.trim_out_secs
                        && (!out.is_finite() || out < m.trim_in_secs)
                    {
                        return Err(ExportError::validation(format!(
                            "element '{}' has trim-out before trim-in",
                            el.id
                        )));
                    }
                }
                if let ElementKind::Text(text) = &el.kind
                    && (!text.style.font_size.is_finite() || text.style.font_size <= 0.0)
                {
                    return Err(ExportError::validation(format!(
                        "text element '{}' must have a positive font size",
                        el.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_el(id: &str, start: f64, dur: f64) -> TimelineElement {
        TimelineElement {
            id: id.to_string(),
            start_secs: start,
            duration_secs: dur,
            hidden: false,
            transform: Transform::default(),
            kind: ElementKind::Media(MediaElement {
                media_id: MediaId::new(id),
                trim_in_secs: 0.0,
                trim_out_secs: None,
            }),
        }
    }

    fn project(elements: Vec<TimelineElement>) -> Project {
        Project {
            id: "p".to_string(),
            canvas: Canvas::new(64, 36),
            background: Background::default(),
            tracks: vec![Track {
                id: "t0".to_string(),
                z_index: 0,
                hidden: false,
                elements,
            }],
        }
    }

    #[test]
    fn total_duration_is_last_element_end() {
        let p = project(vec![media_el("a", 0.0, 2.0), media_el("b", 1.5, 3.0)]);
        assert!((p.total_duration_secs() - 4.5).abs() < 1e-12);
        assert_eq!(project(vec![]).total_duration_secs(), 0.0);
    }

    #[test]
    fn containment_is_half_open() {
        let el = media_el("a", 1.0, 2.0);
        assert!(el.contains(1.0));
        assert!(el.contains(2.999));
        assert!(!el.contains(3.0));
        assert!(!el.contains(0.999));
    }

    #[test]
    fn source_time_applies_trim_and_clamps() {
        let m = MediaElement {
            media_id: MediaId::new("v"),
            trim_in_secs: 2.0,
            trim_out_secs: Some(4.0),
        };
        assert!((m.source_time(1.0, 1.5, None) - 2.5).abs() < 1e-12);
        assert!((m.source_time(1.0, 10.0, None) - 4.0).abs() < 1e-12);
        assert!((m.source_time(1.0, 10.0, Some(3.0)) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn target_box_scales_about_center() {
        let t = Transform {
            x: 10.0,
            y: 10.0,
            width: Some(20.0),
            height: Some(10.0),
            scale: 0.5,
            opacity: 1.0,
        };
        let r = t.target_box(Canvas::new(64, 36));
        assert_eq!(r, Rect::new(15.0, 12.5, 25.0, 17.5));
    }

    #[test]
    fn validate_rejects_non_finite_box() {
        let mut el = media_el("a", 0.0, 1.0);
        el.transform.width = Some(f64::INFINITY);
        assert!(project(vec![el]).validate().is_err());

        let mut el = media_el("a", 0.0, 1.0);
        el.transform.scale = 50.0;
        assert!(project(vec![el]).validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_trim() {
        let mut el = media_el("a", 0.0, 1.0);
        if let ElementKind::Media(m) = &mut el.kind {
            m.trim_in_secs = 3.0;
            m.trim_out_secs = Some(1.0);
        }
        assert!(project(vec![el]).validate().is_err());
    }

    #[test]
    fn referenced_media_skips_hidden_and_dedups() {
        let mut hidden = media_el("h", 0.0, 1.0);
        hidden.hidden = true;
        let p = project(vec![media_el("a", 0.0, 1.0), media_el("a", 1.0, 1.0), hidden]);
        assert_eq!(p.referenced_media(), vec![MediaId::new("a")]);
    }

    #[test]
    fn project_json_round_trips_tagged_kinds() {
        let p = project(vec![media_el("a", 0.0, 1.0)]);
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"type\":\"media\""));
        let back: Project = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tracks[0].elements.len(), 1);
    }
}
