use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::foundation::error::{ExportError, ExportResult};
use crate::media::source::Picture;
use crate::model::project::{TextAlign, TextStyle};

const LINE_HEIGHT: f32 = 1.2;
const MAX_CACHED: usize = 64;

/// Rasterizes text elements through an SVG `<text>` document.
///
/// Text content rarely changes between frames, so results are memoized per
/// content/style/box combination.
pub struct TextRasterizer {
    fontdb: Arc<usvg::fontdb::Database>,
    cache: HashMap<String, Picture>,
}

impl std::fmt::Debug for TextRasterizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextRasterizer")
            .field("faces", &self.fontdb.faces().count())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl TextRasterizer {
    /// Build a rasterizer over the system fonts.
    pub fn with_system_fonts() -> Self {
        let mut db = usvg::fontdb::Database::new();
        db.load_system_fonts();
        tracing::debug!(faces = db.faces().count(), "loaded system fonts for text rendering");
        Self::with_fontdb(Arc::new(db))
    }

    pub fn with_fontdb(fontdb: Arc<usvg::fontdb::Database>) -> Self {
        Self {
            fontdb,
            cache: HashMap::new(),
        }
    }

    pub fn face_count(&self) -> usize {
        self.fontdb.faces().count()
    }

    /// Render `content` into a transparent `width x height` picture.
    pub fn rasterize(
        &mut self,
        content: &str,
        style: &TextStyle,
        width: u32,
        height: u32,
    ) -> ExportResult<Picture> {
        let full = TextRegion {
            x: 0,
            y: 0,
            width,
            height,
        };
        self.rasterize_region(content, style, width, height, full)
    }

    /// Lay `content` out in a `width x height` box and render only `region` of it.
    pub fn rasterize_region(
        &mut self,
        content: &str,
        style: &TextStyle,
        width: u32,
        height: u32,
        region: TextRegion,
    ) -> ExportResult<Picture> {
        if width == 0 || height == 0 || region.width == 0 || region.height == 0 {
            return Err(ExportError::validation("text box must be at least 1x1"));
        }
        let key = cache_key(content, style, width, height, region);
        if let Some(p) = self.cache.get(&key) {
            return Ok(p.clone());
        }

        let svg = build_svg(content, style, width, height);
        let mut opts = usvg::Options::default();
        opts.fontdb = self.fontdb.clone();
        let tree = usvg::Tree::from_str(&svg, &opts)
            .map_err(|e| ExportError::transient(format!("text layout failed: {e}")))?;

        let mut pixmap = resvg::tiny_skia::Pixmap::new(region.width, region.height)
            .ok_or_else(|| ExportError::resource("failed to allocate text pixmap"))?;
        let offset = resvg::tiny_skia::Transform::from_translate(-(region.x as f32), -(region.y as f32));
        resvg::render(&tree, offset, &mut pixmap.as_mut());
        let picture = Picture::new(region.width, region.height, pixmap.data().to_vec())?;

        if self.cache.len() >= MAX_CACHED {
            self.cache.clear();
        }
        self.cache.insert(key, picture.clone());
        Ok(picture)
    }
}

/// Pixel window of a text box, relative to the box's top-left corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

fn cache_key(content: &str, style: &TextStyle, width: u32, height: u32, region: TextRegion) -> String {
    format!(
        "{width}x{height}@{},{},{}x{}|{}|{}|{}|{:?}|{}|{}|{content}",
        region.x,
        region.y,
        region.width,
        region.height,
        style.font_family,
        style.font_size,
        style.color.to_hex(),
        style.align,
        style.color.a,
        style.bold
    )
}

/// Lines are stacked around the vertical centre of the box and anchored per alignment.
fn build_svg(content: &str, style: &TextStyle, width: u32, height: u32) -> String {
    let (x, anchor) = match style.align {
        TextAlign::Left => (0.0, "start"),
        TextAlign::Center => (width as f32 / 2.0, "middle"),
        TextAlign::Right => (width as f32, "end"),
    };
    let lines: Vec<&str> = content.lines().collect();
    let line_height = style.font_size * LINE_HEIGHT;
    let block = line_height * lines.len().max(1) as f32;
    // Baseline of the first line, approximating ascent as 0.8em.
    let first_baseline = (height as f32 - block) / 2.0 + style.font_size * 0.8 + (line_height - style.font_size) / 2.0;

    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
    );
    let _ = write!(
        svg,
        r#"<text font-family="{}" font-size="{}" font-weight="{}" fill="{}" fill-opacity="{:.4}" text-anchor="{anchor}" xml:space="preserve">"#,
        escape_xml(&style.font_family),
        style.font_size,
        if style.bold { "bold" } else { "normal" },
        style.color.to_hex(),
        style.color.opacity(),
    );
    for (i, line) in lines.iter().enumerate() {
        let y = first_baseline + line_height * i as f32;
        let _ = write!(svg, r#"<tspan x="{x}" y="{y:.2}">{}</tspan>"#, escape_xml(line));
    }
    svg.push_str("</text></svg>");
    svg
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svg_escapes_markup() {
        let svg = build_svg("a < b & \"c\"", &TextStyle::default(), 100, 40);
        assert!(svg.contains("a &lt; b &amp; &quot;c&quot;"));
        assert!(svg.contains(r#"text-anchor="middle""#));
    }

    #[test]
    fn multiline_text_gets_one_tspan_per_line() {
        let svg = build_svg("one\ntwo\nthree", &TextStyle::default(), 200, 200);
        assert_eq!(svg.matches("<tspan").count(), 3);
    }

    #[test]
    fn svg_document_parses() {
        let svg = build_svg("hello", &TextStyle::default(), 120, 60);
        usvg::Tree::from_str(&svg, &usvg::Options::default()).unwrap();
    }

    #[test]
    fn rasterize_without_fonts_is_transparent_and_sized() {
        let mut r = TextRasterizer::with_fontdb(Arc::new(usvg::fontdb::Database::new()));
        let p = r.rasterize("hi", &TextStyle::default(), 32, 16).unwrap();
        assert_eq!((p.width, p.height), (32, 16));
        assert!(p.rgba8_premul.chunks_exact(4).all(|px| px[3] == 0));
    }

    #[test]
    fn region_of_a_huge_box_allocates_only_the_region() {
        let mut r = TextRasterizer::with_fontdb(Arc::new(usvg::fontdb::Database::new()));
        let region = TextRegion {
            x: 40_000,
            y: 20_000,
            width: 64,
            height: 36,
        };
        let p = r
            .rasterize_region("hi", &TextStyle::default(), 96_000, 54_000, region)
            .unwrap();
        assert_eq!((p.width, p.height), (64, 36));
    }
}
