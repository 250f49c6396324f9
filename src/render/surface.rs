use crate::foundation::core::{Canvas, Rect};
use crate::foundation::error::{ExportError, ExportResult};
use crate::media::source::Picture;
use crate::render::composite::{self, PremulRgba8};

/// A rendered frame handed to encoder backends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameRGBA {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// RGBA8 bytes, tightly packed, row-major.
    pub data: Vec<u8>,
    /// Whether `data` is premultiplied alpha.
    pub premultiplied: bool,
}

impl FrameRGBA {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    pub fn validate(&self) -> ExportResult<()> {
        if self.data.len() != self.expected_len() {
            return Err(ExportError::validation(format!(
                "frame data has {} bytes, expected {} for {}x{}",
                self.data.len(),
                self.expected_len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }

    /// Opaque straight RGBA, alpha composited over `bg`.
    pub fn flattened(&self, bg: [u8; 3]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len());
        self.flatten_into(&mut out, bg);
        out
    }

    /// Like [`FrameRGBA::flattened`], reusing `out` as scratch.
    pub fn flatten_into(&self, out: &mut Vec<u8>, bg: [u8; 3]) {
        out.clear();
        out.reserve(self.data.len());
        for px in self.data.chunks_exact(4) {
            let rgb = if self.premultiplied {
                composite::flatten_over([px[0], px[1], px[2], px[3]], bg)
            } else {
                let a = px[3];
                let premul = crate::foundation::math::premul_rgba8(px[0], px[1], px[2], a);
                composite::flatten_over(premul, bg)
            };
            out.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
        }
    }
}

/// The renderer's compositing target: premultiplied RGBA8, reused across frames.
#[derive(Clone, Debug)]
pub struct Surface {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Surface {
    pub fn new(canvas: Canvas) -> Self {
        Self {
            width: canvas.width,
            height: canvas.height,
            data: vec![0u8; canvas.width as usize * canvas.height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn rect(&self) -> Rect {
        Rect::new(0.0, 0.0, f64::from(self.width), f64::from(self.height))
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<PremulRgba8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some([self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]])
    }

    pub fn clear(&mut self, premul: PremulRgba8) {
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&premul);
        }
    }

    pub fn to_frame(&self) -> FrameRGBA {
        FrameRGBA {
            width: self.width,
            height: self.height,
            data: self.data.clone(),
            premultiplied: true,
        }
    }

    /// Fill the pixel-aligned part of `rect` with a solid colour.
    pub fn fill_rect(&mut self, rect: Rect, premul: PremulRgba8, opacity: f32) {
        let Some((x0, y0, x1, y1)) = self.clip(rect) else {
            return;
        };
        let stride = self.width as usize * 4;
        for y in y0..y1 {
            let row = y as usize * stride;
            for x in x0..x1 {
                let i = row + x as usize * 4;
                let out = composite::over(
                    [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]],
                    premul,
                    opacity,
                );
                self.data[i..i + 4].copy_from_slice(&out);
            }
        }
    }

    /// Scale `picture` to `dst` and composite it source-over.
    ///
    /// A box larger than the picture that hangs off the surface is sampled only where it is
    /// visible; scratch memory stays bounded by the larger of the picture and the surface.
    pub fn draw_picture(&mut self, picture: &Picture, dst: Rect, opacity: f32) -> ExportResult<()> {
        let dw = dst.width().round();
        let dh = dst.height().round();
        if dw < 1.0 || dh < 1.0 || opacity <= 0.0 || picture.width == 0 || picture.height == 0 {
            return Ok(());
        }
        let dx = dst.x0.round();
        let dy = dst.y0.round();
        let snapped = Rect::new(dx, dy, dx + dw, dy + dh);
        let Some((x0, y0, x1, y1)) = self.clip(snapped) else {
            return Ok(());
        };

        let fully_visible = (f64::from(x0), f64::from(y0), f64::from(x1), f64::from(y1))
            == (snapped.x0, snapped.y0, snapped.x1, snapped.y1);
        let source_area = f64::from(picture.width) * f64::from(picture.height);
        if !fully_visible && dw * dh > source_area {
            let (w, h) = (x1 - x0, y1 - y0);
            let span = sample_bilinear(picture, snapped, x0, y0, w, h);
            return self.blit(&span, w, h, i64::from(x0), i64::from(y0), opacity);
        }

        let (dw, dh) = (dw as u32, dh as u32);
        let (dx, dy) = (dx as i64, dy as i64);
        if (picture.width, picture.height) == (dw, dh) {
            return self.blit(&picture.rgba8_premul, dw, dh, dx, dy, opacity);
        }
        let src = image::RgbaImage::from_raw(
            picture.width,
            picture.height,
            picture.rgba8_premul.as_ref().clone(),
        )
        .ok_or_else(|| ExportError::validation("picture buffer does not match its dimensions"))?;
        let scaled = image::imageops::resize(&src, dw, dh, image::imageops::FilterType::Triangle);
        self.blit(scaled.as_raw(), dw, dh, dx, dy, opacity)
    }

    /// Composite a `sw x sh` premultiplied buffer with its top-left at `(dx, dy)`, clipped to the
    /// surface.
    pub fn blit(
        &mut self,
        src: &[u8],
        sw: u32,
        sh: u32,
        dx: i64,
        dy: i64,
        opacity: f32,
    ) -> ExportResult<()> {
        if src.len() != sw as usize * sh as usize * 4 {
            return Err(ExportError::validation("blit source does not match its dimensions"));
        }
        let x0 = dx.max(0);
        let y0 = dy.max(0);
        let x1 = (dx + i64::from(sw)).min(i64::from(self.width));
        let y1 = (dy + i64::from(sh)).min(i64::from(self.height));
        if x0 >= x1 || y0 >= y1 {
            return Ok(());
        }
        let span = ((x1 - x0) as usize) * 4;
        let dst_stride = self.width as usize * 4;
        let src_stride = sw as usize * 4;
        for y in y0..y1 {
            let d = y as usize * dst_stride + x0 as usize * 4;
            let s = (y - dy) as usize * src_stride + (x0 - dx) as usize * 4;
            composite::over_in_place(&mut self.data[d..d + span], &src[s..s + span], opacity)?;
        }
        Ok(())
    }

    /// Draw a line with a 1px brush (Bresenham), clipped to the surface.
    pub fn draw_line(&mut self, from: (i64, i64), to: (i64, i64), premul: PremulRgba8, opacity: f32) {
        let (mut x, mut y) = from;
        let dx = (to.0 - x).abs();
        let dy = -(to.1 - y).abs();
        let sx = if x < to.0 { 1 } else { -1 };
        let sy = if y < to.1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            if x >= 0 && y >= 0 && x < i64::from(self.width) && y < i64::from(self.height) {
                let i = (y as usize * self.width as usize + x as usize) * 4;
                let out = composite::over(
                    [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]],
                    premul,
                    opacity,
                );
                self.data[i..i + 4].copy_from_slice(&out);
            }
            if (x, y) == to {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn clip(&self, rect: Rect) -> Option<(u32, u32, u32, u32)> {
        let x0 = rect.x0.round().clamp(0.0, f64::from(self.width)) as u32;
        let y0 = rect.y0.round().clamp(0.0, f64::from(self.height)) as u32;
        let x1 = rect.x1.round().clamp(0.0, f64::from(self.width)) as u32;
        let y1 = rect.y1.round().clamp(0.0, f64::from(self.height)) as u32;
        (x0 < x1 && y0 < y1).then_some((x0, y0, x1, y1))
    }
}

/// Bilinear samples of `picture` stretched over `dst`, for the `w x h` surface pixels at
/// `(x0, y0)`.
fn sample_bilinear(picture: &Picture, dst: Rect, x0: u32, y0: u32, w: u32, h: u32) -> Vec<u8> {
    let pw = picture.width as usize;
    let ph = picture.height as usize;
    let kx = f64::from(picture.width) / dst.width();
    let ky = f64::from(picture.height) / dst.height();
    let src = picture.rgba8_premul.as_slice();
    let texel = |row: usize, col: usize, c: usize| f64::from(src[(row * pw + col) * 4 + c]);

    let mut out = Vec::with_capacity(w as usize * h as usize * 4);
    for y in y0..y0 + h {
        let v = ((f64::from(y) + 0.5 - dst.y0) * ky - 0.5).clamp(0.0, (ph - 1) as f64);
        let r0 = v.floor() as usize;
        let r1 = (r0 + 1).min(ph - 1);
        let fy = v - v.floor();
        for x in x0..x0 + w {
            let u = ((f64::from(x) + 0.5 - dst.x0) * kx - 0.5).clamp(0.0, (pw - 1) as f64);
            let c0 = u.floor() as usize;
            let c1 = (c0 + 1).min(pw - 1);
            let fx = u - u.floor();
            for c in 0..4 {
                let top = texel(r0, c0, c) * (1.0 - fx) + texel(r0, c1, c) * fx;
                let bottom = texel(r1, c0, c) * (1.0 - fx) + texel(r1, c1, c) * fx;
                out.push((top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> Surface {
        Surface::new(Canvas::new(8, 4))
    }

    #[test]
    fn clear_and_fill() {
        let mut s = surface();
        s.clear([0, 0, 0, 255]);
        s.fill_rect(Rect::new(2.0, 1.0, 4.0, 3.0), [255, 0, 0, 255], 1.0);
        assert_eq!(s.pixel(2, 1), Some([255, 0, 0, 255]));
        assert_eq!(s.pixel(4, 1), Some([0, 0, 0, 255]));
        assert_eq!(s.pixel(9, 1), None);
    }

    #[test]
    fn draw_picture_scales_into_box() {
        let mut s = surface();
        s.clear([0, 0, 0, 255]);
        let pic = Picture::solid(2, 2, [0, 255, 0, 255]);
        s.draw_picture(&pic, Rect::new(0.0, 0.0, 4.0, 4.0), 1.0).unwrap();
        assert_eq!(s.pixel(3, 3), Some([0, 255, 0, 255]));
        assert_eq!(s.pixel(5, 0), Some([0, 0, 0, 255]));
    }

    #[test]
    fn oversized_box_is_sampled_only_where_visible() {
        let mut s = surface();
        s.clear([0, 0, 0, 255]);
        let pic = Picture::solid(4, 2, [0, 0, 255, 255]);
        // Roughly 400000 x 200000 pixels; resizing the whole box would not fit in memory.
        let huge = Rect::new(-200_000.0, -100_000.0, 200_000.0, 100_000.0);
        s.draw_picture(&pic, huge, 1.0).unwrap();
        assert_eq!(s.pixel(0, 0), Some([0, 0, 255, 255]));
        assert_eq!(s.pixel(7, 3), Some([0, 0, 255, 255]));
    }

    #[test]
    fn partially_offscreen_magnified_picture_keeps_its_halves() {
        let mut s = surface();
        s.clear([0, 0, 0, 255]);
        let pic = Picture::new(2, 1, vec![255, 0, 0, 255, 0, 255, 0, 255]).unwrap();
        // Left texel covers x in [-8, 0), right texel covers [0, 8) once magnified.
        s.draw_picture(&pic, Rect::new(-8.0, 0.0, 8.0, 4.0), 1.0).unwrap();
        assert_eq!(s.pixel(7, 2), Some([0, 255, 0, 255]));
        let edge = s.pixel(0, 2).unwrap();
        assert!(edge[1] > edge[0], "expected mostly green at the seam, got {edge:?}");
    }

    #[test]
    fn blit_clips_offscreen_parts() {
        let mut s = surface();
        let src = [9u8, 9, 9, 255].repeat(16);
        s.blit(&src, 4, 4, -2, -2, 1.0).unwrap();
        assert_eq!(s.pixel(1, 1), Some([9, 9, 9, 255]));
        assert_eq!(s.pixel(2, 2), Some([0, 0, 0, 0]));
        s.blit(&src, 4, 4, 100, 100, 1.0).unwrap();
    }

    #[test]
    fn frame_flattening_is_opaque() {
        let mut s = surface();
        s.clear([0, 0, 0, 0]);
        let frame = s.to_frame();
        frame.validate().unwrap();
        let flat = frame.flattened([10, 20, 30]);
        assert_eq!(&flat[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn diagonal_line_touches_both_ends() {
        let mut s = surface();
        s.draw_line((0, 0), (3, 3), [255, 255, 255, 255], 1.0);
        assert_eq!(s.pixel(0, 0), Some([255, 255, 255, 255]));
        assert_eq!(s.pixel(3, 3), Some([255, 255, 255, 255]));
    }
}
