use crate::foundation::core::Rect;
use crate::foundation::error::{ExportError, ExportResult};
use crate::media::source::Picture;
use crate::render::letterbox::fit_cover;

/// Separable Gaussian blur over premultiplied RGBA8, fixed-point Q16 weights.
pub fn blur_rgba8_premul(
    src: &[u8],
    width: u32,
    height: u32,
    radius: u32,
    sigma: f32,
) -> ExportResult<Vec<u8>> {
    let expected_len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(4))
        .ok_or_else(|| ExportError::validation("blur buffer size overflow"))?;
    if src.len() != expected_len {
        return Err(ExportError::validation(
            "blur_rgba8_premul expects src matching width*height*4",
        ));
    }
    if radius == 0 || width == 0 || height == 0 {
        return Ok(src.to_vec());
    }

    let kernel = gaussian_kernel_q16(radius, sigma)?;
    let mut tmp = vec![0u8; expected_len];
    let mut out = vec![0u8; expected_len];

    horizontal_pass(src, &mut tmp, width, height, &kernel);
    vertical_pass(&tmp, &mut out, width, height, &kernel);
    Ok(out)
}

/// Blurred copy of `picture` cover-fitted to `width x height`.
///
/// The blur runs at `1/downscale` resolution and is scaled back up, which is visually
/// indistinguishable for large radii and much cheaper.
pub fn blurred_cover(
    picture: &Picture,
    width: u32,
    height: u32,
    radius: u32,
    downscale: u32,
) -> ExportResult<Picture> {
    let downscale = downscale.max(1);
    let small_w = (width / downscale).max(1);
    let small_h = (height / downscale).max(1);

    let target = Rect::new(0.0, 0.0, f64::from(small_w), f64::from(small_h));
    let cover = fit_cover(picture.width, picture.height, target);
    let scaled_w = cover.width().round().max(1.0) as u32;
    let scaled_h = cover.height().round().max(1.0) as u32;

    let src = image::RgbaImage::from_raw(
        picture.width,
        picture.height,
        picture.rgba8_premul.as_ref().clone(),
    )
    .ok_or_else(|| ExportError::validation("picture buffer does not match its dimensions"))?;
    let scaled = image::imageops::resize(&src, scaled_w, scaled_h, image::imageops::FilterType::Triangle);
    let off_x = scaled_w.saturating_sub(small_w) / 2;
    let off_y = scaled_h.saturating_sub(small_h) / 2;
    let cropped =
        image::imageops::crop_imm(&scaled, off_x, off_y, small_w.min(scaled_w), small_h.min(scaled_h))
            .to_image();
    let (cw, ch) = cropped.dimensions();

    let small_radius = (radius / downscale).max(1);
    let sigma = (small_radius as f32 / 2.0).max(0.5);
    let blurred = blur_rgba8_premul(cropped.as_raw(), cw, ch, small_radius, sigma)?;
    let blurred = image::RgbaImage::from_raw(cw, ch, blurred)
        .ok_or_else(|| ExportError::validation("blur output does not match its dimensions"))?;
    let full = image::imageops::resize(&blurred, width, height, image::imageops::FilterType::Triangle);
    Picture::new(width, height, full.into_raw())
}

fn gaussian_kernel_q16(radius: u32, sigma: f32) -> ExportResult<Vec<u32>> {
    if radius == 0 {
        return Ok(vec![1 << 16]);
    }
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(ExportError::validation("blur sigma must be > 0"));
    }

    let r = radius as i32;
    let mut weights_f = Vec::<f64>::with_capacity((2 * r + 1) as usize);
    let mut sum = 0.0f64;
    let sigma = f64::from(sigma);
    let denom = 2.0 * sigma * sigma;
    for i in -r..=r {
        let x = f64::from(i);
        let w = (-x * x / denom).exp();
        weights_f.push(w);
        sum += w;
    }

    let mut weights = Vec::<u32>::with_capacity(weights_f.len());
    let mut acc: i64 = 0;
    for &wf in &weights_f {
        let q = ((wf / sum) * 65536.0).round() as i64;
        let q = q.clamp(0, 65536);
        weights.push(q as u32);
        acc += q;
    }
    // Push the rounding remainder into the centre tap so the kernel sums to exactly 1.0.
    let delta = 65536 - acc;
    if delta != 0 {
        let mid = weights.len() / 2;
        weights[mid] = (i64::from(weights[mid]) + delta).clamp(0, 65536) as u32;
    }

    Ok(weights)
}

fn horizontal_pass(src: &[u8], dst: &mut [u8], width: u32, height: u32, k: &[u32]) {
    let radius = (k.len() / 2) as i32;
    let w = width as i32;
    for y in 0..height as i32 {
        for x in 0..w {
            let mut acc = [0u64; 4];
            for (ki, &kw) in k.iter().enumerate() {
                let sx = (x + ki as i32 - radius).clamp(0, w - 1);
                let idx = ((y * w + sx) as usize) * 4;
                for c in 0..4 {
                    acc[c] += u64::from(kw) * u64::from(src[idx + c]);
                }
            }
            let out_idx = ((y * w + x) as usize) * 4;
            for c in 0..4 {
                dst[out_idx + c] = q16_to_u8(acc[c]);
            }
        }
    }
}

fn vertical_pass(src: &[u8], dst: &mut [u8], width: u32, height: u32, k: &[u32]) {
    let radius = (k.len() / 2) as i32;
    let w = width as i32;
    let h = height as i32;
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0u64; 4];
            for (ki, &kw) in k.iter().enumerate() {
                let sy = (y + ki as i32 - radius).clamp(0, h - 1);
                let idx = ((sy * w + x) as usize) * 4;
                for c in 0..4 {
                    acc[c] += u64::from(kw) * u64::from(src[idx + c]);
                }
            }
            let out_idx = ((y * w + x) as usize) * 4;
            for c in 0..4 {
                dst[out_idx + c] = q16_to_u8(acc[c]);
            }
        }
    }
}

fn q16_to_u8(acc: u64) -> u8 {
    let v = (acc + 32768) >> 16;
    v.min(255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blur_constant_image_is_identity() {
        let (w, h) = (4u32, 3u32);
        let px = [10u8, 20u8, 30u8, 40u8];
        let src = px.repeat((w * h) as usize);
        let out = blur_rgba8_premul(&src, w, h, 3, 2.0).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn blur_spreads_energy_from_single_pixel() {
        let (w, h) = (5u32, 5u32);
        let mut src = vec![0u8; (w * h * 4) as usize];
        let center = ((2 * w + 2) * 4) as usize;
        src[center..center + 4].copy_from_slice(&[255, 255, 255, 255]);

        let out = blur_rgba8_premul(&src, w, h, 2, 1.2).unwrap();
        let nonzero = out.chunks_exact(4).filter(|px| px[3] != 0).count();
        assert!(nonzero > 1);
    }

    #[test]
    fn blurred_cover_has_requested_size() {
        let pic = Picture::solid(30, 10, [40, 80, 120, 255]);
        let out = blurred_cover(&pic, 64, 36, 20, 4).unwrap();
        assert_eq!((out.width, out.height), (64, 36));
        let px = &out.rgba8_premul[(18 * 64 + 32) * 4..(18 * 64 + 32) * 4 + 4];
        assert!((i32::from(px[1]) - 80).abs() <= 2);
        assert_eq!(px[3], 255);
    }
}
