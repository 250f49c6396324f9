use crate::foundation::error::{ExportError, ExportResult};
use crate::foundation::math::mul_div255_u16;

pub type PremulRgba8 = [u8; 4];

/// Source-over for one premultiplied pixel, with `opacity` scaling the source.
pub fn over(dst: PremulRgba8, src: PremulRgba8, opacity: f32) -> PremulRgba8 {
    let opacity = opacity.clamp(0.0, 1.0);
    if opacity <= 0.0 || src[3] == 0 {
        return dst;
    }

    let op = ((opacity * 255.0).round() as i32).clamp(0, 255) as u16;
    let sa = mul_div255_u16(u16::from(src[3]), op);
    if sa == 0 {
        return dst;
    }

    let inv = 255u16 - sa;

    let mut out = [0u8; 4];
    out[3] = add_sat_u8(sa, mul_div255_u16(u16::from(dst[3]), inv));

    for i in 0..3 {
        let sc = mul_div255_u16(u16::from(src[i]), op);
        let dc = mul_div255_u16(u16::from(dst[i]), inv);
        out[i] = add_sat_u8(sc, dc);
    }
    out
}

/// Composite one row span of premultiplied pixels onto another.
pub fn over_in_place(dst: &mut [u8], src: &[u8], opacity: f32) -> ExportResult<()> {
    if dst.len() != src.len() || !dst.len().is_multiple_of(4) {
        return Err(ExportError::validation(
            "over_in_place expects equal-length rgba8 buffers",
        ));
    }
    if opacity >= 1.0 {
        for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
            match s[3] {
                255 => d.copy_from_slice(s),
                0 => {}
                _ => {
                    let out = over([d[0], d[1], d[2], d[3]], [s[0], s[1], s[2], s[3]], 1.0);
                    d.copy_from_slice(&out);
                }
            }
        }
        return Ok(());
    }
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let out = over([d[0], d[1], d[2], d[3]], [s[0], s[1], s[2], s[3]], opacity);
        d.copy_from_slice(&out);
    }
    Ok(())
}

/// Flatten a premultiplied pixel onto an opaque background, yielding straight RGB.
pub fn flatten_over(src: PremulRgba8, bg: [u8; 3]) -> [u8; 3] {
    let inv = 255u16 - u16::from(src[3]);
    [
        add_sat_u8(u16::from(src[0]), mul_div255_u16(u16::from(bg[0]), inv)),
        add_sat_u8(u16::from(src[1]), mul_div255_u16(u16::from(bg[1]), inv)),
        add_sat_u8(u16::from(src[2]), mul_div255_u16(u16::from(bg[2]), inv)),
    ]
}

fn add_sat_u8(a: u16, b: u16) -> u8 {
    (a + b).min(255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn over_opaque_src_replaces_dst() {
        assert_eq!(over([10, 20, 30, 255], [200, 100, 50, 255], 1.0), [200, 100, 50, 255]);
    }

    #[test]
    fn over_zero_opacity_keeps_dst() {
        assert_eq!(over([10, 20, 30, 255], [200, 100, 50, 255], 0.0), [10, 20, 30, 255]);
    }

    #[test]
    fn over_half_opacity_blends() {
        let out = over([0, 0, 0, 255], [255, 255, 255, 255], 0.5);
        assert!((i32::from(out[0]) - 128).abs() <= 1);
        assert_eq!(out[3], 255);
    }

    #[test]
    fn over_in_place_rejects_mismatch() {
        let mut dst = vec![0u8; 8];
        assert!(over_in_place(&mut dst, &[0u8; 4], 1.0).is_err());
    }

    #[test]
    fn flatten_transparent_is_background() {
        assert_eq!(flatten_over([0, 0, 0, 0], [7, 8, 9]), [7, 8, 9]);
        assert_eq!(flatten_over([50, 60, 70, 255], [7, 8, 9]), [50, 60, 70]);
    }
}
