/// `x * y / 255` with rounding, for 8-bit channel products.
#[inline]
pub fn mul_div255_u16(x: u16, y: u16) -> u16 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u16
}

#[inline]
pub fn mul_div255(x: u8, y: u8) -> u8 {
    mul_div255_u16(u16::from(x), u16::from(y)) as u8
}

pub fn premul_rgba8(r: u8, g: u8, b: u8, a: u8) -> [u8; 4] {
    [mul_div255(r, a), mul_div255(g, a), mul_div255(b, a), a]
}

pub fn premultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3];
        if a == 255 {
            continue;
        }
        if a == 0 {
            px[0] = 0;
            px[1] = 0;
            px[2] = 0;
            continue;
        }
        px[0] = mul_div255(px[0], a);
        px[1] = mul_div255(px[1], a);
        px[2] = mul_div255(px[2], a);
    }
}

/// Rec.601 luma of a premultiplied pixel, 0..=255.
#[inline]
pub fn luma(px: &[u8]) -> u8 {
    let r = u32::from(px[0]);
    let g = u32::from(px[1]);
    let b = u32::from(px[2]);
    ((r * 299 + g * 587 + b * 114 + 500) / 1000) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_div255_identity_and_zero() {
        assert_eq!(mul_div255(200, 255), 200);
        assert_eq!(mul_div255(200, 0), 0);
        assert_eq!(mul_div255(255, 128), 128);
    }

    #[test]
    fn premultiply_clears_transparent_pixels() {
        let mut px = vec![10, 20, 30, 0, 100, 50, 200, 128];
        premultiply_rgba8_in_place(&mut px);
        assert_eq!(&px[..4], &[0, 0, 0, 0]);
        assert_eq!(px[4], ((100u16 * 128 + 127) / 255) as u8);
        assert_eq!(px[7], 128);
    }

    #[test]
    fn luma_of_white_and_black() {
        assert_eq!(luma(&[255, 255, 255, 255]), 255);
        assert_eq!(luma(&[0, 0, 0, 255]), 0);
    }
}
