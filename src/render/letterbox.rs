//! Aspect-preserving fits of a picture into a target box.

use crate::foundation::core::Rect;

/// Largest rect with the source aspect ratio that fits inside `target`, centred.
pub fn fit_contain(src_w: u32, src_h: u32, target: Rect) -> Rect {
    fit(src_w, src_h, target, f64::min)
}

/// Smallest rect with the source aspect ratio that covers `target`, centred.
pub fn fit_cover(src_w: u32, src_h: u32, target: Rect) -> Rect {
    fit(src_w, src_h, target, f64::max)
}

fn fit(src_w: u32, src_h: u32, target: Rect, pick: fn(f64, f64) -> f64) -> Rect {
    if src_w == 0 || src_h == 0 || target.width() <= 0.0 || target.height() <= 0.0 {
        return target;
    }
    let scale = pick(
        target.width() / f64::from(src_w),
        target.height() / f64::from(src_h),
    );
    let w = f64::from(src_w) * scale;
    let h = f64::from(src_h) * scale;
    let c = target.center();
    Rect::new(c.x - w / 2.0, c.y - h / 2.0, c.x + w / 2.0, c.y + h / 2.0)
}

/// Whether `inner` leaves visible bars inside `outer`.
pub fn has_bars(inner: Rect, outer: Rect) -> bool {
    const EPS: f64 = 0.5;
    (inner.x0 - outer.x0).abs() > EPS
        || (inner.y0 - outer.y0).abs() > EPS
        || (inner.x1 - outer.x1).abs() > EPS
        || (inner.y1 - outer.y1).abs() > EPS
}
