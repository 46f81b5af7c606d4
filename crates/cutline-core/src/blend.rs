// crates/cutline-core/src/blend.rs
//
// Straight-alpha "over" compositing of RGBA frames.
//
// This is the one blending primitive the whole engine uses: the video
// composer stacks track outputs bottom-to-top with it, the transform
// filter's position stage places the transformed image on the output canvas
// with it, and the crossfade transition goes through it after scaling the
// front image's alpha.
//
// The blend runs in gamma-encoded byte space — the same approximation the
// transition helpers use. Rows are independent, so the pixel loop is
// parallelised per destination row.

use rayon::prelude::*;

use crate::frame::VideoFrame;

/// Composite `overlay` over `base` with its top-left corner at `(x, y)` in
/// base coordinates. Coordinates may be negative or exceed the base; the
/// out-of-canvas region is clipped.
///
/// Empty frames are a no-op: an empty overlay changes nothing.
pub fn alpha_over(base: &mut VideoFrame, overlay: &VideoFrame, x: i64, y: i64) {
    if base.is_empty() || overlay.is_empty() {
        return;
    }

    let bw = base.width as i64;
    let bh = base.height as i64;
    let ow = overlay.width as i64;
    let oh = overlay.height as i64;

    // Intersection of the overlay rect with the base canvas.
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + ow).min(bw);
    let y1 = (y + oh).min(bh);
    if x0 >= x1 || y0 >= y1 {
        return;
    }

    let row_px = (x1 - x0) as usize;
    let base_w = base.width as usize;

    base.data
        .par_chunks_mut(base_w * 4)
        .skip(y0 as usize)
        .take((y1 - y0) as usize)
        .enumerate()
        .for_each(|(i, brow)| {
            let oy = (y0 + i as i64 - y) as usize;
            let orow = overlay.row(oy as u32);
            let ox0 = (x0 - x) as usize;
            for px in 0..row_px {
                let b = (x0 as usize + px) * 4;
                let o = (ox0 + px) * 4;
                blend_px(&mut brow[b..b + 4], &orow[o..o + 4]);
            }
        });
}

/// One straight-alpha "over" blend: dst = src OVER dst.
#[inline]
fn blend_px(dst: &mut [u8], src: &[u8]) {
    let sa = src[3] as f32 / 255.0;
    if sa <= 0.0 {
        return;
    }
    if sa >= 1.0 {
        dst.copy_from_slice(src);
        return;
    }
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    if out_a <= 0.0 {
        dst.fill(0);
        return;
    }
    for c in 0..3 {
        let sc = src[c] as f32;
        let dc = dst[c] as f32;
        dst[c] = ((sc * sa + dc * da * (1.0 - sa)) / out_a).round() as u8;
    }
    dst[3] = (out_a * 255.0).round() as u8;
}

/// Multiply every alpha byte of `frame` by `gain` ∈ [0, 1], leaving colour
/// channels untouched. Used by the crossfade transition to ramp the front
/// image out.
pub fn scale_alpha(frame: &mut VideoFrame, gain: f32) {
    let g = gain.clamp(0.0, 1.0);
    for px in frame.data.chunks_exact_mut(4) {
        px[3] = (px[3] as f32 * g).round() as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgba: [u8; 4]) -> VideoFrame {
        let mut f = VideoFrame::transparent(w, h, 0.0);
        for px in f.data.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
        f
    }

    #[test]
    fn opaque_overlay_replaces_base() {
        let mut base = solid(2, 2, [10, 10, 10, 255]);
        let over = solid(2, 2, [200, 0, 0, 255]);
        alpha_over(&mut base, &over, 0, 0);
        assert_eq!(&base.data[0..4], &[200, 0, 0, 255]);
    }

    #[test]
    fn transparent_overlay_is_noop() {
        let mut base = solid(2, 2, [10, 20, 30, 255]);
        let over = solid(2, 2, [200, 200, 200, 0]);
        alpha_over(&mut base, &over, 0, 0);
        assert_eq!(&base.data[0..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn half_alpha_blends_midway() {
        let mut base = solid(1, 1, [0, 0, 0, 255]);
        let over = solid(1, 1, [255, 255, 255, 128]);
        alpha_over(&mut base, &over, 0, 0);
        // 128/255 ≈ 0.502 → ≈ 128 each channel, alpha stays 255.
        assert!((base.data[0] as i32 - 128).abs() <= 1);
        assert_eq!(base.data[3], 255);
    }

    #[test]
    fn offset_is_clipped_at_edges() {
        let mut base = solid(4, 4, [0, 0, 0, 255]);
        let over = solid(4, 4, [255, 0, 0, 255]);
        alpha_over(&mut base, &over, 2, 2);
        // Top-left untouched, bottom-right painted.
        assert_eq!(&base.data[0..4], &[0, 0, 0, 255]);
        let idx = (3 * 4 + 3) * 4;
        assert_eq!(&base.data[idx..idx + 4], &[255, 0, 0, 255]);
    }

    #[test]
    fn fully_off_canvas_is_noop() {
        let mut base = solid(2, 2, [9, 9, 9, 255]);
        let over = solid(2, 2, [255, 255, 255, 255]);
        alpha_over(&mut base, &over, -5, -5);
        assert!(base.data.chunks_exact(4).all(|p| p == [9, 9, 9, 255]));
    }

    #[test]
    fn scale_alpha_halves() {
        let mut f = solid(1, 1, [1, 2, 3, 200]);
        scale_alpha(&mut f, 0.5);
        assert_eq!(f.data[3], 100);
        assert_eq!(&f.data[0..3], &[1, 2, 3]);
    }
}
