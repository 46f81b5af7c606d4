// crates/cutline-core/src/raster.rs
//
// RGBA raster operations for the video transform chain: border crop,
// bilinear resize, arbitrary-angle rotation. All operate on owned packed
// frames and parallelise per output row.
//
// Rotation and resize sample with bilinear interpolation and treat
// out-of-source coordinates as fully transparent, so the results composite
// cleanly with `blend::alpha_over`.

use rayon::prelude::*;

use crate::frame::VideoFrame;

/// Clear a border of `(l, t, r, b)` pixels to transparent. The frame keeps
/// its size — crop in this engine means "punch out the edges", the canvas
/// placement happens later in the chain.
pub fn crop_border(frame: &mut VideoFrame, l: u32, t: u32, r: u32, b: u32) {
    let w = frame.width;
    let h = frame.height;
    if l == 0 && t == 0 && r == 0 && b == 0 {
        return;
    }
    if l + r >= w || t + b >= h {
        // Everything cropped away.
        frame.data.fill(0);
        return;
    }
    for y in 0..h {
        let row = frame.row_mut(y);
        if y < t || y >= h - b {
            row.fill(0);
            continue;
        }
        row[..(l as usize) * 4].fill(0);
        row[((w - r) as usize) * 4..].fill(0);
    }
}

/// Bilinear resize to `dst_w × dst_h`.
pub fn resize_bilinear(src: &VideoFrame, dst_w: u32, dst_h: u32) -> VideoFrame {
    if dst_w == src.width && dst_h == src.height {
        return src.clone();
    }
    let mut dst = VideoFrame::transparent(dst_w, dst_h, src.timestamp);
    if src.is_empty() || dst_w == 0 || dst_h == 0 {
        return dst;
    }

    let sx = src.width as f32 / dst_w as f32;
    let sy = src.height as f32 / dst_h as f32;
    let row_bytes = dst_w as usize * 4;

    dst.data
        .par_chunks_mut(row_bytes)
        .enumerate()
        .for_each(|(y, row)| {
            let fy = (y as f32 + 0.5) * sy - 0.5;
            for x in 0..dst_w as usize {
                let fx = (x as f32 + 0.5) * sx - 0.5;
                let px = sample_bilinear(src, fx, fy);
                row[x * 4..x * 4 + 4].copy_from_slice(&px);
            }
        });
    dst
}

/// Rotate by `degrees` (counter-clockwise positive). The output canvas is
/// the source's rotated bounding box; uncovered corners are transparent.
pub fn rotate_rgba(src: &VideoFrame, degrees: f32) -> VideoFrame {
    let (dst_w, dst_h) = rotated_bounds(src.width, src.height, degrees);
    let mut dst = VideoFrame::transparent(dst_w, dst_h, src.timestamp);
    if src.is_empty() {
        return dst;
    }

    let rad = degrees.to_radians();
    let (sin, cos) = rad.sin_cos();
    let scx = src.width as f32 / 2.0;
    let scy = src.height as f32 / 2.0;
    let dcx = dst_w as f32 / 2.0;
    let dcy = dst_h as f32 / 2.0;
    let row_bytes = dst_w as usize * 4;

    dst.data
        .par_chunks_mut(row_bytes)
        .enumerate()
        .for_each(|(y, row)| {
            let dy = y as f32 + 0.5 - dcy;
            for x in 0..dst_w as usize {
                let dx = x as f32 + 0.5 - dcx;
                // Inverse mapping: rotate the destination coordinate back
                // into source space.
                let sxf = dx * cos + dy * sin + scx - 0.5;
                let syf = -dx * sin + dy * cos + scy - 0.5;
                let px = sample_bilinear(src, sxf, syf);
                row[x * 4..x * 4 + 4].copy_from_slice(&px);
            }
        });
    dst
}

/// Bounding-box size of a `w × h` rect rotated by `degrees`.
pub fn rotated_bounds(w: u32, h: u32, degrees: f32) -> (u32, u32) {
    let rad = degrees.to_radians();
    let (sin, cos) = (rad.sin().abs(), rad.cos().abs());
    let bw = (w as f32 * cos + h as f32 * sin).ceil() as u32;
    let bh = (w as f32 * sin + h as f32 * cos).ceil() as u32;
    (bw.max(1), bh.max(1))
}

/// Bilinear sample at a fractional coordinate; outside pixels contribute
/// transparency.
#[inline]
fn sample_bilinear(src: &VideoFrame, fx: f32, fy: f32) -> [u8; 4] {
    let w = src.width as i64;
    let h = src.height as i64;
    let x0 = fx.floor() as i64;
    let y0 = fy.floor() as i64;
    let tx = fx - x0 as f32;
    let ty = fy - y0 as f32;

    let mut acc = [0.0f32; 4];
    for (dy, wy) in [(0i64, 1.0 - ty), (1, ty)] {
        for (dx, wx) in [(0i64, 1.0 - tx), (1, tx)] {
            let weight = wx * wy;
            if weight <= 0.0 {
                continue;
            }
            let x = x0 + dx;
            let y = y0 + dy;
            if x < 0 || y < 0 || x >= w || y >= h {
                continue; // transparent contribution
            }
            let idx = ((y * w + x) * 4) as usize;
            let a = src.data[idx + 3] as f32 * weight;
            // Accumulate colour premultiplied so transparent neighbours
            // don't bleed their (meaningless) colour in.
            acc[0] += src.data[idx] as f32 * a;
            acc[1] += src.data[idx + 1] as f32 * a;
            acc[2] += src.data[idx + 2] as f32 * a;
            acc[3] += a;
        }
    }
    if acc[3] <= 0.0 {
        return [0, 0, 0, 0];
    }
    [
        (acc[0] / acc[3]).round().clamp(0.0, 255.0) as u8,
        (acc[1] / acc[3]).round().clamp(0.0, 255.0) as u8,
        (acc[2] / acc[3]).round().clamp(0.0, 255.0) as u8,
        acc[3].round().clamp(0.0, 255.0) as u8,
    ]
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
    fn crop_border_clears_edges_only() {
        let mut f = solid(4, 4, [255, 255, 255, 255]);
        crop_border(&mut f, 1, 1, 1, 1);
        assert_eq!(f.row(0), &[0u8; 16][..]); // top row gone
        // Centre survives.
        assert_eq!(&f.row(1)[4..8], &[255, 255, 255, 255]);
        // Left/right columns gone.
        assert_eq!(&f.row(1)[0..4], &[0, 0, 0, 0]);
        assert_eq!(&f.row(1)[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn crop_everything_blanks_frame() {
        let mut f = solid(4, 4, [255, 0, 0, 255]);
        crop_border(&mut f, 2, 0, 2, 0);
        assert!(f.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn resize_identity_is_clone() {
        let f = solid(4, 4, [1, 2, 3, 255]);
        let r = resize_bilinear(&f, 4, 4);
        assert_eq!(r.data, f.data);
    }

    #[test]
    fn resize_solid_stays_solid() {
        let f = solid(4, 4, [10, 200, 30, 255]);
        let r = resize_bilinear(&f, 8, 2);
        assert_eq!((r.width, r.height), (8, 2));
        assert!(r.data.chunks_exact(4).all(|p| p == [10, 200, 30, 255]));
    }

    #[test]
    fn rotated_bounds_right_angles() {
        assert_eq!(rotated_bounds(100, 50, 0.0), (100, 50));
        assert_eq!(rotated_bounds(100, 50, 90.0), (50, 100));
        assert_eq!(rotated_bounds(100, 50, 180.0), (100, 50));
    }

    #[test]
    fn rotated_bounds_45_expands_to_diagonal() {
        let (w, h) = rotated_bounds(100, 100, 45.0);
        // 100 * sqrt(2) ≈ 141.4 → ceil
        assert!((141..=143).contains(&w));
        assert_eq!(w, h);
    }

    #[test]
    fn rotate_90_maps_dimensions() {
        let f = solid(6, 2, [50, 60, 70, 255]);
        let r = rotate_rgba(&f, 90.0);
        assert_eq!((r.width, r.height), (2, 6));
        // Interior pixel stays solid.
        let idx = ((3 * r.width + 1) * 4) as usize;
        assert_eq!(&r.data[idx..idx + 4], &[50, 60, 70, 255]);
    }

    #[test]
    fn rotate_zero_round_trips() {
        let f = solid(3, 3, [9, 8, 7, 255]);
        let r = rotate_rgba(&f, 0.0);
        assert_eq!(r.data, f.data);
    }
}
