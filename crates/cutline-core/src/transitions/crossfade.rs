// crates/cutline-core/src/transitions/crossfade.rs
//
// Default video transition: linear alpha cross-fade.
//
// The front image's alpha is ramped from 1.0 down to 0.0 across the overlap
// and the result is composited over the rear image. Blending runs in
// gamma-encoded byte space — visually correct for SDR dissolves.

use crate::blend::{alpha_over, scale_alpha};
use crate::frame::VideoFrame;
use crate::transitions::{front_weight, VideoTransition};

/// Linear alpha cross-fade of the front clip over the rear.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crossfade;

impl VideoTransition for Crossfade {
    fn name(&self) -> &'static str {
        "crossfade"
    }

    fn mix(&self, front: &VideoFrame, rear: &VideoFrame, pos_ms: i64, dur_ms: i64) -> VideoFrame {
        // A missing side degrades to the other — an overlap where one clip
        // is between frames must not flash to black.
        if front.is_empty() {
            return rear.clone();
        }
        if rear.is_empty() {
            return front.clone();
        }

        let w = front_weight(pos_ms, dur_ms);
        let mut out = rear.clone();
        let mut faded = front.clone();
        scale_alpha(&mut faded, w);
        alpha_over(&mut out, &faded, 0, 0);
        out.timestamp = front.timestamp;
        out
    }

    fn clone_box(&self) -> Box<dyn VideoTransition> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(rgba: [u8; 4]) -> VideoFrame {
        let mut f = VideoFrame::transparent(2, 2, 0.0);
        for px in f.data.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
        f
    }

    #[test]
    fn start_of_overlap_is_front() {
        let front = solid([200, 0, 0, 255]);
        let rear = solid([0, 200, 0, 255]);
        let out = Crossfade.mix(&front, &rear, 0, 2000);
        assert_eq!(&out.data[0..4], &[200, 0, 0, 255]);
    }

    #[test]
    fn end_of_overlap_is_rear() {
        let front = solid([200, 0, 0, 255]);
        let rear = solid([0, 200, 0, 255]);
        let out = Crossfade.mix(&front, &rear, 2000, 2000);
        assert_eq!(&out.data[0..4], &[0, 200, 0, 255]);
    }

    #[test]
    fn midpoint_blends_both() {
        let front = solid([255, 0, 0, 255]);
        let rear = solid([0, 0, 0, 255]);
        let out = Crossfade.mix(&front, &rear, 1000, 2000);
        // Front at half alpha over opaque black → red ≈ 128.
        assert!((out.data[0] as i32 - 128).abs() <= 2, "red was {}", out.data[0]);
        assert_eq!(out.data[3], 255);
    }

    #[test]
    fn empty_front_degrades_to_rear() {
        let rear = solid([1, 2, 3, 255]);
        let out = Crossfade.mix(&VideoFrame::empty(0.0), &rear, 500, 1000);
        assert_eq!(out.data, rear.data);
    }

    #[test]
    fn zero_duration_returns_rear() {
        let front = solid([255, 0, 0, 255]);
        let rear = solid([0, 0, 255, 255]);
        let out = Crossfade.mix(&front, &rear, 0, 0);
        assert_eq!(&out.data[0..4], &[0, 0, 255, 255]);
    }
}
