// crates/cutline-media/src/reader/mod.rs
//
// Per-file decode pipelines. One reader owns one media file and serves
// position queries; everything above (clips, tracks, composers) is
// arrangement bookkeeping around these.
//
// `video` is the full three-stage pipeline (demux → decode → convert).
// `audio` mirrors it with a resampler in the convert seat. `image` decodes
// a still once and serves it forever.

pub mod audio;
pub mod image;
pub mod video;

pub use audio::AudioReader;
pub use image::ImageReader;
pub use video::VideoReader;

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use cutline_core::time::Ratio;

// ── Output configuration ─────────────────────────────────────────────────────

/// Interpolation mode for the output image conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interp {
    FastBilinear,
    Bilinear,
    Bicubic,
    Area,
}

impl Interp {
    pub(crate) fn sws_flags(self) -> ffmpeg_the_third::software::scaling::Flags {
        use ffmpeg_the_third::software::scaling::Flags;
        match self {
            Interp::FastBilinear => Flags::FAST_BILINEAR,
            Interp::Bilinear => Flags::BILINEAR,
            Interp::Bicubic => Flags::BICUBIC,
            Interp::Area => Flags::AREA,
        }
    }
}

/// Output geometry a video track imposes on everything it reads.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VideoOutputSpec {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Ratio,
    pub interp: Interp,
}

impl VideoOutputSpec {
    pub fn validate(&self) -> crate::Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(crate::Error::invalid("output size must be non-zero"));
        }
        if !self.frame_rate.is_valid() {
            return Err(crate::Error::invalid("output frame rate must be positive"));
        }
        Ok(())
    }
}

/// Output format an audio track imposes on everything it reads.
/// Samples are interleaved f32 throughout the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioOutputSpec {
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioOutputSpec {
    pub fn validate(&self) -> crate::Result<()> {
        if self.channels == 0 || self.channels > 2 {
            return Err(crate::Error::invalid("channels must be 1 or 2"));
        }
        if self.sample_rate == 0 {
            return Err(crate::Error::invalid("sample rate must be non-zero"));
        }
        Ok(())
    }
}

// ── Bounded handoff queue ────────────────────────────────────────────────────

/// The blocking queue between pipeline stages. Pushes block while full —
/// that is the backpressure — but abort as soon as the caller's predicate
/// turns true (quit flag, pending seek), so a stalled consumer can never
/// wedge a producer that has been asked to stop.
pub(crate) struct BoundedQueue<T> {
    q: Mutex<std::collections::VecDeque<T>>,
    cv: Condvar,
    cap: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(cap: usize) -> Self {
        Self { q: Mutex::new(Default::default()), cv: Condvar::new(), cap }
    }

    /// Returns false when aborted; the item is dropped.
    pub fn push(&self, item: T, abort: impl Fn() -> bool) -> bool {
        let mut q = self.q.lock();
        while q.len() >= self.cap {
            if abort() {
                return false;
            }
            self.cv.wait_for(&mut q, Duration::from_millis(5));
        }
        q.push_back(item);
        self.cv.notify_all();
        true
    }

    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let mut q = self.q.lock();
        if q.is_empty() {
            self.cv.wait_for(&mut q, timeout);
        }
        let item = q.pop_front();
        if item.is_some() {
            self.cv.notify_all();
        }
        item
    }

    pub fn clear(&self) {
        self.q.lock().clear();
        self.cv.notify_all();
    }
}

// ── Cache window ─────────────────────────────────────────────────────────────

/// The span of pts a video reader keeps decoded around its read position.
///
/// Forward playback keeps `ahead` frames in the play direction and `behind`
/// frames just played; reverse playback mirrors the span. Pure arithmetic —
/// the three pipeline threads all derive their pruning and backpressure
/// decisions from this one function so they can never disagree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CacheWindow {
    pub lo: i64,
    pub hi: i64,
}

impl CacheWindow {
    pub fn compute(read_pts: i64, ahead: usize, behind: usize, interval_pts: i64, forward: bool) -> Self {
        let a = ahead as i64 * interval_pts;
        let b = behind as i64 * interval_pts;
        if forward {
            CacheWindow { lo: read_pts - b, hi: read_pts + a }
        } else {
            CacheWindow { lo: read_pts - a, hi: read_pts + b }
        }
    }

    pub fn contains(&self, pts: i64) -> bool {
        pts >= self.lo && pts <= self.hi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_window_extends_ahead() {
        let w = CacheWindow::compute(1000, 10, 2, 40, true);
        assert_eq!(w, CacheWindow { lo: 920, hi: 1400 });
    }

    #[test]
    fn reverse_window_is_mirrored() {
        let f = CacheWindow::compute(1000, 10, 2, 40, true);
        let r = CacheWindow::compute(1000, 10, 2, 40, false);
        assert_eq!(r.lo, 1000 - (f.hi - 1000));
        assert_eq!(r.hi, 1000 + (1000 - f.lo));
    }

    #[test]
    fn contains_is_inclusive() {
        let w = CacheWindow { lo: 0, hi: 100 };
        assert!(w.contains(0));
        assert!(w.contains(100));
        assert!(!w.contains(101));
    }

    #[test]
    fn video_spec_rejects_degenerate() {
        let spec = VideoOutputSpec {
            width: 0,
            height: 720,
            frame_rate: Ratio::new(25, 1),
            interp: Interp::Bilinear,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn audio_spec_rejects_many_channels() {
        assert!(AudioOutputSpec { channels: 6, sample_rate: 48000 }.validate().is_err());
        assert!(AudioOutputSpec { channels: 2, sample_rate: 44100 }.validate().is_ok());
    }
}
