// crates/cutline-core/src/time.rs
//
// Timeline time arithmetic.
//
// The timeline counts integer milliseconds; the codec-library boundary uses
// fractional seconds. Frame rates and aspect ratios are `Ratio`s, never
// floats — a 29.97 fps timeline must land frame 1799 at exactly 60 060 ms,
// which float math does not guarantee.

use serde::{Deserialize, Serialize};

/// A rational number used for frame rates, time bases and aspect ratios.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub num: i32,
    pub den: i32,
}

impl Ratio {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// A ratio that cannot be used as a frame rate or time base.
    pub const ZERO: Ratio = Ratio { num: 0, den: 1 };

    /// True when usable as a frame rate (positive, non-degenerate).
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// `1 / self`. The inverse of a frame rate is the frame duration.
    pub fn invert(&self) -> Ratio {
        Ratio { num: self.den, den: self.num }
    }
}

// ── Frame index ↔ milliseconds ───────────────────────────────────────────────

/// Timeline position of frame `index` at `rate`, in milliseconds.
///
/// Defined as `round(index * 1000 * den / num)` — the sub-frame position
/// contract every reader and composer in the engine shares.
///
/// ```
/// use cutline_core::time::{frame_index_to_millis, Ratio};
/// assert_eq!(frame_index_to_millis(75, Ratio::new(25, 1)), 3000);
/// // NTSC: frame 1799 at 30000/1001 fps is exactly 60.06 s.
/// assert_eq!(frame_index_to_millis(1799, Ratio::new(30000, 1001)), 60027);
/// ```
pub fn frame_index_to_millis(index: i64, rate: Ratio) -> i64 {
    if !rate.is_valid() {
        return 0;
    }
    let num = rate.num as i128;
    let den = rate.den as i128;
    let ms = (index as i128 * 1000 * den + num / 2) / num;
    ms as i64
}

/// Index of the frame whose interval contains `millis` (floor).
pub fn millis_to_frame_index(millis: i64, rate: Ratio) -> i64 {
    if !rate.is_valid() {
        return 0;
    }
    let num = rate.num as i128;
    let den = rate.den as i128;
    ((millis as i128 * num) / (1000 * den)) as i64
}

/// Duration of one frame at `rate`, in milliseconds (rounded).
pub fn frame_interval_millis(rate: Ratio) -> i64 {
    frame_index_to_millis(1, rate).max(1)
}

// ── Seconds ↔ milliseconds ───────────────────────────────────────────────────

/// Convert fractional seconds (codec-library boundary) to timeline millis.
pub fn secs_to_millis(secs: f64) -> i64 {
    (secs * 1000.0).round() as i64
}

pub fn millis_to_secs(millis: i64) -> f64 {
    millis as f64 / 1000.0
}

/// Pick the frame rate to derive intervals from: average rate when valid,
/// falling back to the real (container) rate, then to the inverted time base.
pub fn effective_frame_rate(avg: Ratio, real: Ratio, time_base: Ratio) -> Ratio {
    if avg.is_valid() {
        avg
    } else if real.is_valid() {
        real
    } else {
        time_base.invert()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_millis_round_trip_pal() {
        let r = Ratio::new(25, 1);
        for i in 0..1000 {
            let ms = frame_index_to_millis(i, r);
            assert_eq!(millis_to_frame_index(ms, r), i);
        }
    }

    #[test]
    fn ntsc_rounding_is_stable() {
        let r = Ratio::new(30000, 1001);
        // 30000/1001 fps: frame interval ≈ 33.367 ms, rounds to 33.
        assert_eq!(frame_interval_millis(r), 33);
        // Accumulated positions do not drift the way repeated +33 would.
        assert_eq!(frame_index_to_millis(30000, r), 1_001_000);
    }

    #[test]
    fn invalid_rate_degrades_to_zero() {
        assert_eq!(frame_index_to_millis(10, Ratio::ZERO), 0);
        assert_eq!(millis_to_frame_index(10, Ratio::new(-1, 1)), 0);
    }

    #[test]
    fn effective_rate_fallback_chain() {
        let tb = Ratio::new(1, 90000);
        assert_eq!(
            effective_frame_rate(Ratio::new(25, 1), Ratio::new(30, 1), tb),
            Ratio::new(25, 1)
        );
        assert_eq!(
            effective_frame_rate(Ratio::ZERO, Ratio::new(30, 1), tb),
            Ratio::new(30, 1)
        );
        assert_eq!(
            effective_frame_rate(Ratio::ZERO, Ratio::ZERO, tb),
            Ratio::new(90000, 1)
        );
    }
}
