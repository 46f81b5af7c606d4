// crates/cutline-core/src/transitions/audio.rs
//
// Default audio transitions.
//
// The default on a new overlap is `PassThrough` — the rear clip plays alone
// through the overlap, which is what a straight cut sounds like. Hosts that
// want an audible dissolve install `AudioCrossfade` instead.

use crate::frame::SampleBlock;
use crate::transitions::{front_weight, AudioTransition};

/// Rear clip only. The default audio transition.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl AudioTransition for PassThrough {
    fn name(&self) -> &'static str {
        "pass-through"
    }

    fn mix(&self, front: &SampleBlock, rear: &SampleBlock, _pos_ms: i64, _dur_ms: i64) -> SampleBlock {
        if rear.is_empty() {
            return front.clone();
        }
        rear.clone()
    }

    fn clone_box(&self) -> Box<dyn AudioTransition> {
        Box::new(*self)
    }
}

/// Equal-gain linear cross-fade: front ramps out, rear ramps in.
///
/// The per-block gain is sampled once at the block's start position —
/// blocks are short (≈23 ms at 44.1 kHz / 1024 samples) so a per-sample
/// ramp buys nothing audible.
#[derive(Clone, Copy, Debug, Default)]
pub struct AudioCrossfade;

impl AudioTransition for AudioCrossfade {
    fn name(&self) -> &'static str {
        "audio-crossfade"
    }

    fn mix(&self, front: &SampleBlock, rear: &SampleBlock, pos_ms: i64, dur_ms: i64) -> SampleBlock {
        if front.is_empty() {
            return rear.clone();
        }
        if rear.is_empty() {
            return front.clone();
        }

        let w = front_weight(pos_ms, dur_ms);
        let mut out = rear.clone();
        out.scale(1.0 - w);
        let mut faded = front.clone();
        faded.scale(w);
        out.mix_in(&faded);
        out.timestamp = front.timestamp;
        out
    }

    fn clone_box(&self) -> Box<dyn AudioTransition> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(v: f32) -> SampleBlock {
        SampleBlock { channels: 2, sample_rate: 44100, data: vec![v; 8], timestamp: 0.0 }
    }

    #[test]
    fn pass_through_returns_rear() {
        let out = PassThrough.mix(&block(0.9), &block(0.1), 500, 1000);
        assert!(out.data.iter().all(|&s| (s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn pass_through_degrades_to_front() {
        let out = PassThrough.mix(&block(0.9), &SampleBlock::default(), 500, 1000);
        assert!(out.data.iter().all(|&s| (s - 0.9).abs() < 1e-6));
    }

    #[test]
    fn crossfade_midpoint_averages() {
        let out = AudioCrossfade.mix(&block(1.0), &block(0.0), 500, 1000);
        assert!(out.data.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn crossfade_endpoints() {
        let start = AudioCrossfade.mix(&block(1.0), &block(-1.0), 0, 1000);
        assert!(start.data.iter().all(|&s| (s - 1.0).abs() < 1e-6));
        let end = AudioCrossfade.mix(&block(1.0), &block(-1.0), 1000, 1000);
        assert!(end.data.iter().all(|&s| (s + 1.0).abs() < 1e-6));
    }
}
