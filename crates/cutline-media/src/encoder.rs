// crates/cutline-media/src/encoder.rs
//
// The encoder stays a collaborator — this module only surfaces the pull
// interface it drains and implements it on the composers. An encoder pulls
// frames at the video frame rate and sample blocks at its own cadence
// until both sources report EOF; muxing and codec configuration live on
// the encoder's side of the boundary.

use cutline_core::time::Ratio;
use cutline_core::{SampleBlock, VideoFrame};

use crate::composer::{AudioComposer, VideoComposer};
use crate::error::Result;

/// A finished-arrangement video feed an encoder can drain.
pub trait VideoTimelineSource {
    fn frame_rate(&self) -> Ratio;

    /// Next frame in presentation order; `None` at the end of the
    /// arrangement.
    fn next_frame(&mut self) -> Result<Option<VideoFrame>>;
}

/// A finished-arrangement audio feed an encoder can drain.
pub trait AudioTimelineSource {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Next block of mixed PCM; `None` at the end of the arrangement.
    fn next_block(&mut self) -> Result<Option<SampleBlock>>;
}

impl VideoTimelineSource for VideoComposer {
    fn frame_rate(&self) -> Ratio {
        self.output_spec()
            .map(|o| o.frame_rate)
            .unwrap_or(Ratio::new(25, 1))
    }

    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        let fps = VideoTimelineSource::frame_rate(self);
        let end_index =
            cutline_core::time::millis_to_frame_index((self.duration() * 1000.0).round() as i64, fps);
        let idx = self.read_frame_index();
        if idx >= end_index {
            return Ok(None);
        }
        let pos = cutline_core::time::frame_index_to_millis(idx, fps) as f64 / 1000.0;
        Ok(self
            .read_video_frame(pos, false, false)?
            .map(|unit| unit.frame))
    }
}

impl AudioTimelineSource for AudioComposer {
    fn sample_rate(&self) -> u32 {
        self.output_spec().map(|s| s.sample_rate).unwrap_or(44100)
    }

    fn channels(&self) -> u16 {
        self.output_spec().map(|s| s.channels).unwrap_or(2)
    }

    fn next_block(&mut self) -> Result<Option<SampleBlock>> {
        match self.read_audio_samples(false)? {
            Some(block) => {
                if self.duration() > 0.0 && block.timestamp >= self.duration() {
                    return Ok(None);
                }
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }
}
