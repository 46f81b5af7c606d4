// crates/cutline-media/src/clip.rs
//
// Clips: a trimmed window of one source placed at a timeline position.
//
// A video clip owns its source reader (stream or still image), an optional
// user filter and the transform chain; an audio clip owns its reader and an
// optional effect chain. All positions at this layer are *clip-local*
// milliseconds — the owning track translates timeline positions before
// calling in, and the clip adds its `start_offset` before talking to the
// source.
//
// Clips also manage their reader's suspend/wake: the track reports the
// read position every frame via `notify_read_pos`, and a clip more than
// `wake_range` away from being needed releases its decoder.

use std::sync::Arc;

use cutline_core::{CorrelativeFrame, Id, Phase, SampleBlock, VideoFrame, NIL_ID};

use crate::error::{Error, Result};
use crate::filter::{VideoFilter, VideoTransformFilter};
use crate::filter::audio_effect::AudioEffectFilter;
use crate::parser::MediaParser;
use crate::reader::{AudioOutputSpec, AudioReader, ImageReader, VideoOutputSpec, VideoReader};

/// How far outside its own range a clip keeps its reader awake (ms).
const DEFAULT_WAKE_RANGE_MS: i64 = 1000;

/// Validate the clip-range invariant shared by every trimmed clip.
fn validate_range(start_offset: i64, end_offset: i64, src_dur_ms: i64) -> Result<()> {
    if start_offset < 0 {
        return Err(Error::invalid("start_offset must be >= 0"));
    }
    if end_offset < 0 {
        return Err(Error::invalid("end_offset must be >= 0"));
    }
    if start_offset + end_offset >= src_dur_ms {
        return Err(Error::invalid(format!(
            "trim leaves no duration: start_offset {start_offset} + end_offset {end_offset} >= source {src_dur_ms} ms"
        )));
    }
    Ok(())
}

// ── Video ────────────────────────────────────────────────────────────────────

enum VideoSource {
    Stream(VideoReader),
    Still(ImageReader),
}

pub struct VideoClip {
    id: Id,
    track_id: Id,
    parser: Arc<MediaParser>,
    source: VideoSource,
    /// Timeline position (ms).
    start: i64,
    start_offset: i64,
    end_offset: i64,
    /// Source duration for streams; the user-set duration for stills.
    src_duration_ms: i64,
    is_image: bool,
    filter: Option<Box<dyn VideoFilter>>,
    transform: VideoTransformFilter,
    wake_range_ms: i64,
}

impl VideoClip {
    /// A clip over a video stream, trimmed to
    /// `[start_offset, src_dur - end_offset)` and placed at `start`.
    pub fn new(
        id: Id,
        parser: Arc<MediaParser>,
        out: &VideoOutputSpec,
        start: i64,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<Self> {
        out.validate()?;
        let src_duration_ms = (parser.duration() * 1000.0).round() as i64;
        validate_range(start_offset, end_offset, src_duration_ms)?;

        let mut reader = VideoReader::from_parser(Arc::clone(&parser))?;
        reader.configure(out.width, out.height, out.interp)?;
        reader.start(true)?; // woken on demand by notify_read_pos

        Ok(Self {
            id,
            track_id: NIL_ID,
            parser,
            source: VideoSource::Stream(reader),
            start,
            start_offset,
            end_offset,
            src_duration_ms,
            is_image: false,
            filter: None,
            transform: VideoTransformFilter::new(out.width, out.height)?,
            wake_range_ms: DEFAULT_WAKE_RANGE_MS,
        })
    }

    /// A still-image clip. Images carry no source timeline, so the caller
    /// sets the duration directly and offsets stay zero.
    pub fn new_image(
        id: Id,
        parser: Arc<MediaParser>,
        out: &VideoOutputSpec,
        start: i64,
        duration_ms: i64,
    ) -> Result<Self> {
        out.validate()?;
        if duration_ms <= 0 {
            return Err(Error::invalid("image clip duration must be > 0"));
        }
        let mut reader = ImageReader::from_parser(Arc::clone(&parser))?;
        reader.configure(out.width, out.height, out.interp)?;
        reader.start()?;

        Ok(Self {
            id,
            track_id: NIL_ID,
            parser,
            source: VideoSource::Still(reader),
            start,
            start_offset: 0,
            end_offset: 0,
            src_duration_ms: duration_ms,
            is_image: true,
            filter: None,
            transform: VideoTransformFilter::new(out.width, out.height)?,
            wake_range_ms: DEFAULT_WAKE_RANGE_MS,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn track_id(&self) -> Id {
        self.track_id
    }

    pub(crate) fn set_track_id(&mut self, track_id: Id) {
        self.track_id = track_id;
    }

    pub fn parser(&self) -> &Arc<MediaParser> {
        &self.parser
    }

    pub fn is_image(&self) -> bool {
        self.is_image
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    /// Trimmed duration on the timeline (ms).
    pub fn duration(&self) -> i64 {
        if self.is_image {
            self.src_duration_ms
        } else {
            self.src_duration_ms - self.start_offset - self.end_offset
        }
    }

    /// One past the last timeline millisecond this clip covers.
    pub fn end(&self) -> i64 {
        self.start + self.duration()
    }

    pub fn range(&self) -> (i64, i64) {
        (self.start, self.end())
    }

    pub fn transform(&self) -> &VideoTransformFilter {
        &self.transform
    }

    pub fn transform_mut(&mut self) -> &mut VideoTransformFilter {
        &mut self.transform
    }

    pub fn set_filter(&mut self, filter: Option<Box<dyn VideoFilter>>) {
        self.filter = filter;
    }

    // ── Range edits (track re-validates invariant A afterwards) ─────────

    pub(crate) fn set_start(&mut self, start: i64) {
        self.start = start;
    }

    pub(crate) fn set_offsets(&mut self, start_offset: i64, end_offset: i64) -> Result<()> {
        if self.is_image {
            return Err(Error::invalid("image clips have no source offsets"));
        }
        validate_range(start_offset, end_offset, self.src_duration_ms)?;
        self.start_offset = start_offset;
        self.end_offset = end_offset;
        Ok(())
    }

    pub(crate) fn set_image_duration(&mut self, duration_ms: i64) -> Result<()> {
        if !self.is_image {
            return Err(Error::invalid("duration is derived for stream clips"));
        }
        if duration_ms <= 0 {
            return Err(Error::invalid("image clip duration must be > 0"));
        }
        self.src_duration_ms = duration_ms;
        Ok(())
    }

    // ── Reading ──────────────────────────────────────────────────────────

    /// Read the frame at clip-local `local_ms`, run it through the filter
    /// and transform chain. `collect` receives the per-phase intermediates
    /// when the composer asks for them.
    pub fn read_video_frame(
        &mut self,
        local_ms: i64,
        wait: bool,
        mut collect: Option<&mut Vec<CorrelativeFrame>>,
    ) -> Result<(VideoFrame, bool)> {
        let (img, eof) = match &mut self.source {
            VideoSource::Still(reader) => {
                let img = reader.read_video_frame(local_ms as f64 / 1000.0)?;
                (img, local_ms >= self.src_duration_ms)
            }
            VideoSource::Stream(reader) => {
                let src_secs = (local_ms + self.start_offset) as f64 / 1000.0;
                reader.read_video_frame(src_secs, wait)?
            }
        };

        if let Some(c) = collect.as_deref_mut() {
            c.push(CorrelativeFrame {
                phase: Phase::SourceOutput,
                track_id: self.track_id,
                clip_id: self.id,
                frame: img.clone(),
            });
        }

        let filtered = match &mut self.filter {
            Some(f) => {
                let out = f.apply(img, local_ms);
                if let Some(c) = collect.as_deref_mut() {
                    c.push(CorrelativeFrame {
                        phase: Phase::AfterFilter,
                        track_id: self.track_id,
                        clip_id: self.id,
                        frame: out.clone(),
                    });
                }
                out
            }
            None => img,
        };

        let transformed = self.transform.apply(filtered, local_ms);
        if let Some(c) = collect {
            c.push(CorrelativeFrame {
                phase: Phase::AfterTransform,
                track_id: self.track_id,
                clip_id: self.id,
                frame: transformed.clone(),
            });
        }
        Ok((transformed, eof))
    }

    /// Seek the source to a clip-local position (clamped to the clip).
    pub fn seek_to(&mut self, local_ms: i64) -> Result<()> {
        let local = local_ms.clamp(0, (self.duration() - 1).max(0));
        match &mut self.source {
            VideoSource::Still(_) => Ok(()),
            VideoSource::Stream(reader) => {
                if reader.is_suspended() {
                    return Ok(()); // position is applied on wake
                }
                reader.seek_to((local + self.start_offset) as f64 / 1000.0)
            }
        }
    }

    pub fn set_direction(&mut self, forward: bool) -> Result<()> {
        match &mut self.source {
            VideoSource::Still(_) => Ok(()),
            VideoSource::Stream(reader) => reader.set_direction(forward),
        }
    }

    /// Track-position report: suspend the reader when the playhead is far
    /// away, wake it (re-seeking to where the playhead will enter) when it
    /// comes near.
    pub fn notify_read_pos(&mut self, track_pos_ms: i64) {
        let delta = track_pos_ms - self.start;
        let far = delta < -self.wake_range_ms || delta > self.duration() + self.wake_range_ms;
        let VideoSource::Stream(reader) = &mut self.source else { return };
        if far {
            reader.suspend();
        } else if reader.is_suspended() {
            reader.wake_up();
            let local = delta.clamp(0, (self.duration() - 1).max(0));
            let _ = reader.seek_to((local + self.start_offset) as f64 / 1000.0);
        }
    }

    pub fn set_wake_range(&mut self, range_ms: i64) {
        self.wake_range_ms = range_ms.max(0);
    }

    /// A fresh clip over the same source, trim and filters — the per-clip
    /// half of a composer clone. The new clip owns its own reader.
    pub fn duplicate(&self, out: &VideoOutputSpec) -> Result<VideoClip> {
        let mut clip = if self.is_image {
            VideoClip::new_image(
                self.id,
                Arc::clone(&self.parser),
                out,
                self.start,
                self.src_duration_ms,
            )?
        } else {
            VideoClip::new(
                self.id,
                Arc::clone(&self.parser),
                out,
                self.start,
                self.start_offset,
                self.end_offset,
            )?
        };
        clip.transform = self.transform.clone_with_canvas(out.width, out.height);
        clip.filter = self.filter.clone();
        clip.wake_range_ms = self.wake_range_ms;
        Ok(clip)
    }
}

// ── Audio ────────────────────────────────────────────────────────────────────

pub struct AudioClip {
    id: Id,
    track_id: Id,
    parser: Arc<MediaParser>,
    reader: AudioReader,
    spec: AudioOutputSpec,
    start: i64,
    start_offset: i64,
    end_offset: i64,
    src_duration_ms: i64,
    filter: Option<AudioEffectFilter>,
    wake_range_ms: i64,
}

impl AudioClip {
    pub fn new(
        id: Id,
        parser: Arc<MediaParser>,
        spec: AudioOutputSpec,
        start: i64,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<Self> {
        spec.validate()?;
        let src_duration_ms = (parser.duration() * 1000.0).round() as i64;
        validate_range(start_offset, end_offset, src_duration_ms)?;

        let mut reader = AudioReader::from_parser(Arc::clone(&parser))?;
        reader.configure(spec)?;
        reader.start(true)?;

        Ok(Self {
            id,
            track_id: NIL_ID,
            parser,
            reader,
            spec,
            start,
            start_offset,
            end_offset,
            src_duration_ms,
            filter: None,
            wake_range_ms: DEFAULT_WAKE_RANGE_MS,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn track_id(&self) -> Id {
        self.track_id
    }

    pub(crate) fn set_track_id(&mut self, track_id: Id) {
        self.track_id = track_id;
    }

    pub fn parser(&self) -> &Arc<MediaParser> {
        &self.parser
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn start_offset(&self) -> i64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> i64 {
        self.end_offset
    }

    pub fn duration(&self) -> i64 {
        self.src_duration_ms - self.start_offset - self.end_offset
    }

    pub fn end(&self) -> i64 {
        self.start + self.duration()
    }

    pub fn range(&self) -> (i64, i64) {
        (self.start, self.end())
    }

    /// Clip duration in output samples.
    pub fn total_samples(&self) -> i64 {
        self.duration() * self.spec.sample_rate as i64 / 1000
    }

    /// Samples still readable in the current direction.
    pub fn left_samples(&self) -> i64 {
        self.reader.left_samples()
    }

    pub fn effect_filter(&mut self) -> &mut Option<AudioEffectFilter> {
        &mut self.filter
    }

    pub fn set_effect_filter(&mut self, filter: Option<AudioEffectFilter>) {
        self.filter = filter;
    }

    pub(crate) fn set_start(&mut self, start: i64) {
        self.start = start;
    }

    pub(crate) fn set_offsets(&mut self, start_offset: i64, end_offset: i64) -> Result<()> {
        validate_range(start_offset, end_offset, self.src_duration_ms)?;
        self.start_offset = start_offset;
        self.end_offset = end_offset;
        Ok(())
    }

    /// Read up to `n` samples from the clip's cursor, through the optional
    /// effect chain. EOF reflects the *clip* bounds, not the file's.
    pub fn read_audio_samples(&mut self, n: usize) -> Result<(SampleBlock, bool)> {
        let (block, src_eof) = self.reader.read_audio_samples(n)?;
        let out = match &mut self.filter {
            Some(f) => f.apply(&block)?,
            None => block,
        };
        Ok((out, src_eof))
    }

    pub fn seek_to(&mut self, local_ms: i64) -> Result<()> {
        let local = local_ms.clamp(0, (self.duration() - 1).max(0));
        if self.reader.is_suspended() {
            return Ok(());
        }
        self.reader
            .seek_to((local + self.start_offset) as f64 / 1000.0)
    }

    /// Sample-accurate seek: the reader's cursor lands on exactly
    /// `local_sample` plus the trim offset, so track-side range assembly
    /// stays bit-aligned across seeks.
    pub fn seek_to_sample(&mut self, local_sample: i64) -> Result<()> {
        let clamped = local_sample.clamp(0, (self.total_samples() - 1).max(0));
        if self.reader.is_suspended() {
            return Ok(());
        }
        let rate = self.spec.sample_rate as f64;
        self.reader
            .seek_to(clamped as f64 / rate + self.start_offset as f64 / 1000.0)
    }

    pub fn set_direction(&mut self, forward: bool) -> Result<()> {
        self.reader.set_direction(forward)
    }

    pub fn notify_read_pos(&mut self, track_pos_ms: i64) {
        let delta = track_pos_ms - self.start;
        let far = delta < -self.wake_range_ms || delta > self.duration() + self.wake_range_ms;
        if far {
            self.reader.suspend();
        } else if self.reader.is_suspended() {
            self.reader.wake_up();
            let local = delta.clamp(0, (self.duration() - 1).max(0));
            let _ = self
                .reader
                .seek_to((local + self.start_offset) as f64 / 1000.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_invariant_rejects_negative_offsets() {
        assert!(validate_range(-1, 0, 1000).is_err());
        assert!(validate_range(0, -1, 1000).is_err());
    }

    #[test]
    fn range_invariant_requires_remaining_duration() {
        assert!(validate_range(600, 400, 1000).is_err());
        assert!(validate_range(600, 399, 1000).is_ok());
    }

    #[test]
    fn range_invariant_accepts_untrimmed() {
        assert!(validate_range(0, 0, 1).is_ok());
    }
}
