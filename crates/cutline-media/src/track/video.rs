// crates/cutline-media/src/track/video.rs
//
// VideoTrack: an ordered clip list, its derived overlaps, and a read
// cursor that turns "next frame please" into the right clip/overlap read.
//
// Structure mutations follow one shape: validate against invariant A,
// apply, re-sort, refresh overlaps (invariant B), then re-seek the cursor
// so iterators stay coherent. Validation happens before any mutation, so a
// rejected call leaves the track exactly as it was.

use std::sync::Arc;

use cutline_core::time::{frame_index_to_millis, millis_to_frame_index};
use cutline_core::{CorrelativeFrame, Id, Phase, VideoFrame};

use crate::clip::VideoClip;
use crate::error::{Error, Result};
use crate::overlap::{has_overlap, VideoOverlap};
use crate::parser::MediaParser;
use crate::reader::VideoOutputSpec;
use crate::track::{crosses_foreign_overlap, plan_overlap_update, two_mut};

pub struct VideoTrack {
    id: Id,
    out: VideoOutputSpec,
    clips: Vec<VideoClip>,       // sorted by start
    overlaps: Vec<VideoOverlap>, // sorted by start
    next_overlap_id: Id,
    /// Read cursor in output frames.
    read_frames: i64,
    forward: bool,
    visible: bool,
    read_clip_idx: usize,
    read_overlap_idx: usize,
}

impl VideoTrack {
    pub fn new(id: Id, out: VideoOutputSpec) -> Result<Self> {
        out.validate()?;
        Ok(Self {
            id,
            out,
            clips: Vec::new(),
            overlaps: Vec::new(),
            next_overlap_id: 1,
            read_frames: 0,
            forward: true,
            visible: true,
            read_clip_idx: 0,
            read_overlap_idx: 0,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn output_spec(&self) -> &VideoOutputSpec {
        &self.out
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    pub fn overlap_count(&self) -> usize {
        self.overlaps.len()
    }

    pub fn clip(&self, id: Id) -> Option<&VideoClip> {
        self.clips.iter().find(|c| c.id() == id)
    }

    pub fn clip_mut(&mut self, id: Id) -> Option<&mut VideoClip> {
        self.clips.iter_mut().find(|c| c.id() == id)
    }

    pub fn overlap(&self, id: Id) -> Option<&VideoOverlap> {
        self.overlaps.iter().find(|o| o.id() == id)
    }

    pub fn overlap_mut(&mut self, id: Id) -> Option<&mut VideoOverlap> {
        self.overlaps.iter_mut().find(|o| o.id() == id)
    }

    /// The overlap joining a specific clip pair, if one exists.
    pub fn overlap_for_pair_mut(&mut self, a: Id, b: Id) -> Option<&mut VideoOverlap> {
        self.overlaps
            .iter_mut()
            .find(|o| o.involves(a) && o.involves(b))
    }

    pub fn clips(&self) -> impl Iterator<Item = &VideoClip> {
        self.clips.iter()
    }

    pub fn overlaps(&self) -> impl Iterator<Item = &VideoOverlap> {
        self.overlaps.iter()
    }

    /// Invariant C: the track ends where its last clip ends.
    pub fn duration(&self) -> i64 {
        self.clips.iter().map(|c| c.end()).max().unwrap_or(0)
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }

    /// Current read position in milliseconds.
    pub fn read_pos_ms(&self) -> i64 {
        frame_index_to_millis(self.read_frames, self.out.frame_rate)
    }

    pub fn read_frame_index(&self) -> i64 {
        self.read_frames
    }

    /// Soft skip: move the frame cursor without per-clip seeks (the
    /// composer uses this when its output cache can bridge the jump).
    pub fn set_read_frame_index(&mut self, index: i64) {
        self.read_frames = index;
        let pos = self.read_pos_ms();
        self.refresh_cursors(pos);
    }

    // ── Structure ────────────────────────────────────────────────────────

    /// Construct a clip over `parser` and place it at `start`.
    pub fn add_new_clip(
        &mut self,
        id: Id,
        parser: Arc<MediaParser>,
        start: i64,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<Id> {
        let clip = VideoClip::new(id, parser, &self.out, start, start_offset, end_offset)?;
        self.insert_clip(clip)
    }

    /// Construct a still-image clip with a caller-set duration.
    pub fn add_image_clip(
        &mut self,
        id: Id,
        parser: Arc<MediaParser>,
        start: i64,
        duration_ms: i64,
    ) -> Result<Id> {
        let clip = VideoClip::new_image(id, parser, &self.out, start, duration_ms)?;
        self.insert_clip(clip)
    }

    /// Insert a pre-built clip (used when cloning a composer).
    pub fn insert_clip(&mut self, mut clip: VideoClip) -> Result<Id> {
        if self.clips.iter().any(|c| c.id() == clip.id()) {
            return Err(Error::invalid(format!("duplicate clip id {}", clip.id())));
        }
        self.validate_range_against_overlaps(clip.id(), clip.range())?;

        let id = clip.id();
        clip.set_track_id(self.id);
        let _ = clip.set_direction(self.forward);
        self.clips.push(clip);
        self.clips.sort_by_key(|c| c.start());
        self.update_clip_overlap(id, false);
        self.seek_to(self.read_pos_ms());
        Ok(id)
    }

    /// Move a clip to a new timeline start.
    pub fn move_clip(&mut self, id: Id, start: i64) -> Result<()> {
        let clip = self
            .clips
            .iter()
            .find(|c| c.id() == id)
            .ok_or_else(|| Error::invalid(format!("no clip {id}")))?;
        let new_range = (start, start + clip.duration());
        self.validate_range_against_overlaps(id, new_range)?;

        self.clip_mut(id).unwrap().set_start(start);
        self.clips.sort_by_key(|c| c.start());
        self.update_clip_overlap(id, false);
        self.seek_to(self.read_pos_ms());
        Ok(())
    }

    /// Re-trim a clip. For image clips `start_offset` is ignored and
    /// `end_offset` is reinterpreted as the new duration by callers using
    /// [`change_image_duration`](Self::change_image_duration).
    pub fn change_clip_range(&mut self, id: Id, start_offset: i64, end_offset: i64) -> Result<()> {
        let clip = self
            .clips
            .iter()
            .find(|c| c.id() == id)
            .ok_or_else(|| Error::invalid(format!("no clip {id}")))?;
        if clip.is_image() {
            return Err(Error::invalid("use change_image_duration for image clips"));
        }
        // Predict the new range for validation before mutating anything.
        let src_total = clip.duration() + clip.start_offset() + clip.end_offset();
        if start_offset < 0 || end_offset < 0 || start_offset + end_offset >= src_total {
            return Err(Error::invalid("trim leaves no duration"));
        }
        let new_range = (clip.start(), clip.start() + src_total - start_offset - end_offset);
        self.validate_range_against_overlaps(id, new_range)?;

        self.clip_mut(id).unwrap().set_offsets(start_offset, end_offset)?;
        self.clips.sort_by_key(|c| c.start());
        self.update_clip_overlap(id, false);
        self.seek_to(self.read_pos_ms());
        Ok(())
    }

    pub fn change_image_duration(&mut self, id: Id, duration_ms: i64) -> Result<()> {
        let clip = self
            .clips
            .iter()
            .find(|c| c.id() == id)
            .ok_or_else(|| Error::invalid(format!("no clip {id}")))?;
        if !clip.is_image() {
            return Err(Error::invalid("clip is not an image"));
        }
        let new_range = (clip.start(), clip.start() + duration_ms);
        if duration_ms <= 0 {
            return Err(Error::invalid("image clip duration must be > 0"));
        }
        self.validate_range_against_overlaps(id, new_range)?;

        self.clip_mut(id).unwrap().set_image_duration(duration_ms)?;
        self.update_clip_overlap(id, false);
        self.seek_to(self.read_pos_ms());
        Ok(())
    }

    /// Detach and return a clip. The clip's `track_id` resets to unattached.
    pub fn remove_clip(&mut self, id: Id) -> Result<VideoClip> {
        let idx = self
            .clips
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| Error::invalid(format!("no clip {id}")))?;
        let mut clip = self.clips.remove(idx);
        clip.set_track_id(cutline_core::NIL_ID);
        self.update_clip_overlap(id, true);
        self.seek_to(self.read_pos_ms());
        Ok(clip)
    }

    fn validate_range_against_overlaps(&self, clip_id: Id, range: (i64, i64)) -> Result<()> {
        let foreign = self
            .overlaps
            .iter()
            .filter(|o| !o.involves(clip_id))
            .map(|o| o.range());
        if crosses_foreign_overlap(range, foreign) {
            return Err(Error::invalid(format!(
                "clip {clip_id} range [{}, {}) crosses an overlap it is not part of",
                range.0, range.1
            )));
        }
        Ok(())
    }

    /// Invariant B maintenance around `clip_id`.
    fn update_clip_overlap(&mut self, clip_id: Id, remove: bool) {
        // Refresh the regions of overlaps involving the clip first.
        let ranges: Vec<(Id, (i64, i64))> =
            self.clips.iter().map(|c| (c.id(), c.range())).collect();
        for o in self.overlaps.iter_mut() {
            let (Some(f), Some(r)) = (
                ranges.iter().find(|(id, _)| *id == o.front_id()),
                ranges.iter().find(|(id, _)| *id == o.rear_id()),
            ) else {
                continue; // dropped by the plan below
            };
            o.update((f.0, f.1 .0, f.1 .1), (r.0, r.1 .0, r.1 .1));
        }

        let overlap_refs: Vec<(Id, Id, Id)> = self
            .overlaps
            .iter()
            .map(|o| (o.id(), o.front_id(), o.rear_id()))
            .collect();
        let plan = plan_overlap_update(&ranges, &overlap_refs, clip_id, remove);

        self.overlaps
            .retain(|o| !plan.drop.contains(&o.id()) && !o.is_degenerate());
        for (a, b) in plan.create {
            let ra = ranges.iter().find(|(id, _)| *id == a).unwrap().1;
            let rb = ranges.iter().find(|(id, _)| *id == b).unwrap().1;
            if !has_overlap(ra, rb) {
                continue;
            }
            let oid = self.next_overlap_id;
            self.next_overlap_id += 1;
            self.overlaps
                .push(VideoOverlap::new(oid, (a, ra.0, ra.1), (b, rb.0, rb.1)));
        }
        self.overlaps.sort_by_key(|o| o.start());
    }

    // ── Reading ──────────────────────────────────────────────────────────

    pub fn set_direction(&mut self, forward: bool) -> Result<()> {
        if self.forward == forward {
            return Ok(());
        }
        self.forward = forward;
        for clip in self.clips.iter_mut() {
            clip.set_direction(forward)?;
        }
        self.seek_to(self.read_pos_ms());
        Ok(())
    }

    /// Position every clip and the cursor at `pos_ms`.
    pub fn seek_to(&mut self, pos_ms: i64) {
        for clip in self.clips.iter_mut() {
            let _ = clip.seek_to(pos_ms - clip.start());
        }
        self.read_frames = millis_to_frame_index(pos_ms, self.out.frame_rate);
        self.refresh_cursors(pos_ms);
    }

    fn refresh_cursors(&mut self, pos_ms: i64) {
        if self.forward {
            self.read_clip_idx = self
                .clips
                .iter()
                .position(|c| pos_ms < c.end())
                .unwrap_or(self.clips.len());
            self.read_overlap_idx = self
                .overlaps
                .iter()
                .position(|o| pos_ms < o.end())
                .unwrap_or(self.overlaps.len());
        } else {
            // One past the last entry that has started (decrement-safe).
            self.read_clip_idx = self
                .clips
                .iter()
                .rposition(|c| pos_ms >= c.start())
                .map(|i| i + 1)
                .unwrap_or(0);
            self.read_overlap_idx = self
                .overlaps
                .iter()
                .rposition(|o| pos_ms >= o.start())
                .map(|i| i + 1)
                .unwrap_or(0);
        }
    }

    /// Produce the frame at the cursor and advance one frame in the play
    /// direction. Gaps yield a transparent placeholder.
    pub fn read_video_frame(
        &mut self,
        wait: bool,
        mut collect: Option<&mut Vec<CorrelativeFrame>>,
    ) -> Result<VideoFrame> {
        let pos = self.read_pos_ms();

        for clip in self.clips.iter_mut() {
            clip.notify_read_pos(pos);
        }

        let mut frame = if self.forward {
            self.read_at_forward(pos, wait, collect.as_deref_mut())?
        } else {
            self.read_at_reverse(pos, wait, collect.as_deref_mut())?
        };

        frame.timestamp = pos as f64 / 1000.0;
        if let Some(c) = collect {
            c.push(CorrelativeFrame {
                phase: Phase::AfterTransition,
                track_id: self.id,
                clip_id: cutline_core::NIL_ID,
                frame: frame.clone(),
            });
        }
        self.read_frames += if self.forward { 1 } else { -1 };
        Ok(frame)
    }

    fn read_at_forward(
        &mut self,
        pos: i64,
        wait: bool,
        collect: Option<&mut Vec<CorrelativeFrame>>,
    ) -> Result<VideoFrame> {
        while self.read_overlap_idx < self.overlaps.len()
            && self.overlaps[self.read_overlap_idx].end() <= pos
        {
            self.read_overlap_idx += 1;
        }
        if let Some(o) = self.overlaps.get(self.read_overlap_idx) {
            if o.start() <= pos {
                return self.read_from_overlap(self.read_overlap_idx, pos, wait);
            }
        }

        while self.read_clip_idx < self.clips.len() && self.clips[self.read_clip_idx].end() <= pos {
            self.read_clip_idx += 1;
        }
        if let Some(c) = self.clips.get(self.read_clip_idx) {
            if c.start() <= pos {
                let local = pos - c.start();
                let idx = self.read_clip_idx;
                let (frame, _) = self.clips[idx].read_video_frame(local, wait, collect)?;
                return Ok(frame);
            }
        }
        Ok(VideoFrame::transparent(self.out.width, self.out.height, 0.0))
    }

    fn read_at_reverse(
        &mut self,
        pos: i64,
        wait: bool,
        collect: Option<&mut Vec<CorrelativeFrame>>,
    ) -> Result<VideoFrame> {
        while self.read_overlap_idx > 0 && self.overlaps[self.read_overlap_idx - 1].start() > pos {
            self.read_overlap_idx -= 1;
        }
        if self.read_overlap_idx > 0 {
            let o = &self.overlaps[self.read_overlap_idx - 1];
            if pos < o.end() && pos >= o.start() {
                return self.read_from_overlap(self.read_overlap_idx - 1, pos, wait);
            }
        }

        while self.read_clip_idx > 0 && self.clips[self.read_clip_idx - 1].start() > pos {
            self.read_clip_idx -= 1;
        }
        if self.read_clip_idx > 0 {
            let c = &self.clips[self.read_clip_idx - 1];
            if pos < c.end() && pos >= c.start() {
                let local = pos - c.start();
                let idx = self.read_clip_idx - 1;
                let (frame, _) = self.clips[idx].read_video_frame(local, wait, collect)?;
                return Ok(frame);
            }
        }
        Ok(VideoFrame::transparent(self.out.width, self.out.height, 0.0))
    }

    fn read_from_overlap(&mut self, overlap_idx: usize, pos: i64, wait: bool) -> Result<VideoFrame> {
        let overlap = &self.overlaps[overlap_idx];
        let front_idx = self
            .clips
            .iter()
            .position(|c| c.id() == overlap.front_id())
            .ok_or_else(|| Error::Worker("overlap references a missing front clip".into()))?;
        let rear_idx = self
            .clips
            .iter()
            .position(|c| c.id() == overlap.rear_id())
            .ok_or_else(|| Error::Worker("overlap references a missing rear clip".into()))?;
        let (front, rear) = two_mut(&mut self.clips, front_idx, rear_idx);
        let (frame, _) = overlap.read_video_frame(front, rear, pos - overlap.start(), wait)?;
        Ok(frame)
    }
}
