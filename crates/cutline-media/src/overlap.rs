// crates/cutline-media/src/overlap.rs
//
// Overlaps: the derived region where two clips on one track intersect.
//
// An overlap holds the *ids* of its two clips, never references — the
// owning track resolves ids against its clip list on every use, which is
// what keeps the clip↔overlap relationship cycle-free (the track's
// coherence invariant guarantees resolution succeeds). Endpoints are never
// set directly: `update()` re-derives them from the clips' current ranges,
// and a track garbage-collects any overlap that goes degenerate.

use cutline_core::transitions::{
    AudioTransition, Crossfade, PassThrough, VideoTransition,
};
use cutline_core::{Id, SampleBlock, VideoFrame};

use crate::clip::{AudioClip, VideoClip};
use crate::error::Result;

/// Interval intersection on `[start, end)` ranges.
pub fn has_overlap(a: (i64, i64), b: (i64, i64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

// ── Video ────────────────────────────────────────────────────────────────────

pub struct VideoOverlap {
    id: Id,
    front_id: Id,
    rear_id: Id,
    start: i64,
    end: i64,
    transition: Box<dyn VideoTransition>,
}

impl VideoOverlap {
    /// Derive the overlap of two clips. `update` establishes front/rear
    /// ordering and the region immediately.
    pub(crate) fn new(id: Id, a: (Id, i64, i64), b: (Id, i64, i64)) -> Self {
        let mut o = Self {
            id,
            front_id: a.0,
            rear_id: b.0,
            start: 0,
            end: 0,
            transition: Box::new(Crossfade),
        };
        o.update((a.0, a.1, a.2), (b.0, b.1, b.2));
        o
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn front_id(&self) -> Id {
        self.front_id
    }

    pub fn rear_id(&self) -> Id {
        self.rear_id
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn range(&self) -> (i64, i64) {
        (self.start, self.end)
    }

    pub fn duration(&self) -> i64 {
        self.end - self.start
    }

    /// True once the clips no longer intersect; the owner destroys it.
    pub fn is_degenerate(&self) -> bool {
        self.end <= self.start
    }

    pub fn involves(&self, clip_id: Id) -> bool {
        self.front_id == clip_id || self.rear_id == clip_id
    }

    /// Replace the mixing rule (defaults to [`Crossfade`]).
    pub fn set_transition(&mut self, transition: Box<dyn VideoTransition>) {
        self.transition = transition;
    }

    pub(crate) fn clone_transition(&self) -> Box<dyn VideoTransition> {
        self.transition.clone()
    }

    /// Re-derive front/rear order and the region from the clips' current
    /// ranges. Degenerate intersections collapse to `start = end = 0`.
    pub(crate) fn update(&mut self, a: (Id, i64, i64), b: (Id, i64, i64)) {
        let (front, rear) = if a.1 <= b.1 { (a, b) } else { (b, a) };
        self.front_id = front.0;
        self.rear_id = rear.0;
        if front.2 <= rear.1 {
            self.start = 0;
            self.end = 0;
            return;
        }
        self.start = rear.1;
        self.end = front.2.min(rear.2);
    }

    /// Mix the two clips at overlap-local `local_ms`. A clip that yields an
    /// empty image degrades the output to the other clip alone.
    pub fn read_video_frame(
        &self,
        front: &mut VideoClip,
        rear: &mut VideoClip,
        local_ms: i64,
        wait: bool,
    ) -> Result<(VideoFrame, bool)> {
        let front_local = local_ms + self.start - front.start();
        let rear_local = local_ms + self.start - rear.start();
        let (front_img, _) = front.read_video_frame(front_local, wait, None)?;
        let (rear_img, _) = rear.read_video_frame(rear_local, wait, None)?;

        let eof = local_ms >= self.duration();
        if front_img.is_empty() {
            return Ok((rear_img, eof));
        }
        if rear_img.is_empty() {
            return Ok((front_img, eof));
        }
        let mixed = self
            .transition
            .mix(&front_img, &rear_img, local_ms, self.duration());
        Ok((mixed, eof))
    }
}

// ── Audio ────────────────────────────────────────────────────────────────────

pub struct AudioOverlap {
    id: Id,
    front_id: Id,
    rear_id: Id,
    start: i64,
    end: i64,
    transition: Box<dyn AudioTransition>,
}

impl AudioOverlap {
    pub(crate) fn new(id: Id, a: (Id, i64, i64), b: (Id, i64, i64)) -> Self {
        let mut o = Self {
            id,
            front_id: a.0,
            rear_id: b.0,
            start: 0,
            end: 0,
            transition: Box::new(PassThrough),
        };
        o.update((a.0, a.1, a.2), (b.0, b.1, b.2));
        o
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn front_id(&self) -> Id {
        self.front_id
    }

    pub fn rear_id(&self) -> Id {
        self.rear_id
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn range(&self) -> (i64, i64) {
        (self.start, self.end)
    }

    pub fn duration(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_degenerate(&self) -> bool {
        self.end <= self.start
    }

    pub fn involves(&self, clip_id: Id) -> bool {
        self.front_id == clip_id || self.rear_id == clip_id
    }

    pub fn set_transition(&mut self, transition: Box<dyn AudioTransition>) {
        self.transition = transition;
    }

    pub(crate) fn update(&mut self, a: (Id, i64, i64), b: (Id, i64, i64)) {
        let (front, rear) = if a.1 <= b.1 { (a, b) } else { (b, a) };
        self.front_id = front.0;
        self.rear_id = rear.0;
        if front.2 <= rear.1 {
            self.start = 0;
            self.end = 0;
            return;
        }
        self.start = rear.1;
        self.end = front.2.min(rear.2);
    }

    /// Read `n` samples from both clips at overlap-local `local_ms` and mix
    /// them per the transition.
    pub fn read_audio_samples(
        &self,
        front: &mut AudioClip,
        rear: &mut AudioClip,
        local_ms: i64,
        n: usize,
    ) -> Result<(SampleBlock, bool)> {
        let (front_block, _) = front.read_audio_samples(n)?;
        let (rear_block, _) = rear.read_audio_samples(n)?;
        let eof = local_ms >= self.duration();

        if front_block.is_empty() {
            return Ok((rear_block, eof));
        }
        if rear_block.is_empty() {
            return Ok((front_block, eof));
        }
        let mixed = self
            .transition
            .mix(&front_block, &rear_block, local_ms, self.duration());
        Ok((mixed, eof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_intersection() {
        assert!(has_overlap((0, 100), (50, 150)));
        assert!(has_overlap((50, 150), (0, 100)));
        assert!(!has_overlap((0, 100), (100, 200))); // touching is not overlap
        assert!(!has_overlap((0, 100), (150, 200)));
        assert!(has_overlap((0, 100), (20, 80))); // containment
    }

    #[test]
    fn update_orders_front_rear_by_start() {
        let mut o = VideoOverlap::new(1, (10, 3000, 5000), (20, 0, 5000));
        assert_eq!(o.front_id(), 20);
        assert_eq!(o.rear_id(), 10);
        assert_eq!(o.range(), (3000, 5000));

        // Move what was the rear clip in front.
        o.update((10, 0, 2000), (20, 1000, 6000));
        assert_eq!(o.front_id(), 10);
        assert_eq!(o.rear_id(), 20);
        assert_eq!(o.range(), (1000, 2000));
    }

    #[test]
    fn update_degenerates_when_disjoint() {
        let mut o = VideoOverlap::new(1, (10, 0, 1000), (20, 500, 1500));
        assert_eq!(o.range(), (500, 1000));
        o.update((10, 0, 1000), (20, 1000, 2000));
        assert!(o.is_degenerate());
        assert_eq!(o.range(), (0, 0));
    }

    #[test]
    fn overlap_end_is_min_of_ends() {
        let o = VideoOverlap::new(7, (1, 0, 5000), (2, 3000, 8000));
        assert_eq!(o.range(), (3000, 5000));
        assert_eq!(o.duration(), 2000);
    }
}
