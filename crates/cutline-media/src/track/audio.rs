// crates/cutline-media/src/track/audio.rs
//
// AudioTrack: sample-indexed variant of the track read model.
//
// One track read assembles an exact sample range from three interior
// sources — clip, overlap, silence for gaps — walking segment boundaries
// so the cursor advances by exactly the number of samples yielded. Clip
// readers keep their own source cursors; the track re-seeks a clip only
// when the next segment doesn't line up with where that clip's reader
// already is (`aligned` map), so steady playback costs no seeks at all.

use std::collections::HashMap;
use std::sync::Arc;

use cutline_core::{Id, SampleBlock};

use crate::clip::AudioClip;
use crate::error::{Error, Result};
use crate::filter::audio_effect::AudioEffectFilter;
use crate::overlap::{has_overlap, AudioOverlap};
use crate::parser::MediaParser;
use crate::reader::AudioOutputSpec;
use crate::track::{crosses_foreign_overlap, plan_overlap_update, two_mut};

pub struct AudioTrack {
    id: Id,
    spec: AudioOutputSpec,
    clips: Vec<AudioClip>,       // sorted by start
    overlaps: Vec<AudioOverlap>, // sorted by start
    next_overlap_id: Id,
    /// Read cursor in output samples.
    read_sample: i64,
    forward: bool,
    muted: bool,
    /// Per-clip expectation of where its reader cursor sits (clip-local
    /// samples); a mismatch on the next segment triggers a re-seek.
    aligned: HashMap<Id, i64>,
    effect: AudioEffectFilter,
}

impl AudioTrack {
    pub fn new(id: Id, spec: AudioOutputSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            id,
            spec,
            clips: Vec::new(),
            overlaps: Vec::new(),
            next_overlap_id: 1,
            read_sample: 0,
            forward: true,
            muted: false,
            aligned: HashMap::new(),
            effect: AudioEffectFilter::new(spec)?,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn output_spec(&self) -> &AudioOutputSpec {
        &self.spec
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// The track-wide effects chain (volume, compressor, …).
    pub fn effect_filter_mut(&mut self) -> &mut AudioEffectFilter {
        &mut self.effect
    }

    pub fn clip_count(&self) -> usize {
        self.clips.len()
    }

    pub fn overlap_count(&self) -> usize {
        self.overlaps.len()
    }

    pub fn clip(&self, id: Id) -> Option<&AudioClip> {
        self.clips.iter().find(|c| c.id() == id)
    }

    pub fn clip_mut(&mut self, id: Id) -> Option<&mut AudioClip> {
        self.clips.iter_mut().find(|c| c.id() == id)
    }

    pub fn overlap_mut(&mut self, id: Id) -> Option<&mut AudioOverlap> {
        self.overlaps.iter_mut().find(|o| o.id() == id)
    }

    pub fn clips(&self) -> impl Iterator<Item = &AudioClip> {
        self.clips.iter()
    }

    pub fn overlaps(&self) -> impl Iterator<Item = &AudioOverlap> {
        self.overlaps.iter()
    }

    pub fn duration(&self) -> i64 {
        self.clips.iter().map(|c| c.end()).max().unwrap_or(0)
    }

    pub fn is_forward(&self) -> bool {
        self.forward
    }

    pub fn read_pos_ms(&self) -> i64 {
        self.read_sample * 1000 / self.spec.sample_rate as i64
    }

    // ── Structure ────────────────────────────────────────────────────────

    pub fn add_new_clip(
        &mut self,
        id: Id,
        parser: Arc<MediaParser>,
        start: i64,
        start_offset: i64,
        end_offset: i64,
    ) -> Result<Id> {
        let clip = AudioClip::new(id, parser, self.spec, start, start_offset, end_offset)?;
        self.insert_clip(clip)
    }

    pub fn insert_clip(&mut self, mut clip: AudioClip) -> Result<Id> {
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

    pub fn change_clip_range(&mut self, id: Id, start_offset: i64, end_offset: i64) -> Result<()> {
        let clip = self
            .clips
            .iter()
            .find(|c| c.id() == id)
            .ok_or_else(|| Error::invalid(format!("no clip {id}")))?;
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

    pub fn remove_clip(&mut self, id: Id) -> Result<AudioClip> {
        let idx = self
            .clips
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| Error::invalid(format!("no clip {id}")))?;
        let mut clip = self.clips.remove(idx);
        clip.set_track_id(cutline_core::NIL_ID);
        self.aligned.remove(&id);
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

    fn update_clip_overlap(&mut self, clip_id: Id, remove: bool) {
        let ranges: Vec<(Id, (i64, i64))> =
            self.clips.iter().map(|c| (c.id(), c.range())).collect();
        for o in self.overlaps.iter_mut() {
            let (Some(f), Some(r)) = (
                ranges.iter().find(|(id, _)| *id == o.front_id()),
                ranges.iter().find(|(id, _)| *id == o.rear_id()),
            ) else {
                continue;
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
                .push(AudioOverlap::new(oid, (a, ra.0, ra.1), (b, rb.0, rb.1)));
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
        self.aligned.clear();
        Ok(())
    }

    pub fn seek_to(&mut self, pos_ms: i64) {
        for clip in self.clips.iter_mut() {
            let _ = clip.seek_to(pos_ms - clip.start());
        }
        self.read_sample = pos_ms * self.spec.sample_rate as i64 / 1000;
        self.aligned.clear();
    }

    fn ms_to_sample(&self, ms: i64) -> i64 {
        ms * self.spec.sample_rate as i64 / 1000
    }

    /// Read exactly `n` samples from the cursor (forward: `[cursor,
    /// cursor+n)`, reverse: `[cursor-n, cursor)`), silence-filled across
    /// gaps, then run the track's effects chain.
    pub fn read_audio_samples(&mut self, n: usize) -> Result<SampleBlock> {
        let rate = self.spec.sample_rate as i64;
        let pos_ms = self.read_pos_ms();
        for clip in self.clips.iter_mut() {
            clip.notify_read_pos(pos_ms);
        }
        let (range_lo, range_hi) = if self.forward {
            (self.read_sample, self.read_sample + n as i64)
        } else {
            (self.read_sample - n as i64, self.read_sample)
        };

        let mut out = SampleBlock::silence(
            n,
            self.spec.channels,
            self.spec.sample_rate,
            range_lo.max(0) as f64 / rate as f64,
        );

        // Walk segments; in reverse mode highest-first so each clip's
        // reader cursor marches monotonically downward.
        let mut segments = self.plan_segments(range_lo.max(0), range_hi.max(0));
        if !self.forward {
            segments.reverse();
        }

        for seg in segments {
            let count = (seg.hi - seg.lo) as usize;
            let dst_off = ((seg.lo - range_lo) as usize) * self.spec.channels as usize;
            match seg.source {
                SegmentSource::Silence => {}
                SegmentSource::Clip(idx) => {
                    let clip_start = self.ms_to_sample(self.clips[idx].start());
                    let local = if self.forward { seg.lo } else { seg.hi } - clip_start;
                    self.align_clip(idx, local)?;
                    let (block, _) = self.clips[idx].read_audio_samples(count)?;
                    let len = block.data.len().min(count * self.spec.channels as usize);
                    out.data[dst_off..dst_off + len].copy_from_slice(&block.data[..len]);
                    let cid = self.clips[idx].id();
                    let next = if self.forward { seg.hi } else { seg.lo } - clip_start;
                    self.aligned.insert(cid, next);
                }
                SegmentSource::Overlap(oi) => {
                    let (front_id, rear_id, overlap_start_ms) = {
                        let o = &self.overlaps[oi];
                        (o.front_id(), o.rear_id(), o.start())
                    };
                    let fi = self
                        .clips
                        .iter()
                        .position(|c| c.id() == front_id)
                        .ok_or_else(|| Error::Worker("overlap lost its front clip".into()))?;
                    let ri = self
                        .clips
                        .iter()
                        .position(|c| c.id() == rear_id)
                        .ok_or_else(|| Error::Worker("overlap lost its rear clip".into()))?;

                    for idx in [fi, ri] {
                        let clip_start = self.ms_to_sample(self.clips[idx].start());
                        let local = if self.forward { seg.lo } else { seg.hi } - clip_start;
                        self.align_clip(idx, local)?;
                    }

                    let local_ms =
                        (if self.forward { seg.lo } else { seg.hi } * 1000 / rate) - overlap_start_ms;
                    let overlap = &self.overlaps[oi];
                    let (front, rear) = two_mut(&mut self.clips, fi, ri);
                    let (block, _) =
                        overlap.read_audio_samples(front, rear, local_ms.max(0), count)?;
                    let len = block.data.len().min(count * self.spec.channels as usize);
                    out.data[dst_off..dst_off + len].copy_from_slice(&block.data[..len]);

                    for idx in [fi, ri] {
                        let cid = self.clips[idx].id();
                        let clip_start = self.ms_to_sample(self.clips[idx].start());
                        let next = if self.forward { seg.hi } else { seg.lo } - clip_start;
                        self.aligned.insert(cid, next);
                    }
                }
            }
        }

        self.read_sample = if self.forward { range_hi } else { range_lo };

        let mut processed = self.effect.apply(&out)?;
        if processed.is_empty() {
            // A fresh effect graph may withhold its first block while
            // priming; the composer expects a full block every call.
            processed = out;
        }
        if self.muted {
            processed.scale(0.0);
        }
        Ok(processed)
    }

    fn align_clip(&mut self, idx: usize, local_sample: i64) -> Result<()> {
        let cid = self.clips[idx].id();
        if self.aligned.get(&cid) == Some(&local_sample) {
            return Ok(());
        }
        self.clips[idx].seek_to_sample(local_sample)?;
        self.aligned.insert(cid, local_sample);
        Ok(())
    }

    /// Split `[lo, hi)` (samples) into homogeneous segments.
    fn plan_segments(&self, lo: i64, hi: i64) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut pos = lo;
        while pos < hi {
            let pos_ms = pos * 1000 / self.spec.sample_rate as i64;

            // Active overlap wins.
            if let Some((oi, o)) = self
                .overlaps
                .iter()
                .enumerate()
                .find(|(_, o)| o.start() <= pos_ms && pos_ms < o.end())
            {
                let seg_hi = hi.min(self.ms_to_sample(o.end()));
                segments.push(Segment { lo: pos, hi: seg_hi, source: SegmentSource::Overlap(oi) });
                pos = seg_hi;
                continue;
            }

            // Then an active clip, clipped at the next overlap boundary.
            if let Some((ci, c)) = self
                .clips
                .iter()
                .enumerate()
                .find(|(_, c)| c.start() <= pos_ms && pos_ms < c.end())
            {
                let mut seg_hi = hi.min(self.ms_to_sample(c.end()));
                if let Some(o) = self
                    .overlaps
                    .iter()
                    .filter(|o| o.start() > pos_ms)
                    .min_by_key(|o| o.start())
                {
                    seg_hi = seg_hi.min(self.ms_to_sample(o.start()));
                }
                if seg_hi <= pos {
                    seg_hi = pos + 1; // rounding guard
                }
                segments.push(Segment { lo: pos, hi: seg_hi, source: SegmentSource::Clip(ci) });
                pos = seg_hi;
                continue;
            }

            // Gap: silence up to the next clip start.
            let mut seg_hi = hi;
            if let Some(next_start) = self
                .clips
                .iter()
                .map(|c| c.start())
                .filter(|&s| s > pos_ms)
                .min()
            {
                seg_hi = seg_hi.min(self.ms_to_sample(next_start).max(pos + 1));
            }
            segments.push(Segment { lo: pos, hi: seg_hi, source: SegmentSource::Silence });
            pos = seg_hi;
        }
        segments
    }
}

struct Segment {
    lo: i64,
    hi: i64,
    source: SegmentSource,
}

enum SegmentSource {
    Silence,
    Clip(usize),
    Overlap(usize),
}
