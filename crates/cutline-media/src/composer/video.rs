// crates/cutline-media/src/composer/video.rs
//
// VideoComposer: the N-track → one-frame reducer.
//
// One mixing worker reads every track at the current frame index, blends
// bottom-to-top with alpha compositing, and pushes the result (plus the
// per-phase correlative frames) onto a bounded output queue. The consumer
// pops one unit per read; the full queue is what paces the worker.
//
// Track-list mutations (add/remove/direction) stop the worker, mutate,
// re-seek every surviving track to the current read position and restart —
// the worker never observes a half-edited track list. Seeks stay
// cooperative: a pending-seek slot the worker drains at the top of its
// iteration, snapping the position to a frame boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use cutline_core::blend::alpha_over;
use cutline_core::time::{frame_index_to_millis, millis_to_frame_index};
use cutline_core::{CorrelativeFrame, Id, Phase, VideoFrame, NIL_ID};

use crate::error::{Error, Result};
use crate::reader::VideoOutputSpec;
use crate::sysutil::spawn_named;
use crate::track::VideoTrack;

/// Bounded output cache depth, in frames.
const OUTPUT_CACHE: usize = 4;

const IDLE: Duration = Duration::from_millis(5);

/// One unit of composer output: the mixed frame, its frame index, and the
/// labelled intermediates captured while producing it.
#[derive(Clone)]
pub struct ComposedFrame {
    pub frame: VideoFrame,
    pub frame_index: i64,
    pub correlatives: Vec<CorrelativeFrame>,
}

struct Inner {
    out: Mutex<Option<VideoOutputSpec>>,
    /// Bottom→top draw order.
    tracks: Mutex<Vec<VideoTrack>>,
    queue: Mutex<VecDeque<ComposedFrame>>,
    queue_cv: Condvar,
    quit: AtomicBool,
    forward: AtomicBool,
    seek: Mutex<Option<f64>>,
    in_seeking: AtomicBool,
    read_frame_idx: AtomicI64,
    /// Consumer-requested jump the worker satisfies with per-track soft
    /// skips instead of full seeks.
    skip_to: AtomicI64,
    seeking_flash: Mutex<Option<VideoFrame>>,
    collect_correlatives: AtomicBool,
    last_error: Mutex<Option<String>>,
}

pub struct VideoComposer {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
    started: bool,
}

impl Default for VideoComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoComposer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                out: Mutex::new(None),
                tracks: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                quit: AtomicBool::new(false),
                forward: AtomicBool::new(true),
                seek: Mutex::new(None),
                in_seeking: AtomicBool::new(false),
                read_frame_idx: AtomicI64::new(0),
                skip_to: AtomicI64::new(i64::MIN),
                seeking_flash: Mutex::new(None),
                collect_correlatives: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
            worker: None,
            started: false,
        }
    }

    /// Set output geometry. Rejected once the worker has started.
    pub fn configure(&mut self, out: VideoOutputSpec) -> Result<()> {
        if self.started {
            return Err(Error::invalid("configure must precede start"));
        }
        out.validate()?;
        *self.inner.out.lock() = Some(out);
        Ok(())
    }

    pub fn output_spec(&self) -> Option<VideoOutputSpec> {
        *self.inner.out.lock()
    }

    /// Emit per-phase correlative frames with every output unit.
    pub fn set_collect_correlatives(&self, enable: bool) {
        self.inner
            .collect_correlatives
            .store(enable, Ordering::Relaxed);
    }

    pub fn start(&mut self) -> Result<()> {
        if self.inner.out.lock().is_none() {
            return Err(Error::NotConfigured);
        }
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.spawn_worker();
        Ok(())
    }

    fn spawn_worker(&mut self) {
        let inner = Arc::clone(&self.inner);
        self.worker = Some(spawn_named("vcomp-mix", move || mix_loop(inner)));
    }

    fn stop_worker(&mut self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
        self.inner.quit.store(false, Ordering::SeqCst);
    }

    /// Run a closure with the worker parked and every track re-seeked
    /// afterwards — the shape all structure mutations share.
    fn with_stopped_worker<R>(&mut self, f: impl FnOnce(&Inner) -> Result<R>) -> Result<R> {
        let was_started = self.started && self.worker.is_some();
        if was_started {
            self.stop_worker();
        }
        let result = f(&self.inner);
        let pos_ms = frame_index_to_millis(
            self.inner.read_frame_idx.load(Ordering::SeqCst),
            self.frame_rate(),
        );
        for track in self.inner.tracks.lock().iter_mut() {
            track.seek_to(pos_ms);
        }
        self.inner.queue.lock().clear();
        if was_started {
            self.spawn_worker();
        }
        result
    }

    fn frame_rate(&self) -> cutline_core::Ratio {
        self.inner
            .out
            .lock()
            .map(|o| o.frame_rate)
            .unwrap_or(cutline_core::Ratio::new(25, 1))
    }

    // ── Track management ─────────────────────────────────────────────────

    /// Add a track; `insert_after` of `None` puts it at the bottom of the
    /// draw order, otherwise directly above the named track.
    pub fn add_track(&mut self, id: Id, insert_after: Option<Id>) -> Result<()> {
        let out = self.inner.out.lock().ok_or(Error::NotConfigured)?;
        let forward = self.inner.forward.load(Ordering::SeqCst);
        self.with_stopped_worker(move |inner| {
            let mut tracks = inner.tracks.lock();
            if tracks.iter().any(|t| t.id() == id) {
                return Err(Error::invalid(format!("duplicate track id {id}")));
            }
            let mut track = VideoTrack::new(id, out)?;
            track.set_direction(forward)?;
            let idx = match insert_after {
                None => 0,
                Some(after) => {
                    tracks
                        .iter()
                        .position(|t| t.id() == after)
                        .ok_or_else(|| Error::invalid(format!("no track {after}")))?
                        + 1
                }
            };
            tracks.insert(idx, track);
            Ok(())
        })
    }

    pub fn remove_track(&mut self, id: Id) -> Result<VideoTrack> {
        self.with_stopped_worker(move |inner| {
            let mut tracks = inner.tracks.lock();
            let idx = tracks
                .iter()
                .position(|t| t.id() == id)
                .ok_or_else(|| Error::invalid(format!("no track {id}")))?;
            Ok(tracks.remove(idx))
        })
    }

    /// Reorder without disturbing the worker — draw order is read fresh
    /// each iteration.
    pub fn change_track_view_order(&mut self, target: Id, insert_after: Option<Id>) -> Result<()> {
        let mut tracks = self.inner.tracks.lock();
        let from = tracks
            .iter()
            .position(|t| t.id() == target)
            .ok_or_else(|| Error::invalid(format!("no track {target}")))?;
        let track = tracks.remove(from);
        let idx = match insert_after {
            None => 0,
            Some(after) => {
                tracks
                    .iter()
                    .position(|t| t.id() == after)
                    .ok_or_else(|| Error::invalid(format!("no track {after}")))?
                    + 1
            }
        };
        tracks.insert(idx, track);
        Ok(())
    }

    pub fn track_count(&self) -> usize {
        self.inner.tracks.lock().len()
    }

    pub fn track_ids(&self) -> Vec<Id> {
        self.inner.tracks.lock().iter().map(|t| t.id()).collect()
    }

    /// Structural edits on one track (add/move/remove clips, transitions).
    /// Runs under the track-list lock, so the worker sees the edit only at
    /// a frame boundary.
    pub fn edit_track<R>(&self, id: Id, f: impl FnOnce(&mut VideoTrack) -> R) -> Result<R> {
        let mut tracks = self.inner.tracks.lock();
        let track = tracks
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or_else(|| Error::invalid(format!("no track {id}")))?;
        Ok(f(track))
    }

    /// Longest track end, in seconds.
    pub fn duration(&self) -> f64 {
        let ms = self
            .inner
            .tracks
            .lock()
            .iter()
            .map(|t| t.duration())
            .max()
            .unwrap_or(0);
        ms as f64 / 1000.0
    }

    // ── Playback control ─────────────────────────────────────────────────

    pub fn set_direction(&mut self, forward: bool) -> Result<()> {
        if self.inner.forward.load(Ordering::SeqCst) == forward {
            return Ok(());
        }
        self.inner.forward.store(forward, Ordering::SeqCst);
        self.with_stopped_worker(move |inner| {
            for track in inner.tracks.lock().iter_mut() {
                track.set_direction(forward)?;
            }
            Ok(())
        })
    }

    pub fn is_forward(&self) -> bool {
        self.inner.forward.load(Ordering::Relaxed)
    }

    /// Queue a seek. With `async_seek` the call returns immediately;
    /// otherwise it blocks until the worker has re-positioned and produced
    /// the first frame at the new position.
    pub fn seek_to(&self, pos_secs: f64, async_seek: bool) -> Result<()> {
        if pos_secs < 0.0 {
            return Err(Error::invalid("seek position must be >= 0"));
        }
        self.inner.in_seeking.store(true, Ordering::SeqCst);
        *self.inner.seek.lock() = Some(pos_secs);
        if async_seek {
            return Ok(());
        }
        while self.inner.in_seeking.load(Ordering::SeqCst) {
            if !self.started || self.worker_dead() {
                return Err(Error::NotStarted);
            }
            std::thread::sleep(IDLE);
        }
        Ok(())
    }

    fn worker_dead(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| w.is_finished())
            .unwrap_or(true)
    }

    pub fn read_frame_index(&self) -> i64 {
        self.inner.read_frame_idx.load(Ordering::SeqCst)
    }

    /// Pop the next output unit.
    ///
    /// `precise` demands the unit's frame index equal `floor(pos * fps)`;
    /// a mismatch (mid-seek) yields the non-queued "seeking flash" preview
    /// instead. `non_blocking` returns `None` rather than waiting.
    pub fn read_video_frame(
        &self,
        pos_secs: f64,
        non_blocking: bool,
        precise: bool,
    ) -> Result<Option<ComposedFrame>> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        let fps = self.frame_rate();
        let expected = millis_to_frame_index((pos_secs * 1000.0).round() as i64, fps);

        // A jump far beyond the cache: soft-skip the worker forward.
        let produced = self.inner.read_frame_idx.load(Ordering::SeqCst);
        if (expected - produced).abs() > OUTPUT_CACHE as i64 * 2
            && !self.inner.in_seeking.load(Ordering::SeqCst)
        {
            self.inner.skip_to.store(expected, Ordering::SeqCst);
        }

        loop {
            if let Some(msg) = self.inner.last_error.lock().clone() {
                return Err(Error::Worker(msg));
            }
            let popped = {
                let mut q = self.inner.queue.lock();
                let f = q.pop_front();
                if f.is_some() {
                    self.inner.queue_cv.notify_all();
                }
                f
            };
            match popped {
                Some(unit) => {
                    if precise && unit.frame_index != expected {
                        let flash = self.inner.seeking_flash.lock().clone();
                        return Ok(flash.map(|frame| ComposedFrame {
                            frame,
                            frame_index: unit.frame_index,
                            correlatives: Vec::new(),
                        }));
                    }
                    return Ok(Some(unit));
                }
                None => {
                    if self.inner.in_seeking.load(Ordering::SeqCst) && !precise {
                        let flash = self.inner.seeking_flash.lock().clone();
                        if let Some(frame) = flash {
                            return Ok(Some(ComposedFrame {
                                frame,
                                frame_index: expected,
                                correlatives: Vec::new(),
                            }));
                        }
                    }
                    if non_blocking {
                        return Ok(None);
                    }
                    if self.worker_dead() {
                        return Err(Error::NotStarted);
                    }
                    std::thread::sleep(IDLE);
                }
            }
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// A structurally identical composer at a (possibly different) output
    /// geometry: same tracks, clips, trims and transitions, fresh readers.
    /// Reading both at the same positions yields the same timestamp
    /// sequence; pixels may differ if the interp mode differs.
    pub fn clone_with(&self, out: VideoOutputSpec) -> Result<VideoComposer> {
        out.validate()?;
        let mut dup = VideoComposer::new();
        dup.configure(out)?;

        let tracks = self.inner.tracks.lock();
        {
            let mut dup_tracks = dup.inner.tracks.lock();
            for track in tracks.iter() {
                let mut t = VideoTrack::new(track.id(), out)?;
                t.set_visible(track.is_visible());
                for clip in track.clips() {
                    let c = clip.duplicate(&out)?;
                    t.insert_clip(c)?;
                }
                for o in track.overlaps() {
                    if let Some(dst) = t.overlap_for_pair_mut(o.front_id(), o.rear_id()) {
                        dst.set_transition(o.clone_transition());
                    }
                }
                dup_tracks.push(t);
            }
        }
        dup.inner
            .forward
            .store(self.inner.forward.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(dup)
    }

    pub fn close(&mut self) {
        self.stop_worker();
        self.inner.queue.lock().clear();
        self.started = false;
    }
}

impl Drop for VideoComposer {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Mixing worker ────────────────────────────────────────────────────────────

fn mix_loop(inner: Arc<Inner>) {
    let Some(out) = *inner.out.lock() else { return };
    let fps = out.frame_rate;
    let mut after_seek = false;

    loop {
        if inner.quit.load(Ordering::Relaxed) {
            break;
        }

        // 1. Pending seek: snap to a frame boundary and re-position.
        let pending = inner.seek.lock().take();
        if let Some(pos) = pending {
            let idx = millis_to_frame_index((pos * 1000.0).round() as i64, fps);
            let snapped_ms = frame_index_to_millis(idx, fps);
            for track in inner.tracks.lock().iter_mut() {
                track.seek_to(snapped_ms);
            }
            inner.queue.lock().clear();
            inner.read_frame_idx.store(idx, Ordering::SeqCst);
            after_seek = true;
            inner.in_seeking.store(false, Ordering::SeqCst);
        }

        // 2. Consumer-requested soft skip: jump cursors without seeks.
        let skip = inner.skip_to.swap(i64::MIN, Ordering::SeqCst);
        if skip != i64::MIN {
            for track in inner.tracks.lock().iter_mut() {
                track.set_read_frame_index(skip);
            }
            inner.queue.lock().clear();
            inner.read_frame_idx.store(skip, Ordering::SeqCst);
        }

        // 3. Produce one frame if the cache has room.
        {
            let mut q = inner.queue.lock();
            while q.len() >= OUTPUT_CACHE {
                if inner.quit.load(Ordering::Relaxed)
                    || inner.seek.lock().is_some()
                    || inner.skip_to.load(Ordering::SeqCst) != i64::MIN
                {
                    break;
                }
                inner.queue_cv.wait_for(&mut q, IDLE);
            }
            if q.len() >= OUTPUT_CACHE {
                continue;
            }
        }

        let idx = inner.read_frame_idx.load(Ordering::SeqCst);
        let pos_secs = frame_index_to_millis(idx, fps) as f64 / 1000.0;
        let collect = inner.collect_correlatives.load(Ordering::Relaxed);

        let mut canvas = VideoFrame::transparent(out.width, out.height, pos_secs);
        let mut correlatives: Vec<CorrelativeFrame> = Vec::new();

        {
            let mut tracks = inner.tracks.lock();
            for track in tracks.iter_mut() {
                let mut per_track = collect.then(Vec::new);
                let frame = match track.read_video_frame(true, per_track.as_mut()) {
                    Ok(f) => f,
                    Err(e) => {
                        log::warn!("[vcomp] track {} read failed: {e}", track.id());
                        continue;
                    }
                };
                if let Some(c) = per_track {
                    correlatives.extend(c);
                }
                // Invisible tracks advance their cursor but contribute no
                // pixels.
                if track.is_visible() && !frame.is_empty() {
                    alpha_over(&mut canvas, &frame, 0, 0);
                }
            }
        }

        if collect {
            correlatives.push(CorrelativeFrame {
                phase: Phase::Mixed,
                track_id: NIL_ID,
                clip_id: NIL_ID,
                frame: canvas.clone(),
            });
        }

        let unit = ComposedFrame { frame: canvas, frame_index: idx, correlatives };

        if after_seek {
            // First frame after a seek becomes the non-queued preview used
            // by non-precise reads while the pipeline refills.
            *inner.seeking_flash.lock() = Some(unit.frame.clone());
            after_seek = false;
        }

        inner.queue.lock().push_back(unit);
        inner.queue_cv.notify_all();

        let forward = inner.forward.load(Ordering::Relaxed);
        inner
            .read_frame_idx
            .store(idx + if forward { 1 } else { -1 }, Ordering::SeqCst);
    }
}
