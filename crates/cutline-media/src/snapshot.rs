// crates/cutline-media/src/snapshot.rs
//
// SnapshotGenerator: the sparse-frame thumbnail service over one video.
//
// A viewer exposes a window `[window_pos, window_pos + window_size]` split
// into `frame_count` slots; the generator keeps `cache_factor` windows'
// worth of slots decoded around it. Work is organised into GopTasks — one
// per key-frame range — so a slot is produced by exactly one seek and a
// bounded forward read.
//
// Four workers per generator:
//   snap-demux  — picks the neediest task (in-view first, then nearest),
//                 seeks once, reads the GOP, scores candidate packets
//   snap-dec    — decodes task packet queues, delivers frames that improve
//                 a candidate's bias to every task that wants them
//   snap-conv   — converts delivered frames to thumbnail RGBA images;
//                 a failed conversion flags the task for redo
//   snap-free   — destroys cancelled tasks off the critical threads
//
// `get_snapshots` never blocks: it returns whatever the cache holds, blank
// slots included.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::scaling::Context as SwsContext;
use ffmpeg::util::frame::video::Video as AvVideo;

use cutline_core::time::Ratio;
use cutline_core::VideoFrame;

use crate::error::{Error, Result};
use crate::ffutil;
use crate::parser::MediaParser;
use crate::sysutil::spawn_named;

const IDLE: Duration = Duration::from_millis(5);

/// Demux reads this far past a task's upper seek point before declaring
/// the GOP covered (frames may trail their packets slightly).
const GOP_TAIL_MS: i64 = 200;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub struct SnapshotConfig {
    /// Seconds of timeline one viewer window spans.
    pub window_size_secs: f64,
    /// Slots per window.
    pub frame_count: u32,
    /// Multiple of the window kept decoded around it (≥ 1).
    pub cache_factor: f64,
    /// Thumbnail height in pixels; width follows the source aspect.
    pub snapshot_height: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            window_size_secs: 6.0,
            frame_count: 12,
            cache_factor: 10.0,
            snapshot_height: 120,
        }
    }
}

impl SnapshotConfig {
    fn validate(&self) -> Result<()> {
        if self.window_size_secs <= 0.0 {
            return Err(Error::invalid("window size must be > 0"));
        }
        if self.frame_count == 0 {
            return Err(Error::invalid("frame count must be > 0"));
        }
        if self.cache_factor < 1.0 {
            return Err(Error::invalid("cache factor must be >= 1"));
        }
        if self.snapshot_height == 0 {
            return Err(Error::invalid("snapshot height must be > 0"));
        }
        Ok(())
    }
}

/// One slot's result: a blank image until the decode lands.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub ss_idx: i64,
    pub timestamp_ms: i64,
    pub image: VideoFrame,
}

// ── Window / interval arithmetic (pure) ──────────────────────────────────────

/// Slot interval in ms: the window split into `frame_count` slots, never
/// finer than the video's own frame interval.
pub(crate) fn ss_interval_ms(cfg: &SnapshotConfig, frame_interval_ms: i64) -> f64 {
    (cfg.window_size_secs * 1000.0 / cfg.frame_count as f64).max(frame_interval_ms as f64)
}

/// Highest slot index for a video of `duration_ms`.
pub(crate) fn max_ss_idx(duration_ms: i64, frame_interval_ms: i64, interval_ms: f64) -> i64 {
    (((duration_ms - frame_interval_ms) as f64) / interval_ms).floor().max(0.0) as i64
}

/// A viewer's view and cache extents, in slot indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SnapWindow {
    pub view_idx: [i64; 2],
    pub cache_idx: [i64; 2],
}

pub(crate) fn snap_window(
    window_pos_secs: f64,
    cfg: &SnapshotConfig,
    interval_ms: f64,
    max_idx: i64,
) -> SnapWindow {
    let pos_ms = window_pos_secs * 1000.0;
    let view0 = ((pos_ms / interval_ms).floor() as i64).clamp(0, max_idx);
    let view1 = (((pos_ms + cfg.window_size_secs * 1000.0) / interval_ms).floor() as i64)
        .clamp(0, max_idx);

    let max_cache = (cfg.frame_count as f64 * cfg.cache_factor).ceil() as i64;
    let prev_cache = (max_cache - cfg.frame_count as i64) / 2;
    let cache0 = (view0 - prev_cache).max(0);
    let cache1 = (cache0 + max_cache - 1).min(max_idx);

    SnapWindow { view_idx: [view0, view1], cache_idx: [cache0, cache1] }
}

/// A GopTask's identity and coverage. Two ranges are the same task iff
/// their `seek_pts` pairs are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TaskRange {
    pub seek_pts: [i64; 2],
    pub ss_idx: [i64; 2],
    pub in_view: bool,
    pub distance_to_view: i64,
}

/// The key-frame pair bracketing slot `idx`: the largest key frame at or
/// before `ss_pts(idx) - frame_interval/2`, and the next one (or the
/// `i64::MAX` open end).
pub(crate) fn seek_points_for_idx(
    idx: i64,
    keyframes: &[i64],
    interval_pts: f64,
    frame_interval_pts: i64,
    start_pts: i64,
) -> (i64, i64) {
    let ss_pts = (idx as f64 * interval_pts).round() as i64 + start_pts;
    let target = ss_pts - frame_interval_pts / 2;
    let pos = keyframes.partition_point(|&kf| kf <= target);
    let lo = if pos == 0 { keyframes.first().copied().unwrap_or(start_pts) } else { keyframes[pos - 1] };
    let hi = keyframes
        .iter()
        .find(|&&kf| kf > lo)
        .copied()
        .unwrap_or(i64::MAX);
    (lo, hi)
}

/// Group the cache span of `window` into one range per key-frame pair.
pub(crate) fn build_ranges(
    window: &SnapWindow,
    keyframes: &[i64],
    interval_pts: f64,
    frame_interval_pts: i64,
    start_pts: i64,
) -> Vec<TaskRange> {
    let mut ranges: Vec<TaskRange> = Vec::new();
    for idx in window.cache_idx[0]..=window.cache_idx[1] {
        let seek = seek_points_for_idx(idx, keyframes, interval_pts, frame_interval_pts, start_pts);
        match ranges.last_mut() {
            Some(last) if last.seek_pts == [seek.0, seek.1] => {
                last.ss_idx[1] = idx;
            }
            _ => ranges.push(TaskRange {
                seek_pts: [seek.0, seek.1],
                ss_idx: [idx, idx],
                in_view: false,
                distance_to_view: 0,
            }),
        }
    }
    for r in ranges.iter_mut() {
        r.in_view = r.ss_idx[0] <= window.view_idx[1] && window.view_idx[0] <= r.ss_idx[1];
        r.distance_to_view = if r.in_view {
            0
        } else if r.ss_idx[1] < window.view_idx[0] {
            window.view_idx[0] - r.ss_idx[1]
        } else {
            r.ss_idx[0] - window.view_idx[1]
        };
    }
    ranges
}

/// Union of every viewer's ranges, deduplicated by seek-pts pair;
/// `in_view` ORs, distance takes the minimum.
pub(crate) fn aggregate_ranges(per_viewer: impl IntoIterator<Item = Vec<TaskRange>>) -> Vec<TaskRange> {
    let mut merged: Vec<TaskRange> = Vec::new();
    for ranges in per_viewer {
        for r in ranges {
            match merged.iter_mut().find(|m| m.seek_pts == r.seek_pts) {
                Some(m) => {
                    if m.ss_idx != r.ss_idx {
                        // Same GOP claimed with different slot spans is a
                        // bookkeeping bug upstream; keep the wider claim.
                        log::warn!(
                            "[snap] range mismatch on seek_pts {:?}: {:?} vs {:?}",
                            m.seek_pts, m.ss_idx, r.ss_idx
                        );
                        m.ss_idx[0] = m.ss_idx[0].min(r.ss_idx[0]);
                        m.ss_idx[1] = m.ss_idx[1].max(r.ss_idx[1]);
                    }
                    m.in_view |= r.in_view;
                    m.distance_to_view = m.distance_to_view.min(r.distance_to_view);
                }
                None => merged.push(r),
            }
        }
    }
    merged
}

// ── Task state ───────────────────────────────────────────────────────────────

struct Candidate {
    target_pts: i64,
    best_bias: i64,
    delivered: bool,
}

struct GopTask {
    range: Mutex<TaskRange>,
    candidates: Mutex<BTreeMap<i64, Candidate>>,
    pkt_queue: Mutex<VecDeque<ffmpeg::Packet>>,
    pkt_backup: Mutex<Vec<ffmpeg::Packet>>,
    /// Decoded frames awaiting conversion: (pts, frame).
    frames: Mutex<Vec<(i64, AvVideo)>>,
    /// Converted thumbnails keyed by source pts.
    images: Mutex<HashMap<i64, VideoFrame>>,
    demuxing: AtomicBool,
    demux_eof: AtomicBool,
    decoding: AtomicBool,
    redo_decoding: AtomicBool,
    all_candidates_decoded: AtomicBool,
    decoder_eof: AtomicBool,
    cancel: AtomicBool,
}

impl GopTask {
    fn new(range: TaskRange, interval_pts: f64, start_pts: i64) -> Self {
        let mut candidates = BTreeMap::new();
        for idx in range.ss_idx[0]..=range.ss_idx[1] {
            candidates.insert(
                idx,
                Candidate {
                    target_pts: (idx as f64 * interval_pts).round() as i64 + start_pts,
                    best_bias: i64::MAX,
                    delivered: false,
                },
            );
        }
        Self {
            range: Mutex::new(range),
            candidates: Mutex::new(candidates),
            pkt_queue: Mutex::new(VecDeque::new()),
            pkt_backup: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            images: Mutex::new(HashMap::new()),
            demuxing: AtomicBool::new(false),
            demux_eof: AtomicBool::new(false),
            decoding: AtomicBool::new(false),
            redo_decoding: AtomicBool::new(false),
            all_candidates_decoded: AtomicBool::new(false),
            decoder_eof: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        }
    }

    /// Re-key candidates after the slot interval changed; images survive
    /// (they are keyed by pts, not slot) so covered slots need no
    /// re-decode.
    fn retarget(&self, range: TaskRange, interval_pts: f64, frame_interval_pts: i64, start_pts: i64) {
        *self.range.lock() = range;
        let images = self.images.lock();
        let mut candidates = self.candidates.lock();
        candidates.clear();
        let mut all_delivered = true;
        for idx in range.ss_idx[0]..=range.ss_idx[1] {
            let target = (idx as f64 * interval_pts).round() as i64 + start_pts;
            let best = images
                .keys()
                .map(|&pts| (pts - target).abs())
                .min()
                .unwrap_or(i64::MAX);
            let delivered = best <= frame_interval_pts / 2;
            all_delivered &= delivered;
            candidates.insert(
                idx,
                Candidate { target_pts: target, best_bias: best, delivered },
            );
        }
        if !all_delivered {
            // Re-demux the GOP for the slots the cache can't serve.
            self.demuxing.store(false, Ordering::SeqCst);
            self.demux_eof.store(false, Ordering::SeqCst);
            self.decoding.store(false, Ordering::SeqCst);
            self.all_candidates_decoded.store(false, Ordering::SeqCst);
            self.decoder_eof.store(false, Ordering::SeqCst);
        }
    }
}

// ── Generator ────────────────────────────────────────────────────────────────

struct Derived {
    cfg: SnapshotConfig,
    interval_ms: f64,
    interval_pts: f64,
    max_idx: i64,
    out_w: u32,
    out_h: u32,
}

struct GenInner {
    parser: Arc<MediaParser>,
    stream_index: usize,
    time_base: Ratio,
    start_pts: i64,
    duration_ms: i64,
    frame_interval_ms: i64,
    frame_interval_pts: i64,
    keyframes: Arc<Vec<i64>>,

    derived: Mutex<Derived>,
    viewers: Mutex<HashMap<Uuid, SnapWindow>>,
    tasks: RwLock<Vec<Arc<GopTask>>>,
    free_list: Mutex<Vec<Arc<GopTask>>>,
    quit: AtomicBool,
    last_error: Mutex<Option<String>>,
}

pub struct SnapshotGenerator {
    inner: Arc<GenInner>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
}

impl SnapshotGenerator {
    pub fn open(url: &str) -> Result<Self> {
        Self::from_parser(MediaParser::open(url)?)
    }

    pub fn from_parser(parser: Arc<MediaParser>) -> Result<Self> {
        let stream_index = parser.video_stream_index().ok_or(Error::NotOpened)?;
        let stream = parser.video_stream_info().ok_or(Error::NotOpened)?;
        let video = stream.video.clone().ok_or(Error::NotOpened)?;
        let tb = stream.time_base;
        let rate = parser.effective_frame_rate();
        let frame_interval_ms = if rate.is_valid() {
            cutline_core::time::frame_interval_millis(rate)
        } else {
            40
        };
        let frame_interval_pts = ffutil::secs_to_pts(frame_interval_ms as f64 / 1000.0, tb).max(1);
        let keyframes = parser.seek_points()?;

        let cfg = SnapshotConfig::default();
        let duration_ms = (stream.duration.max(parser.duration()) * 1000.0).round() as i64;
        let start_pts = ffutil::secs_to_pts(stream.start_time, tb);
        let interval_ms = ss_interval_ms(&cfg, frame_interval_ms);
        let interval_pts = interval_ms / 1000.0 / tb.as_f64();
        let out_h = cfg.snapshot_height;
        let out_w = thumb_width(video.width, video.height, out_h);

        let inner = Arc::new(GenInner {
            stream_index,
            time_base: tb,
            start_pts,
            duration_ms,
            frame_interval_ms,
            frame_interval_pts,
            keyframes,
            derived: Mutex::new(Derived {
                cfg,
                interval_ms,
                interval_pts,
                max_idx: max_ss_idx(duration_ms, frame_interval_ms, interval_ms),
                out_w,
                out_h,
            }),
            viewers: Mutex::new(HashMap::new()),
            tasks: RwLock::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            last_error: Mutex::new(None),
            parser,
        });
        Ok(Self { inner, threads: Vec::new(), started: false })
    }

    /// Replace the whole configuration. Live tasks are retargeted, not
    /// discarded — thumbnails already decoded at surviving pts are reused.
    pub fn configure(&self, cfg: SnapshotConfig) -> Result<()> {
        cfg.validate()?;
        let inner = &self.inner;
        {
            let mut derived = inner.derived.lock();
            let video = inner
                .parser
                .video_info()
                .ok_or(Error::NotOpened)?;
            derived.cfg = cfg;
            derived.interval_ms = ss_interval_ms(&cfg, inner.frame_interval_ms);
            derived.interval_pts = derived.interval_ms / 1000.0 / inner.time_base.as_f64();
            derived.max_idx = max_ss_idx(inner.duration_ms, inner.frame_interval_ms, derived.interval_ms);
            derived.out_h = cfg.snapshot_height;
            derived.out_w = thumb_width(video.width, video.height, cfg.snapshot_height);
        }
        refresh_tasks(inner);
        Ok(())
    }

    /// Shrink or grow the viewer window span without touching the rest of
    /// the configuration.
    pub fn set_window_size(&self, window_size_secs: f64) -> Result<()> {
        let cfg = { self.inner.derived.lock().cfg };
        self.configure(SnapshotConfig { window_size_secs, ..cfg })
    }

    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        let inner = Arc::clone(&self.inner);
        self.threads.push(spawn_named("snap-demux", move || demux_loop(inner)));
        let inner = Arc::clone(&self.inner);
        self.threads.push(spawn_named("snap-dec", move || decode_loop(inner)));
        let inner = Arc::clone(&self.inner);
        self.threads.push(spawn_named("snap-conv", move || convert_loop(inner)));
        let inner = Arc::clone(&self.inner);
        self.threads.push(spawn_named("snap-free", move || free_loop(inner)));
        Ok(())
    }

    /// Slot interval currently in effect, in milliseconds.
    pub fn ss_interval_ms(&self) -> f64 {
        self.inner.derived.lock().interval_ms
    }

    pub fn max_index(&self) -> i64 {
        self.inner.derived.lock().max_idx
    }

    pub fn duration_ms(&self) -> i64 {
        self.inner.duration_ms
    }

    pub fn create_viewer(&self) -> Viewer {
        let id = Uuid::new_v4();
        self.inner.viewers.lock().insert(
            id,
            SnapWindow { view_idx: [0, 0], cache_idx: [0, 0] },
        );
        Viewer { inner: Arc::clone(&self.inner), id }
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub fn close(&mut self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        self.inner.tasks.write().clear();
        self.inner.free_list.lock().clear();
        self.started = false;
    }
}

impl Drop for SnapshotGenerator {
    fn drop(&mut self) {
        self.close();
    }
}

fn thumb_width(src_w: u32, src_h: u32, out_h: u32) -> u32 {
    (((out_h as u64 * src_w.max(1) as u64) / src_h.max(1) as u64) as u32).max(2) & !1
}

// ── Viewer ───────────────────────────────────────────────────────────────────

/// A shared reference into the generator: each viewer contributes its own
/// window to the task aggregation, and reads whatever is cached.
pub struct Viewer {
    inner: Arc<GenInner>,
    id: Uuid,
}

impl Viewer {
    /// Move this viewer's window and return one `Snapshot` per slot.
    /// Never blocks; slots without a converted image come back blank.
    pub fn get_snapshots(&self, window_pos_secs: f64) -> Result<Vec<Snapshot>> {
        let (interval_ms, interval_pts, max_idx, cfg) = {
            let d = self.inner.derived.lock();
            (d.interval_ms, d.interval_pts, d.max_idx, d.cfg)
        };
        let window = snap_window(window_pos_secs.max(0.0), &cfg, interval_ms, max_idx);
        self.inner.viewers.lock().insert(self.id, window);
        refresh_tasks(&self.inner);

        let idx0 = window.view_idx[0];
        let idx1 = window.view_idx[1];
        let mut out: Vec<Snapshot> = (idx0..=idx1)
            .map(|idx| Snapshot {
                ss_idx: idx,
                timestamp_ms: (idx as f64 * interval_ms).round() as i64,
                image: VideoFrame::empty(0.0),
            })
            .collect();

        let half_window = (interval_pts / 2.0) as i64;
        let tasks = self.inner.tasks.read();
        for task in tasks.iter() {
            let range = *task.range.lock();
            if range.ss_idx[1] < idx0 || range.ss_idx[0] > idx1 {
                continue;
            }
            let images = task.images.lock();
            if images.is_empty() {
                continue;
            }
            for snap in out.iter_mut() {
                if snap.ss_idx < range.ss_idx[0] || snap.ss_idx > range.ss_idx[1] {
                    continue;
                }
                let target = (snap.ss_idx as f64 * interval_pts).round() as i64 + self.inner.start_pts;
                if let Some((&pts, img)) = images
                    .iter()
                    .min_by_key(|(&pts, _)| (pts - target).abs())
                {
                    let bias = (pts - target).abs();
                    if bias <= half_window.max(self.inner.frame_interval_pts) && !img.is_empty() {
                        let mut image = img.clone();
                        image.timestamp =
                            ffutil::pts_to_secs(pts - self.inner.start_pts, self.inner.time_base);
                        snap.image = image;
                    }
                }
            }
        }
        Ok(out)
    }

    /// The generator's slot interval, for host-side layout.
    pub fn ss_interval_ms(&self) -> f64 {
        self.inner.derived.lock().interval_ms
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.inner.viewers.lock().remove(&self.id);
        refresh_tasks(&self.inner);
    }
}

// ── Task aggregation ─────────────────────────────────────────────────────────

/// Rebuild the task list from the union of all viewer windows. Ranges that
/// disappeared are cancelled onto the free list; surviving tasks are
/// retargeted in place; new ranges become empty tasks.
fn refresh_tasks(inner: &GenInner) {
    let (interval_pts,) = {
        let d = inner.derived.lock();
        (d.interval_pts,)
    };
    let per_viewer: Vec<Vec<TaskRange>> = {
        let viewers = inner.viewers.lock();
        viewers
            .values()
            .map(|w| {
                build_ranges(
                    w,
                    &inner.keyframes,
                    interval_pts,
                    inner.frame_interval_pts,
                    inner.start_pts,
                )
            })
            .collect()
    };
    let wanted = aggregate_ranges(per_viewer);

    let mut tasks = inner.tasks.write();
    let mut kept: Vec<Arc<GopTask>> = Vec::with_capacity(wanted.len());
    for want in &wanted {
        match tasks
            .iter()
            .position(|t| t.range.lock().seek_pts == want.seek_pts)
        {
            Some(idx) => {
                let task = tasks.remove(idx);
                let current = *task.range.lock();
                if current.ss_idx != want.ss_idx {
                    task.retarget(*want, interval_pts, inner.frame_interval_pts, inner.start_pts);
                } else {
                    let mut r = task.range.lock();
                    r.in_view = want.in_view;
                    r.distance_to_view = want.distance_to_view;
                }
                kept.push(task);
            }
            None => kept.push(Arc::new(GopTask::new(*want, interval_pts, inner.start_pts))),
        }
    }
    // Whatever remains is no longer needed by any viewer.
    let mut free = inner.free_list.lock();
    for task in tasks.drain(..) {
        task.cancel.store(true, Ordering::SeqCst);
        free.push(task);
    }
    *tasks = kept;
}

// ── Demux worker ─────────────────────────────────────────────────────────────

fn pick_demux_task(tasks: &[Arc<GopTask>]) -> Option<Arc<GopTask>> {
    tasks
        .iter()
        .filter(|t| {
            !t.cancel.load(Ordering::Relaxed)
                && !t.demuxing.load(Ordering::Relaxed)
                && !t.demux_eof.load(Ordering::Relaxed)
        })
        .min_by_key(|t| {
            let r = t.range.lock();
            (!r.in_view, r.distance_to_view)
        })
        .cloned()
}

fn demux_loop(inner: Arc<GenInner>) {
    let mut ictx = match ffmpeg::format::input(&inner.parser.url().to_string()) {
        Ok(c) => c,
        Err(e) => {
            *inner.last_error.lock() = Some(format!("snapshot demux open: {e}"));
            return;
        }
    };

    loop {
        if inner.quit.load(Ordering::Relaxed) {
            break;
        }

        let task = {
            let tasks = inner.tasks.read();
            pick_demux_task(&tasks)
        };
        let Some(task) = task else {
            std::thread::sleep(IDLE);
            continue;
        };

        let range = *task.range.lock();
        task.demuxing.store(true, Ordering::SeqCst);

        if !ffutil::seek_stream(&mut ictx, inner.stream_index, range.seek_pts[0], "snap-demux") {
            // A GOP we cannot reach is abandoned; other tasks continue.
            log::warn!("[snap] seek to pts {} failed; task abandoned", range.seek_pts[0]);
            task.demux_eof.store(true, Ordering::SeqCst);
            task.decoder_eof.store(true, Ordering::SeqCst);
            continue;
        }

        let tail_pts = ffutil::secs_to_pts(GOP_TAIL_MS as f64 / 1000.0, inner.time_base);
        let last_target = task
            .candidates
            .lock()
            .values()
            .map(|c| c.target_pts)
            .max()
            .unwrap_or(range.seek_pts[0]);
        let (interval_pts,) = {
            let d = inner.derived.lock();
            (d.interval_pts,)
        };

        loop {
            if inner.quit.load(Ordering::Relaxed)
                || task.cancel.load(Ordering::Relaxed)
                || task.demux_eof.load(Ordering::Relaxed)
            {
                // demux_eof may have been set by the decoder once every
                // candidate was delivered — no point reading the GOP out.
                break;
            }
            let Some(next) = ictx.packets().next() else {
                task.demux_eof.store(true, Ordering::SeqCst);
                break;
            };
            let Ok((stream, packet)) = next else { continue };
            if stream.index() != inner.stream_index {
                continue;
            }
            let pts = packet.pts().or_else(|| packet.dts()).unwrap_or(0);

            // GOP end trigger: past the next key frame (plus tail) and past
            // the last slot this task still needs.
            let past_gop = range.seek_pts[1] != i64::MAX && pts >= range.seek_pts[1] + tail_pts;
            if past_gop && pts > last_target {
                task.demux_eof.store(true, Ordering::SeqCst);
                break;
            }

            // Candidate scoring: a packet close to a slot's ideal pts makes
            // that packet's frame the slot's current best.
            let rel = (pts - inner.start_pts) as f64 / interval_pts;
            let ss_idx = rel.round() as i64;
            {
                let mut candidates = task.candidates.lock();
                if let Some(c) = candidates.get_mut(&ss_idx) {
                    let bias = (pts - c.target_pts).abs();
                    if bias < c.best_bias {
                        c.best_bias = bias;
                    }
                }
            }

            task.pkt_backup.lock().push(packet.clone());
            task.pkt_queue.lock().push_back(packet);
        }
    }
}

// ── Decode worker ────────────────────────────────────────────────────────────

fn pick_decode_task(tasks: &[Arc<GopTask>]) -> Option<Arc<GopTask>> {
    tasks
        .iter()
        .filter(|t| {
            !t.cancel.load(Ordering::Relaxed)
                && t.demuxing.load(Ordering::Relaxed)
                && !t.all_candidates_decoded.load(Ordering::Relaxed)
                && (!t.decoding.load(Ordering::Relaxed)
                    || t.redo_decoding.load(Ordering::Relaxed))
                && (!t.pkt_queue.lock().is_empty()
                    || t.redo_decoding.load(Ordering::Relaxed)
                    || !t.decoder_eof.load(Ordering::Relaxed))
        })
        .min_by_key(|t| {
            let r = t.range.lock();
            (!r.in_view, r.distance_to_view)
        })
        .cloned()
}

fn open_snap_decoder(inner: &GenInner) -> anyhow::Result<ffmpeg::decoder::Video> {
    let ictx = ffmpeg::format::input(&inner.parser.url().to_string())
        .context("open parameter context")?;
    let stream = ictx
        .stream(inner.stream_index)
        .ok_or_else(|| anyhow!("stream {} vanished", inner.stream_index))?;
    let ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("decoder context")?;
    ctx.decoder().video().context("open snapshot decoder")
}

/// Deliver a decoded frame to every task that has a candidate it improves.
fn deliver_frame(inner: &GenInner, frame: &AvVideo, pts: i64) {
    let (interval_pts,) = {
        let d = inner.derived.lock();
        (d.interval_pts,)
    };
    let rel = (pts - inner.start_pts) as f64 / interval_pts;
    let ss_idx = rel.round() as i64;

    let tasks = inner.tasks.read();
    for task in tasks.iter() {
        if task.cancel.load(Ordering::Relaxed) {
            continue;
        }
        let mut improved = false;
        {
            let mut candidates = task.candidates.lock();
            if let Some(c) = candidates.get_mut(&ss_idx) {
                let bias = (pts - c.target_pts).abs();
                if !c.delivered || bias <= c.best_bias {
                    c.best_bias = bias;
                    c.delivered = true;
                    improved = true;
                }
            }
            if improved && candidates.values().all(|c| c.delivered) {
                // Everything this task wanted is decoded — stop its demux
                // and decode work.
                task.all_candidates_decoded.store(true, Ordering::SeqCst);
                task.decoder_eof.store(true, Ordering::SeqCst);
                task.demux_eof.store(true, Ordering::SeqCst);
            }
        }
        if improved {
            task.frames.lock().push((pts, frame.clone()));
        }
    }
}

fn decode_loop(inner: Arc<GenInner>) {
    let mut decoder = match open_snap_decoder(&inner) {
        Ok(d) => d,
        Err(e) => {
            *inner.last_error.lock() = Some(format!("snapshot decoder: {e:#}"));
            return;
        }
    };

    loop {
        if inner.quit.load(Ordering::Relaxed) {
            break;
        }

        let task = {
            let tasks = inner.tasks.read();
            pick_decode_task(&tasks)
        };
        let Some(task) = task else {
            std::thread::sleep(IDLE);
            continue;
        };

        // Task switch: each GOP starts at a key frame, so a plain flush
        // leaves the decoder clean for the new task.
        decoder.flush();
        task.decoding.store(true, Ordering::SeqCst);

        if task.redo_decoding.swap(false, Ordering::SeqCst) {
            // Re-feed the whole GOP from the backup queue.
            let backup = task.pkt_backup.lock();
            let mut queue = task.pkt_queue.lock();
            queue.clear();
            for pkt in backup.iter() {
                queue.push_back(pkt.clone());
            }
            task.frames.lock().clear();
        }

        loop {
            if inner.quit.load(Ordering::Relaxed) || task.cancel.load(Ordering::Relaxed) {
                break;
            }
            if task.all_candidates_decoded.load(Ordering::Relaxed) {
                break;
            }
            let pkt = task.pkt_queue.lock().pop_front();
            match pkt {
                Some(pkt) => {
                    if let Err(e) = decoder.send_packet(&pkt) {
                        log::warn!("[snap] send_packet failed (skipped): {e}");
                        continue;
                    }
                    let mut frame = AvVideo::empty();
                    while decoder.receive_frame(&mut frame).is_ok() {
                        let pts = frame.pts().unwrap_or(0);
                        deliver_frame(&inner, &frame, pts);
                        frame = AvVideo::empty();
                    }
                }
                None => {
                    if task.demux_eof.load(Ordering::Relaxed) {
                        // Drain the decoder for the GOP tail, then move on.
                        let _ = decoder.send_eof();
                        let mut frame = AvVideo::empty();
                        while decoder.receive_frame(&mut frame).is_ok() {
                            let pts = frame.pts().unwrap_or(0);
                            deliver_frame(&inner, &frame, pts);
                            frame = AvVideo::empty();
                        }
                        decoder.flush();
                        task.decoder_eof.store(true, Ordering::SeqCst);
                        break;
                    }
                    std::thread::sleep(IDLE);
                }
            }
        }
    }
}

// ── Convert worker ───────────────────────────────────────────────────────────

fn convert_loop(inner: Arc<GenInner>) {
    let mut scaler: Option<(SwsContext, ffmpeg::format::Pixel, u32, u32, u32, u32)> = None;

    loop {
        if inner.quit.load(Ordering::Relaxed) {
            break;
        }

        let work = {
            let tasks = inner.tasks.read();
            tasks
                .iter()
                .filter(|t| !t.cancel.load(Ordering::Relaxed))
                .find_map(|t| {
                    let mut frames = t.frames.lock();
                    frames.pop().map(|f| (Arc::clone(t), f))
                })
        };
        let Some((task, (pts, frame))) = work else {
            std::thread::sleep(IDLE);
            continue;
        };

        let (out_w, out_h) = {
            let d = inner.derived.lock();
            (d.out_w, d.out_h)
        };

        let converted = (|| -> anyhow::Result<VideoFrame> {
            let (fmt, w, h) = (frame.format(), frame.width(), frame.height());
            let rebuild = match &scaler {
                Some((_, sf, sw, sh, ow, oh)) => {
                    *sf != fmt || *sw != w || *sh != h || *ow != out_w || *oh != out_h
                }
                None => true,
            };
            if rebuild {
                let ctx = SwsContext::get(
                    fmt,
                    w,
                    h,
                    ffmpeg::format::Pixel::RGBA,
                    out_w,
                    out_h,
                    ffmpeg::software::scaling::Flags::FAST_BILINEAR,
                )
                .context("create snapshot scaler")?;
                scaler = Some((ctx, fmt, w, h, out_w, out_h));
            }
            let mut rgba = AvVideo::empty();
            scaler
                .as_mut()
                .unwrap()
                .0
                .run(&frame, &mut rgba)
                .context("sws_scale")?;
            Ok(ffutil::rgba_frame_to_image(&rgba, out_w, out_h, 0.0))
        })();

        match converted {
            Ok(image) => {
                task.images.lock().insert(pts, image);
            }
            Err(e) => {
                // Conversion failure → decode the GOP again from backup.
                log::warn!("[snap] convert failed at pts {pts}: {e:#}; redo scheduled");
                task.redo_decoding.store(true, Ordering::SeqCst);
                task.all_candidates_decoded.store(false, Ordering::SeqCst);
            }
        }
    }
}

// ── Free worker ──────────────────────────────────────────────────────────────

fn free_loop(inner: Arc<GenInner>) {
    loop {
        if inner.quit.load(Ordering::Relaxed) {
            break;
        }
        let doomed: Vec<Arc<GopTask>> = inner.free_list.lock().drain(..).collect();
        if doomed.is_empty() {
            std::thread::sleep(Duration::from_millis(20));
            continue;
        }
        for task in doomed {
            // Dropping here keeps image/frame destruction off the demux,
            // decode and convert threads.
            let n_imgs = task.images.lock().len();
            log::trace!("[snap] freeing cancelled task ({n_imgs} images)");
            drop(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(window: f64, count: u32, factor: f64) -> SnapshotConfig {
        SnapshotConfig {
            window_size_secs: window,
            frame_count: count,
            cache_factor: factor,
            snapshot_height: 120,
        }
    }

    #[test]
    fn interval_is_window_over_count() {
        // 6 s / 12 slots = 500 ms at 30 fps (frame interval 33 ms).
        assert_eq!(ss_interval_ms(&cfg(6.0, 12, 10.0), 33), 500.0);
    }

    #[test]
    fn interval_is_floored_at_frame_interval() {
        // Asking for slots finer than frames degrades to one per frame.
        assert_eq!(ss_interval_ms(&cfg(0.1, 100, 10.0), 40), 40.0);
    }

    #[test]
    fn doubling_window_respaces_slots() {
        assert_eq!(ss_interval_ms(&cfg(12.0, 12, 10.0), 33), 1000.0);
    }

    #[test]
    fn max_idx_for_one_minute_30fps() {
        // 60 s at 30 fps, 500 ms interval: floor((60000-33)/500) = 119.
        assert_eq!(max_ss_idx(60_000, 33, 500.0), 119);
    }

    #[test]
    fn view_window_spans_thirteen_slots() {
        // Scenario S6: window [0, 6 s] at 500 ms slots shows indices 0..=12.
        let w = snap_window(0.0, &cfg(6.0, 12, 10.0), 500.0, 119);
        assert_eq!(w.view_idx, [0, 12]);
    }

    #[test]
    fn cache_window_is_factor_times_view() {
        let c = cfg(6.0, 12, 10.0);
        let w = snap_window(30.0, &c, 500.0, 1000);
        // max_cache = 120, prev_cache = (120-12)/2 = 54.
        assert_eq!(w.view_idx, [60, 72]);
        assert_eq!(w.cache_idx, [6, 125]);
        // Cache always contains the view.
        assert!(w.cache_idx[0] <= w.view_idx[0] && w.view_idx[1] <= w.cache_idx[1]);
    }

    #[test]
    fn cache_window_clamps_at_zero() {
        let w = snap_window(0.0, &cfg(6.0, 12, 10.0), 500.0, 119);
        assert_eq!(w.cache_idx[0], 0);
        assert_eq!(w.cache_idx[1], 119);
    }

    #[test]
    fn seek_points_bracket_the_slot() {
        // Key frames every 250 pts; slot at pts 300 targets kf 250.
        let kfs = vec![0, 250, 500, 750];
        let (lo, hi) = seek_points_for_idx(3, &kfs, 100.0, 10, 0); // ss_pts = 300
        assert_eq!((lo, hi), (250, 500));
    }

    #[test]
    fn seek_points_open_end_at_last_gop() {
        let kfs = vec![0, 250];
        let (lo, hi) = seek_points_for_idx(4, &kfs, 100.0, 10, 0); // ss_pts = 400
        assert_eq!(lo, 250);
        assert_eq!(hi, i64::MAX);
    }

    #[test]
    fn ranges_group_consecutive_slots_per_gop() {
        crate::init_test_logging();
        let kfs = vec![0, 250, 500, 750];
        let w = SnapWindow { view_idx: [0, 4], cache_idx: [0, 7] };
        let ranges = build_ranges(&w, &kfs, 100.0, 10, 0);
        // Slot targets sit half a frame interval early (ss_pts - 5), so
        // kf 0 claims slots 0..=2, kf 250 slots 3..=5, kf 500 slots 6..=7.
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].ss_idx, [0, 2]);
        assert_eq!(ranges[0].seek_pts, [0, 250]);
        assert_eq!(ranges[1].ss_idx, [3, 5]);
        assert_eq!(ranges[1].seek_pts, [250, 500]);
        assert_eq!(ranges[2].ss_idx, [6, 7]);
        assert!(ranges[0].in_view && ranges[1].in_view);
        assert!(!ranges[2].in_view);
        assert_eq!(ranges[2].distance_to_view, 2);
    }

    #[test]
    fn aggregate_dedupes_by_seek_pts_and_ors_view() {
        let a = TaskRange { seek_pts: [0, 250], ss_idx: [0, 2], in_view: true, distance_to_view: 0 };
        let b = TaskRange { seek_pts: [0, 250], ss_idx: [0, 2], in_view: false, distance_to_view: 5 };
        let c = TaskRange { seek_pts: [250, 500], ss_idx: [3, 4], in_view: false, distance_to_view: 2 };
        let merged = aggregate_ranges(vec![vec![a], vec![b, c]]);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].in_view);
        assert_eq!(merged[0].distance_to_view, 0);
    }

    #[test]
    fn task_candidates_cover_the_range() {
        let r = TaskRange { seek_pts: [0, 250], ss_idx: [2, 5], in_view: true, distance_to_view: 0 };
        let task = GopTask::new(r, 100.0, 0);
        let c = task.candidates.lock();
        assert_eq!(c.len(), 4);
        assert_eq!(c.get(&2).unwrap().target_pts, 200);
        assert!(c.values().all(|c| !c.delivered && c.best_bias == i64::MAX));
    }

    #[test]
    fn retarget_marks_covered_slots_delivered() {
        let r = TaskRange { seek_pts: [0, 250], ss_idx: [0, 1], in_view: true, distance_to_view: 0 };
        let task = GopTask::new(r, 100.0, 0);
        task.images.lock().insert(200, VideoFrame::transparent(2, 2, 0.0));
        // Re-space so slot 1 targets pts 200 exactly.
        let r2 = TaskRange { seek_pts: [0, 250], ss_idx: [0, 1], in_view: true, distance_to_view: 0 };
        task.retarget(r2, 200.0, 10, 0);
        let c = task.candidates.lock();
        assert!(c.get(&1).unwrap().delivered);
        assert!(!c.get(&0).unwrap().delivered);
    }

    #[test]
    fn thumb_width_keeps_aspect_and_parity() {
        assert_eq!(thumb_width(1920, 1080, 120), 212); // 213.3 → even-floored
        assert_eq!(thumb_width(1080, 1920, 120), 66);
    }
}
