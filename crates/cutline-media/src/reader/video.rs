// crates/cutline-media/src/reader/video.rs
//
// VideoReader: the three-stage decode pipeline behind every video clip.
//
//   demux thread  --(packets)->  decode thread  --(frames)->  convert thread
//                                                                  |
//                                              pts-sorted queue with RGBA images
//
// The demux thread owns the format context, the decode thread owns the
// decoder, the convert thread owns the scaler — no FFmpeg handle is ever
// shared between threads. Coordination happens through two queues and a
// handful of atomics; every loop checks `quit` at the top of each iteration
// and seeks are cooperative flags, observed on the next pass.
//
// The frame queue is bounded indirectly: the decode stage blocks while the
// number of frames awaiting conversion is at the limit, or (forward mode)
// while the next frame's pts would land beyond the cache window. The cache
// window itself follows the read position, so a consumer that stops reading
// stalls the pipeline instead of growing it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use parking_lot::Mutex;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::scaling::Context as SwsContext;
use ffmpeg::util::frame::video::Video as AvVideo;

use cutline_core::time::Ratio;
use cutline_core::VideoFrame;

use crate::error::{Error, Result};
use crate::ffutil;
use crate::parser::MediaParser;
use crate::reader::{BoundedQueue, CacheWindow, Interp};
use crate::sysutil::spawn_named;

// Frames allowed to sit decoded-but-unconverted before the decode stage
// blocks. Keeps peak memory bounded to a handful of raw frames.
const MAX_PENDING_CONVERT: usize = 8;

// Default cache extents, in frames.
const DEFAULT_CACHE_AHEAD: usize = 8;
const DEFAULT_CACHE_BEHIND: usize = 2;

const IDLE: Duration = Duration::from_millis(5);
const POLL: Duration = Duration::from_millis(2);

// ── Queue types ──────────────────────────────────────────────────────────────

struct PktEntry {
    pkt: Option<ffmpeg::Packet>, // None = end of stream
    /// First packet after any seek: flush decoder buffers before sending.
    flush_decoder: bool,
    /// First packet after a *user* seek: clear the output frame queue.
    flush_output: bool,
}

struct FrameEntry {
    pts: i64,
    dur: i64,
    /// Raw decoded frame awaiting conversion; taken by the convert thread.
    raw: Option<AvVideo>,
    /// Converted RGBA image, present once conversion lands.
    image: Option<VideoFrame>,
    eof: bool,
}

/// Strictly pts-sorted list of decoded frames. The sentinel EOF entry sorts
/// last (`pts = i64::MAX`).
#[derive(Default)]
struct FrameList {
    entries: Vec<FrameEntry>,
}

impl FrameList {
    /// Insert sorted; duplicate pts are discarded.
    fn insert(&mut self, entry: FrameEntry) -> bool {
        match self.entries.binary_search_by_key(&entry.pts, |e| e.pts) {
            Ok(_) => false,
            Err(idx) => {
                self.entries.insert(idx, entry);
                true
            }
        }
    }

    /// Entry whose `[pts, pts + dur)` contains `target`.
    fn find(&self, target: i64) -> Option<&FrameEntry> {
        let idx = match self.entries.binary_search_by_key(&target, |e| e.pts) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let e = &self.entries[idx];
        if e.eof || target < e.pts + e.dur {
            Some(e)
        } else {
            // Target falls in a gap before the next entry; the first frame
            // past it is still the best answer if one exists.
            self.entries.get(idx + 1)
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct Shared {
    parser: Arc<MediaParser>,
    stream_index: usize,
    time_base: Ratio,
    start_pts: i64,
    duration: f64,
    frame_interval_pts: i64,

    out: Mutex<Option<OutSpec>>,
    quit: AtomicBool,
    forward: AtomicBool,
    seek_pending: AtomicBool,
    seek_target: AtomicI64,
    read_pts: AtomicI64,
    cache: Mutex<(usize, usize)>, // (ahead, behind) in frames
    use_hw: AtomicBool,

    pkts: BoundedQueue<PktEntry>,
    frames: Mutex<FrameList>,
    pending_convert: AtomicI64,
    demux_eof: AtomicBool,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone, Copy)]
struct OutSpec {
    width: u32,
    height: u32,
    interp: Interp,
}

impl Shared {
    fn window(&self) -> CacheWindow {
        let (ahead, behind) = *self.cache.lock();
        CacheWindow::compute(
            self.read_pts.load(Ordering::Relaxed),
            ahead,
            behind,
            self.frame_interval_pts,
            self.forward.load(Ordering::Relaxed),
        )
    }

    fn park_error(&self, context: &str, err: anyhow::Error) {
        log::error!("[vrdr] {context}: {err:#}");
        *self.last_error.lock() = Some(format!("{context}: {err:#}"));
    }

    fn request_seek(&self, target_pts: i64) {
        self.seek_target.store(target_pts, Ordering::SeqCst);
        self.seek_pending.store(true, Ordering::SeqCst);
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct VideoReader {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
    suspended: bool,
}

impl VideoReader {
    /// Probe `url` and prepare a reader on its best video stream.
    pub fn open(url: &str) -> Result<Self> {
        Self::from_parser(MediaParser::open(url)?)
    }

    /// Build a reader from an already-probed parser.
    pub fn from_parser(parser: Arc<MediaParser>) -> Result<Self> {
        let stream_index = parser.video_stream_index().ok_or(Error::NotOpened)?;
        let stream = parser.video_stream_info().ok_or(Error::NotOpened)?;
        let tb = stream.time_base;
        let start_pts = ffutil::secs_to_pts(stream.start_time, tb);
        let rate = parser.effective_frame_rate();
        let frame_interval_pts = if rate.is_valid() {
            ffutil::secs_to_pts(rate.den as f64 / rate.num as f64, tb).max(1)
        } else {
            1
        };

        let duration = stream.duration.max(parser.duration());
        let shared = Arc::new(Shared {
            duration,
            parser,
            stream_index,
            time_base: tb,
            start_pts,
            frame_interval_pts,
            out: Mutex::new(None),
            quit: AtomicBool::new(false),
            forward: AtomicBool::new(true),
            seek_pending: AtomicBool::new(false),
            seek_target: AtomicI64::new(start_pts),
            read_pts: AtomicI64::new(start_pts),
            cache: Mutex::new((DEFAULT_CACHE_AHEAD, DEFAULT_CACHE_BEHIND)),
            use_hw: AtomicBool::new(true),
            pkts: BoundedQueue::new(64),
            frames: Mutex::new(FrameList::default()),
            pending_convert: AtomicI64::new(0),
            demux_eof: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });

        Ok(Self { shared, threads: Vec::new(), started: false, suspended: false })
    }

    /// Set the output image geometry. Must precede [`start`](Self::start).
    pub fn configure(&mut self, out_w: u32, out_h: u32, interp: Interp) -> Result<()> {
        if self.started {
            return Err(Error::invalid("configure must precede start"));
        }
        if out_w == 0 || out_h == 0 {
            return Err(Error::invalid("output size must be non-zero"));
        }
        *self.shared.out.lock() = Some(OutSpec { width: out_w, height: out_h, interp });
        Ok(())
    }

    /// Opt out of hardware decoding (on by default; failures fall back to
    /// software silently either way).
    pub fn enable_hw_decode(&self, enable: bool) {
        self.shared.use_hw.store(enable, Ordering::Relaxed);
    }

    /// Launch the pipeline. With `suspended = true` the reader keeps its
    /// arrangement state but owns no decoder until [`wake_up`](Self::wake_up).
    pub fn start(&mut self, suspended: bool) -> Result<()> {
        if self.shared.out.lock().is_none() {
            return Err(Error::NotConfigured);
        }
        if self.started {
            return Ok(());
        }
        self.started = true;
        if suspended {
            self.suspended = true;
            return Ok(());
        }
        self.spawn_workers();
        Ok(())
    }

    /// Queue a seek and return immediately; the demux thread observes the
    /// flag at the top of its next iteration.
    pub fn seek_to(&self, seconds: f64) -> Result<()> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        let target = ffutil::secs_to_pts(seconds, self.shared.time_base) + self.shared.start_pts;
        self.shared.read_pts.store(target, Ordering::SeqCst);
        self.shared.request_seek(target);
        Ok(())
    }

    /// Atomic direction switch; re-seeks in place to the current position.
    pub fn set_direction(&self, forward: bool) -> Result<()> {
        if self.shared.forward.swap(forward, Ordering::SeqCst) != forward {
            let pos = self.shared.read_pts.load(Ordering::SeqCst);
            self.shared.request_seek(pos);
        }
        Ok(())
    }

    pub fn is_forward(&self) -> bool {
        self.shared.forward.load(Ordering::Relaxed)
    }

    /// Free the decoder and format context, retaining the read position,
    /// direction and cache configuration.
    pub fn suspend(&mut self) {
        if !self.started || self.suspended {
            return;
        }
        self.join_workers();
        self.shared.pkts.clear();
        self.shared.frames.lock().entries.clear();
        self.shared.pending_convert.store(0, Ordering::SeqCst);
        self.suspended = true;
        log::debug!("[vrdr] suspended '{}'", self.shared.parser.url());
    }

    /// Re-open at the last known read position.
    pub fn wake_up(&mut self) {
        if !self.started || !self.suspended {
            return;
        }
        self.suspended = false;
        self.shared.quit.store(false, Ordering::SeqCst);
        self.shared
            .request_seek(self.shared.read_pts.load(Ordering::SeqCst));
        self.spawn_workers();
        log::debug!("[vrdr] woke '{}'", self.shared.parser.url());
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// How much material around the read position stays decoded.
    pub fn set_cache_duration(&self, forward_s: f64, backward_s: f64) -> Result<()> {
        if forward_s < 0.0 || backward_s < 0.0 {
            return Err(Error::invalid("cache durations must be >= 0"));
        }
        let iv = ffutil::pts_to_secs(self.shared.frame_interval_pts, self.shared.time_base);
        let ahead = ((forward_s / iv).ceil() as usize).max(1);
        let behind = ((backward_s / iv).ceil() as usize).max(1);
        *self.shared.cache.lock() = (ahead, behind);
        Ok(())
    }

    pub fn duration(&self) -> f64 {
        self.shared.duration
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Return the frame whose `[pts, pts + dur)` contains `pos_secs`.
    ///
    /// With `wait = false` an unconverted frame yields a provisional empty
    /// image (`eof = false`). Positions at or beyond the duration yield an
    /// empty image with `eof = true`.
    pub fn read_video_frame(&self, pos_secs: f64, wait: bool) -> Result<(VideoFrame, bool)> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        if self.suspended {
            return Err(Error::Suspended);
        }
        if pos_secs >= self.shared.duration {
            return Ok((VideoFrame::empty(pos_secs), true));
        }

        let sh = &self.shared;
        let target = ffutil::secs_to_pts(pos_secs, sh.time_base) + sh.start_pts;

        // Advance the read position; if the jump leaves the cached window,
        // the pipeline must refill from a seek.
        let prev = sh.read_pts.swap(target, Ordering::SeqCst);
        let (ahead, behind) = *sh.cache.lock();
        let prev_window = CacheWindow::compute(
            prev,
            ahead,
            behind,
            sh.frame_interval_pts,
            sh.forward.load(Ordering::Relaxed),
        );
        if !prev_window.contains(target) && !sh.seek_pending.load(Ordering::SeqCst) {
            sh.request_seek(target);
        }

        loop {
            {
                let frames = sh.frames.lock();
                if let Some(entry) = frames.find(target) {
                    if entry.eof {
                        return Ok((VideoFrame::empty(pos_secs), true));
                    }
                    if let Some(img) = &entry.image {
                        return Ok((img.clone(), false));
                    }
                    if !wait {
                        return Ok((VideoFrame::empty(pos_secs), false));
                    }
                }
            }
            if !wait {
                return Ok((VideoFrame::empty(pos_secs), false));
            }
            if sh.quit.load(Ordering::Relaxed) {
                if let Some(msg) = sh.last_error.lock().clone() {
                    return Err(Error::Worker(msg));
                }
                return Err(Error::NotStarted);
            }
            std::thread::sleep(IDLE);
        }
    }

    pub fn close(&mut self) {
        self.join_workers();
        self.shared.pkts.clear();
        self.shared.frames.lock().entries.clear();
        self.started = false;
        self.suspended = false;
    }

    // ── Worker management ────────────────────────────────────────────────

    fn spawn_workers(&mut self) {
        let sh = Arc::clone(&self.shared);
        self.threads.push(spawn_named("vrdr-demux", move || demux_loop(sh)));
        let sh = Arc::clone(&self.shared);
        self.threads.push(spawn_named("vrdr-decode", move || decode_loop(sh)));
        let sh = Arc::clone(&self.shared);
        self.threads.push(spawn_named("vrdr-convert", move || convert_loop(sh)));
    }

    fn join_workers(&mut self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.pkts.clear();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        self.shared.quit.store(false, Ordering::SeqCst);
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Demux stage ──────────────────────────────────────────────────────────────

fn demux_loop(sh: Arc<Shared>) {
    let mut ictx = match ffmpeg::format::input(&sh.parser.url().to_string()) {
        Ok(c) => c,
        Err(e) => {
            sh.park_error("open format context", anyhow!(e));
            sh.quit.store(true, Ordering::SeqCst);
            return;
        }
    };

    let mut flush_decoder = false;
    let mut flush_output = false;
    // Reverse traversal bookkeeping (stream pts).
    let mut min_pts_after_seek = i64::MAX;
    let mut last_sent_pts = i64::MIN;
    let mut bwd_limit = i64::MAX;
    let mut idle = false;

    loop {
        if sh.quit.load(Ordering::Relaxed) {
            break;
        }

        let forward = sh.forward.load(Ordering::Relaxed);

        if sh.seek_pending.swap(false, Ordering::SeqCst) {
            let target = sh.seek_target.load(Ordering::SeqCst);
            ffutil::seek_stream(&mut ictx, sh.stream_index, target, "vrdr-demux");
            sh.pkts.clear();
            sh.demux_eof.store(false, Ordering::SeqCst);
            flush_decoder = true;
            flush_output = true;
            min_pts_after_seek = i64::MAX;
            last_sent_pts = i64::MIN;
            // Reverse: read the GOP containing the target plus the behind
            // margin, then hop to earlier GOPs as the window drifts down.
            bwd_limit = if forward { i64::MAX } else { sh.window().hi };
            idle = false;
        }

        if !forward {
            // Window covered up to the limit: hop to the previous GOP, or
            // idle at beginning-of-stream / window satisfied.
            if last_sent_pts >= bwd_limit {
                let window_lo = sh.window().lo;
                if min_pts_after_seek > window_lo && min_pts_after_seek > sh.start_pts {
                    let hop_target = min_pts_after_seek - 1;
                    ffutil::seek_stream(&mut ictx, sh.stream_index, hop_target, "vrdr-demux(rev)");
                    bwd_limit = min_pts_after_seek;
                    min_pts_after_seek = i64::MAX;
                    last_sent_pts = i64::MIN;
                    flush_decoder = true;
                    idle = false;
                } else {
                    idle = true;
                }
            }
        }

        if idle || sh.demux_eof.load(Ordering::Relaxed) {
            std::thread::sleep(IDLE);
            // Reverse mode wakes when the window's low edge drops below
            // what we've already covered.
            if !forward && min_pts_after_seek != i64::MAX && sh.window().lo < min_pts_after_seek {
                idle = false;
                last_sent_pts = bwd_limit; // force a hop next pass
            }
            continue;
        }

        match ictx.packets().next() {
            Some(Ok((stream, packet))) => {
                if stream.index() != sh.stream_index {
                    continue;
                }
                let pts = packet.pts().or_else(|| packet.dts()).unwrap_or(last_sent_pts);
                if pts < min_pts_after_seek {
                    min_pts_after_seek = pts;
                }
                if !forward && pts > bwd_limit {
                    // Past the reverse window: drop and mark covered.
                    last_sent_pts = pts;
                    continue;
                }
                last_sent_pts = pts;
                let entry = PktEntry {
                    pkt: Some(packet),
                    flush_decoder: std::mem::take(&mut flush_decoder),
                    flush_output: std::mem::take(&mut flush_output),
                };
                let quit = &sh.quit;
                let pending = &sh.seek_pending;
                sh.pkts.push(entry, || {
                    quit.load(Ordering::Relaxed) || pending.load(Ordering::Relaxed)
                });
            }
            Some(Err(e)) => {
                log::warn!("[vrdr] demux read error (skipped): {e}");
            }
            None => {
                sh.demux_eof.store(true, Ordering::SeqCst);
                let entry = PktEntry {
                    pkt: None,
                    flush_decoder: std::mem::take(&mut flush_decoder),
                    flush_output: std::mem::take(&mut flush_output),
                };
                let quit = &sh.quit;
                let pending = &sh.seek_pending;
                sh.pkts.push(entry, || {
                    quit.load(Ordering::Relaxed) || pending.load(Ordering::Relaxed)
                });
            }
        }
    }
}

// ── Decode stage ─────────────────────────────────────────────────────────────

fn open_decoder(sh: &Shared) -> anyhow::Result<ffmpeg::decoder::Video> {
    // A second context just for decoder parameters, as the demux thread
    // exclusively owns the first.
    let ictx = ffmpeg::format::input(&sh.parser.url().to_string())
        .context("open parameter context")?;
    let stream = ictx
        .stream(sh.stream_index)
        .ok_or_else(|| anyhow!("stream {} vanished", sh.stream_index))?;
    let mut ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("decoder context from parameters")?;
    if sh.use_hw.load(Ordering::Relaxed) {
        // Best-effort: failure just means software decode.
        unsafe {
            ffutil::attach_hw_device(ctx.as_mut_ptr());
        }
    }
    ctx.decoder().video().context("open video decoder")
}

fn decode_loop(sh: Arc<Shared>) {
    let mut decoder = match open_decoder(&sh) {
        Ok(d) => d,
        Err(e) => {
            sh.park_error("open decoder", e);
            sh.quit.store(true, Ordering::SeqCst);
            return;
        }
    };

    let mut last_pts = i64::MIN;

    loop {
        if sh.quit.load(Ordering::Relaxed) {
            break;
        }

        let Some(entry) = sh.pkts.pop(IDLE) else { continue };

        if entry.flush_decoder {
            decoder.flush();
            last_pts = i64::MIN;
        }
        if entry.flush_output {
            let mut frames = sh.frames.lock();
            frames.entries.clear();
            sh.pending_convert.store(0, Ordering::SeqCst);
        }

        match &entry.pkt {
            Some(pkt) => {
                if let Err(e) = decoder.send_packet(pkt) {
                    // Single-packet failures (bitstream damage) are skipped.
                    log::warn!("[vrdr] send_packet failed (skipped): {e}");
                    continue;
                }
            }
            None => {
                let _ = decoder.send_eof();
            }
        }

        let mut frame = AvVideo::empty();
        while decoder.receive_frame(&mut frame).is_ok() {
            let pts = frame.pts().unwrap_or(last_pts + sh.frame_interval_pts);
            last_pts = pts;

            // Backpressure: cap the unconverted backlog and, in forward
            // mode, don't decode past the cache window's leading edge.
            loop {
                if sh.quit.load(Ordering::Relaxed) || sh.seek_pending.load(Ordering::Relaxed) {
                    break;
                }
                let backlog = sh.pending_convert.load(Ordering::Relaxed) as usize;
                let beyond = sh.forward.load(Ordering::Relaxed)
                    && pts > sh.window().hi + sh.frame_interval_pts;
                if backlog < MAX_PENDING_CONVERT && !beyond {
                    break;
                }
                std::thread::sleep(POLL);
            }
            if sh.quit.load(Ordering::Relaxed) || sh.seek_pending.load(Ordering::Relaxed) {
                break;
            }

            let inserted = sh.frames.lock().insert(FrameEntry {
                pts,
                dur: sh.frame_interval_pts,
                raw: Some(frame.clone()),
                image: None,
                eof: false,
            });
            if inserted {
                sh.pending_convert.fetch_add(1, Ordering::SeqCst);
            } else {
                log::warn!("[vrdr] duplicate frame pts {pts} discarded");
            }
            frame = AvVideo::empty();
        }

        if entry.pkt.is_none() {
            // Decoder drained: append the sentinel so reads past the last
            // frame report EOF instead of waiting forever.
            sh.frames.lock().insert(FrameEntry {
                pts: i64::MAX,
                dur: 0,
                raw: None,
                image: None,
                eof: true,
            });
        }
    }
}

// ── Convert stage ────────────────────────────────────────────────────────────

struct ScalerSlot {
    ctx: SwsContext,
    src_fmt: ffmpeg::format::Pixel,
    src_w: u32,
    src_h: u32,
}

fn convert_loop(sh: Arc<Shared>) {
    let mut scaler: Option<ScalerSlot> = None;

    loop {
        if sh.quit.load(Ordering::Relaxed) {
            break;
        }

        let window = sh.window();
        let forward = sh.forward.load(Ordering::Relaxed);

        // Prune outside the live window and pick one frame to convert.
        let picked = {
            let mut frames = sh.frames.lock();
            prune(&mut frames, &sh, window, forward);
            let mut picked = None;
            for e in frames.entries.iter_mut() {
                if e.raw.is_some() && e.image.is_none() {
                    picked = Some((e.pts, e.raw.take().unwrap()));
                    break;
                }
            }
            picked
        };

        let Some((pts, raw)) = picked else {
            std::thread::sleep(POLL);
            continue;
        };

        match convert_one(&sh, &mut scaler, &raw) {
            Ok(mut image) => {
                image.timestamp = ffutil::pts_to_secs(pts - sh.start_pts, sh.time_base);
                let mut frames = sh.frames.lock();
                if let Ok(idx) = frames.entries.binary_search_by_key(&pts, |e| e.pts) {
                    frames.entries[idx].image = Some(image);
                }
                sh.pending_convert.fetch_sub(1, Ordering::SeqCst);
            }
            Err(e) => {
                // Conversion failure drops the frame — no redo at this layer.
                log::warn!("[vrdr] convert failed at pts {pts} (dropped): {e:#}");
                let mut frames = sh.frames.lock();
                if let Ok(idx) = frames.entries.binary_search_by_key(&pts, |e| e.pts) {
                    frames.entries.remove(idx);
                }
                sh.pending_convert.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Drop frames outside the cache window. The first frame strictly beyond
/// the leading edge survives so a read slightly past the last cached
/// timestamp still gets a usable image.
fn prune(frames: &mut FrameList, sh: &Shared, window: CacheWindow, forward: bool) {
    let mut kept_leader = false;
    let mut removed = 0i64;
    frames.entries.retain(|e| {
        if e.eof {
            return true;
        }
        if window.contains(e.pts) {
            return true;
        }
        let beyond_leading = if forward { e.pts > window.hi } else { e.pts < window.lo };
        if beyond_leading && !kept_leader {
            kept_leader = true;
            return true;
        }
        if e.raw.is_some() {
            removed += 1;
        }
        false
    });
    if removed > 0 {
        sh.pending_convert.fetch_sub(removed, Ordering::SeqCst);
    }
    if !forward {
        // Reverse playback consumes decreasing pts; the "first beyond"
        // retain pass above walked ascending, so re-check from the top.
        frames.entries.sort_by_key(|e| e.pts);
    }
}

fn convert_one(
    sh: &Shared,
    scaler: &mut Option<ScalerSlot>,
    raw: &AvVideo,
) -> anyhow::Result<VideoFrame> {
    let out = sh.out.lock().ok_or_else(|| anyhow!("reader unconfigured"))?;

    // Hardware frames come down to system memory first.
    let sw_holder;
    let src: &AvVideo = if ffutil::is_hw_frame(raw) {
        sw_holder = ffutil::transfer_hw_frame(raw)?;
        &sw_holder
    } else {
        raw
    };

    let (fmt, w, h) = (src.format(), src.width(), src.height());
    let rebuild = match scaler {
        Some(s) => s.src_fmt != fmt || s.src_w != w || s.src_h != h,
        None => true,
    };
    if rebuild {
        let ctx = SwsContext::get(
            fmt,
            w,
            h,
            ffmpeg::format::Pixel::RGBA,
            out.width,
            out.height,
            out.interp.sws_flags(),
        )
        .context("create scaler")?;
        *scaler = Some(ScalerSlot { ctx, src_fmt: fmt, src_w: w, src_h: h });
    }

    let mut rgba = AvVideo::empty();
    scaler
        .as_mut()
        .unwrap()
        .ctx
        .run(src, &mut rgba)
        .context("sws_scale")?;
    Ok(ffutil::rgba_frame_to_image(&rgba, out.width, out.height, 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pts: i64, dur: i64) -> FrameEntry {
        FrameEntry { pts, dur, raw: None, image: None, eof: false }
    }

    #[test]
    fn frame_list_insert_keeps_sorted_and_drops_dups() {
        let mut l = FrameList::default();
        assert!(l.insert(entry(40, 40)));
        assert!(l.insert(entry(0, 40)));
        assert!(l.insert(entry(80, 40)));
        assert!(!l.insert(entry(40, 40)));
        let pts: Vec<i64> = l.entries.iter().map(|e| e.pts).collect();
        assert_eq!(pts, vec![0, 40, 80]);
    }

    #[test]
    fn find_matches_containing_interval() {
        let mut l = FrameList::default();
        l.insert(entry(0, 40));
        l.insert(entry(40, 40));
        assert_eq!(l.find(0).unwrap().pts, 0);
        assert_eq!(l.find(39).unwrap().pts, 0);
        assert_eq!(l.find(40).unwrap().pts, 40);
        assert!(l.find(200).is_none());
    }

    #[test]
    fn find_bridges_gaps_with_next_frame() {
        let mut l = FrameList::default();
        l.insert(entry(0, 40));
        l.insert(entry(120, 40)); // gap between 40 and 120
        assert_eq!(l.find(80).unwrap().pts, 120);
    }

    #[test]
    fn find_before_first_frame_is_none() {
        let mut l = FrameList::default();
        l.insert(entry(100, 40));
        assert!(l.find(50).is_none());
    }

    #[test]
    fn eof_sentinel_matches_past_end() {
        let mut l = FrameList::default();
        l.insert(entry(0, 40));
        l.insert(FrameEntry { pts: i64::MAX, dur: 0, raw: None, image: None, eof: true });
        let found = l.find(1000).unwrap();
        assert!(found.eof);
    }
}
