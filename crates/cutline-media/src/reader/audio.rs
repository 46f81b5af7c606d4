// crates/cutline-media/src/reader/audio.rs
//
// AudioReader: the audio variant of the three-stage pipeline.
//
//   demux thread --(packets)-> decode thread --(frames)-> convert thread
//
// The convert stage resamples into the configured output format
// (interleaved f32 at the track's channel count and rate) and files the
// result into a sample store keyed by absolute sample index. Reads assemble
// an exact `[start, start + n)` range from the store — forward playback
// walks the cursor up, reverse playback walks it down and serves each block
// in reverse block order with samples inside a block untouched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use parking_lot::Mutex;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::resampling;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AvAudio;

use cutline_core::time::Ratio;
use cutline_core::SampleBlock;

use crate::error::{Error, Result};
use crate::ffutil;
use crate::parser::MediaParser;
use crate::reader::{AudioOutputSpec, BoundedQueue};
use crate::sysutil::spawn_named;

const IDLE: Duration = Duration::from_millis(5);

// How much resampled material the store holds around the cursor, and the
// span one reverse demux window covers. Audio packets are all sync points,
// so the "GOP" here is simply a fixed slice of time.
const STORE_SPAN_SECS: f64 = 2.0;
const REVERSE_WINDOW_SECS: f64 = 1.0;

struct APktEntry {
    pkt: Option<ffmpeg::Packet>,
    flush_decoder: bool,
}

struct DecodedFrame {
    frame: AvAudio,
    pts: i64,
}

/// Resampled output samples keyed by absolute output-sample index.
#[derive(Default)]
struct SampleStore {
    blocks: BTreeMap<i64, Vec<f32>>, // start sample index → interleaved data
    channels: usize,
}

impl SampleStore {
    /// Copy `[start, start + count)` sample frames into `dst`. Returns false
    /// if any part of the range is missing (dst is left zero-filled there).
    fn assemble(&self, start: i64, count: usize, dst: &mut [f32]) -> bool {
        if self.channels == 0 {
            return false;
        }
        let ch = self.channels;
        let mut covered = 0usize;
        // Last block starting at or before `start`, then walk forward.
        let iter = self
            .blocks
            .range(..=start)
            .next_back()
            .map(|(k, _)| *k)
            .into_iter()
            .chain(self.blocks.range(start + 1..).map(|(k, _)| *k));
        for key in iter {
            let data = &self.blocks[&key];
            let block_len = (data.len() / ch) as i64;
            let lo = (start + covered as i64).max(key);
            let hi = (start + count as i64).min(key + block_len);
            if lo >= hi {
                if key > start + count as i64 {
                    break;
                }
                continue;
            }
            if lo != start + covered as i64 {
                return false; // gap
            }
            let src_off = ((lo - key) as usize) * ch;
            let dst_off = ((lo - start) as usize) * ch;
            let len = ((hi - lo) as usize) * ch;
            dst[dst_off..dst_off + len].copy_from_slice(&data[src_off..src_off + len]);
            covered += (hi - lo) as usize;
            if covered >= count {
                return true;
            }
        }
        false
    }

    /// Highest sample index present (exclusive), if any.
    fn end(&self) -> Option<i64> {
        let ch = self.channels.max(1);
        self.blocks
            .iter()
            .next_back()
            .map(|(k, v)| k + (v.len() / ch) as i64)
    }

    /// Drop blocks entirely outside `[lo, hi)`.
    fn prune(&mut self, lo: i64, hi: i64) {
        let ch = self.channels.max(1);
        self.blocks
            .retain(|k, v| *k + (v.len() / ch) as i64 > lo && *k < hi);
    }
}

struct AShared {
    parser: Arc<MediaParser>,
    stream_index: usize,
    time_base: Ratio,
    start_pts: i64,
    duration: f64,

    out: Mutex<Option<AudioOutputSpec>>,
    quit: AtomicBool,
    forward: AtomicBool,
    seek_pending: AtomicBool,
    seek_secs: Mutex<f64>,
    /// Bumped on every seek; the convert stage resets its resampler and
    /// store when it notices a new generation.
    generation: AtomicU64,
    /// Read cursor in output samples.
    cursor: AtomicI64,
    demux_eof: AtomicBool,
    decode_eof: AtomicBool,

    pkts: BoundedQueue<APktEntry>,
    decoded: BoundedQueue<DecodedFrame>,
    store: Mutex<SampleStore>,
    last_error: Mutex<Option<String>>,
}

pub struct AudioReader {
    shared: Arc<AShared>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
    suspended: bool,
}

impl AudioReader {
    pub fn open(url: &str) -> Result<Self> {
        Self::from_parser(MediaParser::open(url)?)
    }

    pub fn from_parser(parser: Arc<MediaParser>) -> Result<Self> {
        let stream_index = parser.audio_stream_index().ok_or(Error::NotOpened)?;
        let stream = parser
            .info()
            .streams
            .iter()
            .find(|s| s.index == stream_index)
            .ok_or(Error::NotOpened)?;
        let tb = stream.time_base;
        let duration = stream.duration.max(parser.duration());
        let start_pts = ffutil::secs_to_pts(stream.start_time, tb);
        let shared = Arc::new(AShared {
            duration,
            parser,
            stream_index,
            time_base: tb,
            start_pts,
            out: Mutex::new(None),
            quit: AtomicBool::new(false),
            forward: AtomicBool::new(true),
            seek_pending: AtomicBool::new(false),
            seek_secs: Mutex::new(0.0),
            generation: AtomicU64::new(0),
            cursor: AtomicI64::new(0),
            demux_eof: AtomicBool::new(false),
            decode_eof: AtomicBool::new(false),
            pkts: BoundedQueue::new(64),
            decoded: BoundedQueue::new(16),
            store: Mutex::new(SampleStore::default()),
            last_error: Mutex::new(None),
        });
        Ok(Self { shared, threads: Vec::new(), started: false, suspended: false })
    }

    pub fn configure(&mut self, spec: AudioOutputSpec) -> Result<()> {
        if self.started {
            return Err(Error::invalid("configure must precede start"));
        }
        spec.validate()?;
        self.shared.store.lock().channels = spec.channels as usize;
        *self.shared.out.lock() = Some(spec);
        Ok(())
    }

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

    pub fn seek_to(&self, seconds: f64) -> Result<()> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        let spec = self.shared.out.lock().ok_or(Error::NotConfigured)?;
        let cursor = (seconds * spec.sample_rate as f64).round() as i64;
        self.shared.cursor.store(cursor, Ordering::SeqCst);
        *self.shared.seek_secs.lock() = seconds;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.decode_eof.store(false, Ordering::SeqCst);
        self.shared.seek_pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_direction(&self, forward: bool) -> Result<()> {
        if self.shared.forward.swap(forward, Ordering::SeqCst) != forward {
            let spec = self.shared.out.lock().ok_or(Error::NotConfigured)?;
            let secs = self.shared.cursor.load(Ordering::SeqCst) as f64 / spec.sample_rate as f64;
            *self.shared.seek_secs.lock() = secs;
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            self.shared.seek_pending.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn is_forward(&self) -> bool {
        self.shared.forward.load(Ordering::Relaxed)
    }

    pub fn suspend(&mut self) {
        if !self.started || self.suspended {
            return;
        }
        self.join_workers();
        self.shared.pkts.clear();
        self.shared.decoded.clear();
        self.shared.store.lock().blocks.clear();
        self.suspended = true;
    }

    pub fn wake_up(&mut self) {
        if !self.started || !self.suspended {
            return;
        }
        self.suspended = false;
        self.shared.quit.store(false, Ordering::SeqCst);
        let spec = (*self.shared.out.lock()).expect("configured before start");
        let secs = self.shared.cursor.load(Ordering::SeqCst) as f64 / spec.sample_rate as f64;
        *self.shared.seek_secs.lock() = secs;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.seek_pending.store(true, Ordering::SeqCst);
        self.spawn_workers();
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn duration(&self) -> f64 {
        self.shared.duration
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Samples remaining from the cursor to the relevant end, respecting
    /// direction: distance to EOF forward, distance to zero in reverse.
    pub fn left_samples(&self) -> i64 {
        let Some(spec) = *self.shared.out.lock() else { return 0 };
        let cursor = self.shared.cursor.load(Ordering::SeqCst);
        if self.shared.forward.load(Ordering::Relaxed) {
            let total = (self.shared.duration * spec.sample_rate as f64) as i64;
            (total - cursor).max(0)
        } else {
            cursor.max(0)
        }
    }

    /// Pull at most `n` sample frames across block boundaries. The returned
    /// block carries `timestamp = first_sample / sample_rate`; the second
    /// value is EOF (forward: past duration; reverse: before zero).
    pub fn read_audio_samples(&self, n: usize) -> Result<(SampleBlock, bool)> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        if self.suspended {
            return Err(Error::Suspended);
        }
        let spec = self.shared.out.lock().ok_or(Error::NotConfigured)?;
        let sh = &self.shared;
        let forward = sh.forward.load(Ordering::Relaxed);
        let total = (sh.duration * spec.sample_rate as f64) as i64;
        let cursor = sh.cursor.load(Ordering::SeqCst);

        // Off-the-end reads resolve without touching the pipeline.
        if forward && cursor >= total {
            return Ok((block_at(&spec, cursor, 0), true));
        }
        if !forward && cursor <= 0 {
            return Ok((block_at(&spec, 0, 0), true));
        }

        let n = if forward {
            n.min((total - cursor) as usize)
        } else {
            n.min(cursor as usize)
        };
        if n == 0 {
            return Ok((block_at(&spec, cursor, 0), false));
        }
        let start = if forward { cursor } else { cursor - n as i64 };

        let mut out = block_at(&spec, start, n);
        loop {
            {
                let store = sh.store.lock();
                if store.assemble(start, n, &mut out.data) {
                    break;
                }
                // Fully decoded stream that simply ends early: zero-fill.
                if sh.decode_eof.load(Ordering::Relaxed) {
                    if let Some(end) = store.end() {
                        if start >= end {
                            break;
                        }
                        // Partial coverage near the tail — take what exists.
                        let _ = store.assemble(start, (end - start).max(0) as usize, &mut out.data);
                        break;
                    }
                    break;
                }
            }
            if sh.quit.load(Ordering::Relaxed) {
                if let Some(msg) = sh.last_error.lock().clone() {
                    return Err(Error::Worker(msg));
                }
                return Err(Error::NotStarted);
            }
            std::thread::sleep(IDLE);
        }

        let new_cursor = if forward { cursor + n as i64 } else { cursor - n as i64 };
        sh.cursor.store(new_cursor, Ordering::SeqCst);

        let eof = if forward { new_cursor >= total } else { new_cursor <= 0 };
        Ok((out, eof))
    }

    pub fn close(&mut self) {
        self.join_workers();
        self.shared.pkts.clear();
        self.shared.decoded.clear();
        self.shared.store.lock().blocks.clear();
        self.started = false;
        self.suspended = false;
    }

    fn spawn_workers(&mut self) {
        let sh = Arc::clone(&self.shared);
        self.threads.push(spawn_named("ardr-demux", move || a_demux_loop(sh)));
        let sh = Arc::clone(&self.shared);
        self.threads.push(spawn_named("ardr-decode", move || a_decode_loop(sh)));
        let sh = Arc::clone(&self.shared);
        self.threads.push(spawn_named("ardr-convert", move || a_convert_loop(sh)));
    }

    fn join_workers(&mut self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.pkts.clear();
        self.shared.decoded.clear();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        self.shared.quit.store(false, Ordering::SeqCst);
    }
}

impl Drop for AudioReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn block_at(spec: &AudioOutputSpec, start_sample: i64, n: usize) -> SampleBlock {
    SampleBlock::silence(
        n,
        spec.channels,
        spec.sample_rate,
        start_sample as f64 / spec.sample_rate as f64,
    )
}

// ── Demux stage ──────────────────────────────────────────────────────────────

fn a_demux_loop(sh: Arc<AShared>) {
    let mut ictx = match ffmpeg::format::input(&sh.parser.url().to_string()) {
        Ok(c) => c,
        Err(e) => {
            sh.park_error_q("open format context", anyhow!(e));
            return;
        }
    };

    let mut flush_decoder = false;
    // Reverse traversal: `covered_lo` is the lowest pts the current window
    // has read; the next window ends there.
    let mut covered_lo = i64::MAX;
    let mut window_hi = i64::MAX;
    let mut idle = false;

    loop {
        if sh.quit.load(Ordering::Relaxed) {
            break;
        }
        let forward = sh.forward.load(Ordering::Relaxed);

        if sh.seek_pending.swap(false, Ordering::SeqCst) {
            let secs = *sh.seek_secs.lock();
            let target = ffutil::secs_to_pts(secs, sh.time_base) + sh.start_pts;
            let seek_to = if forward {
                target
            } else {
                // Land a window below the cursor so reverse reads have
                // material immediately behind them.
                target - ffutil::secs_to_pts(REVERSE_WINDOW_SECS, sh.time_base)
            }
            .max(sh.start_pts);
            ffutil::seek_stream(&mut ictx, sh.stream_index, seek_to, "ardr-demux");
            sh.pkts.clear();
            sh.demux_eof.store(false, Ordering::SeqCst);
            flush_decoder = true;
            covered_lo = i64::MAX;
            window_hi = if forward {
                i64::MAX
            } else {
                target + ffutil::secs_to_pts(0.1, sh.time_base)
            };
            idle = false;
        }

        if idle || sh.demux_eof.load(Ordering::Relaxed) {
            std::thread::sleep(IDLE);
            if !forward && idle {
                // Hop to the previous window once the cursor needs it.
                let spec = (*sh.out.lock()).expect("configured");
                let cursor_secs =
                    sh.cursor.load(Ordering::Relaxed) as f64 / spec.sample_rate as f64;
                let cursor_pts = ffutil::secs_to_pts(cursor_secs, sh.time_base) + sh.start_pts;
                if cursor_pts < covered_lo + ffutil::secs_to_pts(0.25, sh.time_base)
                    && covered_lo > sh.start_pts
                {
                    let hop = (covered_lo
                        - ffutil::secs_to_pts(REVERSE_WINDOW_SECS, sh.time_base))
                    .max(sh.start_pts);
                    ffutil::seek_stream(&mut ictx, sh.stream_index, hop, "ardr-demux(rev)");
                    window_hi = covered_lo;
                    covered_lo = i64::MAX;
                    flush_decoder = true;
                    idle = false;
                }
            }
            continue;
        }

        match ictx.packets().next() {
            Some(Ok((stream, packet))) => {
                if stream.index() != sh.stream_index {
                    continue;
                }
                let pts = packet.pts().or_else(|| packet.dts()).unwrap_or(0);
                if pts < covered_lo {
                    covered_lo = pts;
                }
                if !forward && pts >= window_hi {
                    idle = true;
                    continue;
                }
                let entry = APktEntry { pkt: Some(packet), flush_decoder: std::mem::take(&mut flush_decoder) };
                let quit = &sh.quit;
                let pending = &sh.seek_pending;
                sh.pkts
                    .push(entry, || quit.load(Ordering::Relaxed) || pending.load(Ordering::Relaxed));
            }
            Some(Err(e)) => log::warn!("[ardr] demux read error (skipped): {e}"),
            None => {
                sh.demux_eof.store(true, Ordering::SeqCst);
                let entry = APktEntry { pkt: None, flush_decoder: std::mem::take(&mut flush_decoder) };
                let quit = &sh.quit;
                let pending = &sh.seek_pending;
                sh.pkts
                    .push(entry, || quit.load(Ordering::Relaxed) || pending.load(Ordering::Relaxed));
            }
        }
    }
}

impl AShared {
    fn park_error_q(&self, context: &str, err: anyhow::Error) {
        log::error!("[ardr] {context}: {err:#}");
        *self.last_error.lock() = Some(format!("{context}: {err:#}"));
        self.quit.store(true, Ordering::SeqCst);
    }
}

// ── Decode stage ─────────────────────────────────────────────────────────────

fn a_decode_loop(sh: Arc<AShared>) {
    let decoder = (|| -> anyhow::Result<ffmpeg::decoder::Audio> {
        let ictx = ffmpeg::format::input(&sh.parser.url().to_string())
            .context("open parameter context")?;
        let stream = ictx
            .stream(sh.stream_index)
            .ok_or_else(|| anyhow!("stream {} vanished", sh.stream_index))?;
        let ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("decoder context from parameters")?;
        ctx.decoder().audio().context("open audio decoder")
    })();
    let mut decoder = match decoder {
        Ok(d) => d,
        Err(e) => {
            sh.park_error_q("open audio decoder", e);
            return;
        }
    };

    loop {
        if sh.quit.load(Ordering::Relaxed) {
            break;
        }
        let Some(entry) = sh.pkts.pop(IDLE) else { continue };

        if entry.flush_decoder {
            decoder.flush();
        }
        match &entry.pkt {
            Some(pkt) => {
                if let Err(e) = decoder.send_packet(pkt) {
                    log::warn!("[ardr] send_packet failed (skipped): {e}");
                    continue;
                }
            }
            None => {
                let _ = decoder.send_eof();
            }
        }

        let mut frame = AvAudio::empty();
        while decoder.receive_frame(&mut frame).is_ok() {
            let pts = frame.pts().unwrap_or(0);
            let quit = &sh.quit;
            let pending = &sh.seek_pending;
            let pushed = sh.decoded.push(DecodedFrame { frame: frame.clone(), pts }, || {
                quit.load(Ordering::Relaxed) || pending.load(Ordering::Relaxed)
            });
            if !pushed {
                break;
            }
            frame = AvAudio::empty();
        }

        if entry.pkt.is_none() {
            sh.decode_eof.store(true, Ordering::SeqCst);
        }
    }
}

// ── Convert stage ────────────────────────────────────────────────────────────

fn a_convert_loop(sh: Arc<AShared>) {
    let spec = (*sh.out.lock()).expect("configured before start");
    let mut resampler: Option<resampling::Context> = None;
    let mut seen_gen = sh.generation.load(Ordering::SeqCst);

    loop {
        if sh.quit.load(Ordering::Relaxed) {
            break;
        }

        // A new generation means a seek happened: the resampler's internal
        // state belongs to the old position, so rebuild it and drop stale
        // samples.
        let gen = sh.generation.load(Ordering::SeqCst);
        if gen != seen_gen {
            seen_gen = gen;
            resampler = None;
            sh.store.lock().blocks.clear();
        }

        let Some(decoded) = sh.decoded.pop(IDLE) else { continue };

        let src = &decoded.frame;
        let out_layout = if spec.channels == 1 {
            ChannelLayout::MONO
        } else {
            ChannelLayout::STEREO
        };
        let target_fmt = ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed);

        if resampler.is_none() {
            let src_layout = src.ch_layout();
            match resampling::Context::get2(
                src.format(),
                src_layout,
                src.rate(),
                target_fmt,
                out_layout,
                spec.sample_rate,
            ) {
                Ok(ctx) => resampler = Some(ctx),
                Err(e) => {
                    log::warn!("[ardr] resampler create failed (frame dropped): {e}");
                    continue;
                }
            }
        }

        let mut converted = AvAudio::empty();
        let run = resampler.as_mut().unwrap().run(src, &mut converted);
        if run.is_err() || converted.samples() == 0 {
            if let Err(e) = run {
                log::warn!("[ardr] resample failed (frame dropped): {e}");
            }
            continue;
        }

        // Source pts → output sample index.
        let secs = ffutil::pts_to_secs(decoded.pts - sh.start_pts, sh.time_base);
        let start_sample = (secs * spec.sample_rate as f64).round() as i64;

        let n = converted.samples();
        let ch = spec.channels as usize;
        let mut data = vec![0.0f32; n * ch];
        unsafe {
            let src_slice =
                std::slice::from_raw_parts(converted.data(0).as_ptr() as *const f32, n * ch);
            data.copy_from_slice(src_slice);
        }

        let mut store = sh.store.lock();
        store.blocks.insert(start_sample, data);
        // Keep the store bounded around the cursor.
        let cursor = sh.cursor.load(Ordering::Relaxed);
        let span = (STORE_SPAN_SECS * spec.sample_rate as f64) as i64;
        store.prune(cursor - span, cursor + span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ch: usize, blocks: &[(i64, usize, f32)]) -> SampleStore {
        let mut s = SampleStore { blocks: BTreeMap::new(), channels: ch };
        for &(start, n, v) in blocks {
            s.blocks.insert(start, vec![v; n * ch]);
        }
        s
    }

    #[test]
    fn assemble_within_one_block() {
        let s = store(2, &[(0, 100, 0.5)]);
        let mut dst = vec![0.0; 20 * 2];
        assert!(s.assemble(10, 20, &mut dst));
        assert!(dst.iter().all(|&x| x == 0.5));
    }

    #[test]
    fn assemble_across_blocks() {
        let s = store(1, &[(0, 50, 0.25), (50, 50, 0.75)]);
        let mut dst = vec![0.0; 60];
        assert!(s.assemble(20, 60, &mut dst));
        assert!(dst[..30].iter().all(|&x| x == 0.25));
        assert!(dst[30..].iter().all(|&x| x == 0.75));
    }

    #[test]
    fn assemble_detects_gap() {
        let s = store(1, &[(0, 50, 0.25), (80, 50, 0.75)]);
        let mut dst = vec![0.0; 60];
        assert!(!s.assemble(20, 60, &mut dst));
    }

    #[test]
    fn assemble_missing_leading_block() {
        let s = store(1, &[(100, 50, 1.0)]);
        let mut dst = vec![0.0; 10];
        assert!(!s.assemble(0, 10, &mut dst));
    }

    #[test]
    fn prune_keeps_overlapping() {
        let mut s = store(1, &[(0, 50, 0.1), (50, 50, 0.2), (100, 50, 0.3)]);
        s.prune(60, 120);
        assert!(!s.blocks.contains_key(&0));
        assert!(s.blocks.contains_key(&50));
        assert!(s.blocks.contains_key(&100));
    }

    #[test]
    fn store_end_is_exclusive() {
        let s = store(2, &[(0, 50, 0.1)]);
        assert_eq!(s.end(), Some(50));
    }
}
