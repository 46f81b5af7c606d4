// crates/cutline-media/src/composer/audio.rs
//
// AudioComposer: N audio tracks mixed into one PCM stream.
//
// The mixing worker reads one fixed-size block (1024 samples) from every
// track per iteration, feeds each into its own `abuffer` input of an
// `amix=inputs=N:normalize=0` graph (planar-float in, packed-float out),
// pulls exactly one block from the sink, runs it through the composer-wide
// effects chain and enqueues it. The graph is rebuilt from scratch whenever
// the track set changes — the worker restart on add/remove makes that
// free.
//
// Probe mode is the transient state during scrub: the output fades to
// silence (stage -1) and stops consuming tracks; each new probe seek fades
// back in (stage +1 for one block, then stage 0) until the probe budget
// elapses; two probe seeks closer than the budget coalesce into one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use parking_lot::{Condvar, Mutex};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::filter;
use ffmpeg::util::frame::audio::Audio as AvAudio;

use cutline_core::{Id, SampleBlock};

use crate::error::{Error, Result};
use crate::ffutil;
use crate::filter::audio_effect::AudioEffectFilter;
use crate::reader::AudioOutputSpec;
use crate::sysutil::spawn_named;
use crate::track::AudioTrack;

/// Samples per mixed block.
const BLOCK_SIZE: usize = 1024;

/// Queue depth, in blocks (~185 ms at 44.1 kHz).
const OUTPUT_CACHE: usize = 8;

const IDLE: Duration = Duration::from_millis(5);

// ── Probe-mode stage machine ─────────────────────────────────────────────────
//
// stage -1: faded out, not reading.  +1: fading in (one block).  0: steady.

/// Stage after producing one block in `stage`, having spent
/// `steady_elapsed_ms` in stage 0 against a budget of `probe_duration_ms`.
pub(crate) fn advance_probe_stage(stage: i32, steady_elapsed_ms: i64, probe_duration_ms: i64) -> i32 {
    match stage {
        1 => 0,
        0 if steady_elapsed_ms >= probe_duration_ms => -1,
        s => s,
    }
}

/// Whether a new probe seek at `new_pos_ms` collapses into the previous one.
pub(crate) fn coalesce_probe_seek(prev_pos_ms: i64, new_pos_ms: i64, probe_duration_ms: i64) -> bool {
    (prev_pos_ms - new_pos_ms).abs() <= probe_duration_ms
}

/// Per-sample gain ramp for a block produced in `stage`.
fn stage_gain(stage: i32, i: usize, n: usize) -> f32 {
    let t = i as f32 / n.max(1) as f32;
    match stage {
        1 => t,        // fade in
        -1 => 1.0 - t, // fade out
        _ => 1.0,
    }
}

struct ProbeState {
    active: bool,
    stage: i32,
    steady_elapsed_ms: i64,
    probe_duration_ms: i64,
    prev_seek_pos_ms: i64,
}

struct Inner {
    spec: Mutex<Option<AudioOutputSpec>>,
    tracks: Mutex<Vec<AudioTrack>>,
    queue: Mutex<VecDeque<SampleBlock>>,
    queue_cv: Condvar,
    quit: AtomicBool,
    forward: AtomicBool,
    seek: Mutex<Option<(f64, bool)>>, // (seconds, probe_mode)
    probe: Mutex<ProbeState>,
    read_sample: AtomicI64,
    effect: Mutex<Option<AudioEffectFilter>>,
    last_error: Mutex<Option<String>>,
}

pub struct AudioComposer {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
    started: bool,
}

impl Default for AudioComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioComposer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                spec: Mutex::new(None),
                tracks: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                quit: AtomicBool::new(false),
                forward: AtomicBool::new(true),
                seek: Mutex::new(None),
                probe: Mutex::new(ProbeState {
                    active: false,
                    stage: -1,
                    steady_elapsed_ms: 0,
                    probe_duration_ms: 1000,
                    prev_seek_pos_ms: i64::MIN / 2,
                }),
                read_sample: AtomicI64::new(0),
                effect: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            worker: None,
            started: false,
        }
    }

    pub fn configure(&mut self, spec: AudioOutputSpec) -> Result<()> {
        if self.started {
            return Err(Error::invalid("configure must precede start"));
        }
        spec.validate()?;
        *self.inner.spec.lock() = Some(spec);
        *self.inner.effect.lock() = Some(AudioEffectFilter::new(spec)?);
        Ok(())
    }

    pub fn output_spec(&self) -> Option<AudioOutputSpec> {
        *self.inner.spec.lock()
    }

    /// Milliseconds a probe stays live before fading back out.
    pub fn set_probe_duration(&self, ms: i64) -> Result<()> {
        if ms <= 0 {
            return Err(Error::invalid("probe duration must be > 0"));
        }
        self.inner.probe.lock().probe_duration_ms = ms;
        Ok(())
    }

    /// The post-mix effects chain.
    pub fn edit_effect<R>(&self, f: impl FnOnce(&mut AudioEffectFilter) -> R) -> Result<R> {
        let mut guard = self.inner.effect.lock();
        let fx = guard.as_mut().ok_or(Error::NotConfigured)?;
        Ok(f(fx))
    }

    pub fn start(&mut self) -> Result<()> {
        if self.inner.spec.lock().is_none() {
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
        self.worker = Some(spawn_named("acomp-mix", move || mix_loop(inner)));
    }

    fn stop_worker(&mut self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
        self.inner.quit.store(false, Ordering::SeqCst);
    }

    fn with_stopped_worker<R>(&mut self, f: impl FnOnce(&Inner) -> Result<R>) -> Result<R> {
        let was_started = self.started && self.worker.is_some();
        if was_started {
            self.stop_worker();
        }
        let result = f(&self.inner);
        let rate = self
            .inner
            .spec
            .lock()
            .map(|s| s.sample_rate as i64)
            .unwrap_or(44100);
        let pos_ms = self.inner.read_sample.load(Ordering::SeqCst) * 1000 / rate;
        for track in self.inner.tracks.lock().iter_mut() {
            track.seek_to(pos_ms);
        }
        self.inner.queue.lock().clear();
        if was_started {
            self.spawn_worker();
        }
        result
    }

    // ── Track management (order is irrelevant for audio) ─────────────────

    pub fn add_track(&mut self, id: Id) -> Result<()> {
        let spec = self.inner.spec.lock().ok_or(Error::NotConfigured)?;
        let forward = self.inner.forward.load(Ordering::SeqCst);
        self.with_stopped_worker(move |inner| {
            let mut tracks = inner.tracks.lock();
            if tracks.iter().any(|t| t.id() == id) {
                return Err(Error::invalid(format!("duplicate track id {id}")));
            }
            let mut track = AudioTrack::new(id, spec)?;
            track.set_direction(forward)?;
            tracks.push(track);
            Ok(())
        })
    }

    pub fn remove_track(&mut self, id: Id) -> Result<AudioTrack> {
        self.with_stopped_worker(move |inner| {
            let mut tracks = inner.tracks.lock();
            let idx = tracks
                .iter()
                .position(|t| t.id() == id)
                .ok_or_else(|| Error::invalid(format!("no track {id}")))?;
            Ok(tracks.remove(idx))
        })
    }

    pub fn track_count(&self) -> usize {
        self.inner.tracks.lock().len()
    }

    pub fn edit_track<R>(&self, id: Id, f: impl FnOnce(&mut AudioTrack) -> R) -> Result<R> {
        let mut tracks = self.inner.tracks.lock();
        let track = tracks
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or_else(|| Error::invalid(format!("no track {id}")))?;
        Ok(f(track))
    }

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
        {
            let probe = self.inner.probe.lock();
            if probe.active && probe.stage != -1 {
                return Err(Error::invalid("direction switch while a probe is live"));
            }
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

    /// Queue a seek. `probe_mode` marks it as a speculative scrub seek
    /// subject to fade staging and coalescing.
    pub fn seek_to(&self, pos_secs: f64, probe_mode: bool) -> Result<()> {
        if pos_secs < 0.0 {
            return Err(Error::invalid("seek position must be >= 0"));
        }
        *self.inner.seek.lock() = Some((pos_secs, probe_mode));
        Ok(())
    }

    /// Pop the next mixed block; `None` when `non_blocking` and nothing is
    /// queued (including the faded-out probe idle state).
    pub fn read_audio_samples(&self, non_blocking: bool) -> Result<Option<SampleBlock>> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        loop {
            if let Some(msg) = self.inner.last_error.lock().clone() {
                return Err(Error::Worker(msg));
            }
            let popped = {
                let mut q = self.inner.queue.lock();
                let b = q.pop_front();
                if b.is_some() {
                    self.inner.queue_cv.notify_all();
                }
                b
            };
            match popped {
                Some(block) => return Ok(Some(block)),
                None => {
                    let probe_idle = {
                        let p = self.inner.probe.lock();
                        p.active && p.stage == -1
                    };
                    if non_blocking || probe_idle {
                        return Ok(None);
                    }
                    let dead = self
                        .worker
                        .as_ref()
                        .map(|w| w.is_finished())
                        .unwrap_or(true);
                    if dead {
                        return Err(Error::NotStarted);
                    }
                    std::thread::sleep(IDLE);
                }
            }
        }
    }

    /// Fill `dst` with little-endian f32 bytes from the mixed queue — the
    /// pull surface an audio sink drains at its own cadence. Underflow is
    /// zero-padded; the return value is the byte count actually mixed.
    pub fn pull_bytes(&self, dst: &mut [u8]) -> usize {
        dst.fill(0);
        let mut written = 0usize;
        while written + 4 <= dst.len() {
            let Ok(Some(block)) = self.read_audio_samples(true) else { break };
            for s in block.data {
                if written + 4 > dst.len() {
                    break;
                }
                dst[written..written + 4].copy_from_slice(&s.to_le_bytes());
                written += 4;
            }
        }
        written
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    pub fn close(&mut self) {
        self.stop_worker();
        self.inner.queue.lock().clear();
        self.started = false;
    }
}

impl Drop for AudioComposer {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Mix graph ────────────────────────────────────────────────────────────────

/// Build the `N × abuffer → amix → aformat → abuffersink` graph. Inputs
/// are planar float at the output rate, the sink packed float, per the
/// track-output / mix-output format convention.
fn build_mix_graph(n: usize, spec: AudioOutputSpec) -> anyhow::Result<filter::Graph> {
    let layout = if spec.channels == 1 { "mono" } else { "stereo" };
    let rate = spec.sample_rate;

    let mut graph = filter::Graph::new();
    let src_args = format!(
        "time_base=1/{rate}:sample_rate={rate}:sample_fmt=fltp:channel_layout={layout}"
    );
    let abuffer = filter::find("abuffer").ok_or_else(|| anyhow!("abuffer filter missing"))?;
    for i in 0..n {
        graph
            .add(&abuffer, &format!("in_{i}"), &src_args)
            .with_context(|| format!("create abuffer in_{i}"))?;
    }
    graph
        .add(
            &filter::find("abuffersink").ok_or_else(|| anyhow!("abuffersink filter missing"))?,
            "out",
            "",
        )
        .context("create abuffersink")?;

    let chain = if n > 1 {
        format!(
            "amix=inputs={n}:normalize=0,aformat=sample_fmts=flt:sample_rates={rate}:channel_layouts={layout}"
        )
    } else {
        format!("aformat=sample_fmts=flt:sample_rates={rate}:channel_layouts={layout}")
    };

    let mut parser = graph.output("in_0", 0).context("link in_0")?;
    for i in 1..n {
        parser = parser
            .output(&format!("in_{i}"), 0)
            .with_context(|| format!("link in_{i}"))?;
    }
    parser
        .input("out", 0)
        .context("link sink")?
        .parse(&chain)
        .with_context(|| format!("parse '{chain}'"))?;
    graph.validate().context("validate mix graph")?;

    graph
        .get("out")
        .expect("sink exists")
        .sink()
        .set_frame_size(BLOCK_SIZE as u32);
    Ok(graph)
}

// ── Mixing worker ────────────────────────────────────────────────────────────

fn mix_loop(inner: Arc<Inner>) {
    let Some(spec) = *inner.spec.lock() else { return };
    let rate = spec.sample_rate as i64;
    let block_ms = BLOCK_SIZE as i64 * 1000 / rate;

    let mut track_count = inner.tracks.lock().len();
    let mut graph = if track_count > 0 {
        match build_mix_graph(track_count, spec) {
            Ok(g) => Some(g),
            Err(e) => {
                log::error!("[acomp] mixer build failed: {e:#}");
                *inner.last_error.lock() = Some(format!("build mixer: {e:#}"));
                return;
            }
        }
    } else {
        None
    };
    let mut next_pts: i64 = 0;

    loop {
        if inner.quit.load(Ordering::Relaxed) {
            break;
        }

        // 1. Pending seek (normal or probe).
        let pending = inner.seek.lock().take();
        if let Some((pos, probe_mode)) = pending {
            let pos_ms = (pos * 1000.0).round() as i64;
            let mut probe = inner.probe.lock();
            if probe_mode {
                if probe.active
                    && coalesce_probe_seek(probe.prev_seek_pos_ms, pos_ms, probe.probe_duration_ms)
                    && probe.stage != -1
                {
                    // Collapse: keep playing from the earlier probe.
                    probe.prev_seek_pos_ms = pos_ms;
                } else {
                    probe.active = true;
                    probe.stage = 1;
                    probe.steady_elapsed_ms = 0;
                    probe.prev_seek_pos_ms = pos_ms;
                    drop(probe);
                    for track in inner.tracks.lock().iter_mut() {
                        track.seek_to(pos_ms);
                    }
                    inner
                        .read_sample
                        .store(pos_ms * rate / 1000, Ordering::SeqCst);
                    inner.queue.lock().clear();
                }
            } else {
                probe.active = false;
                probe.stage = -1;
                drop(probe);
                for track in inner.tracks.lock().iter_mut() {
                    track.seek_to(pos_ms);
                }
                inner
                    .read_sample
                    .store(pos_ms * rate / 1000, Ordering::SeqCst);
                inner.queue.lock().clear();
            }
        }

        // 2. Faded-out probe: hold silent, produce nothing.
        let stage = {
            let p = inner.probe.lock();
            if p.active && p.stage == -1 {
                std::thread::sleep(IDLE);
                continue;
            }
            if p.active {
                p.stage
            } else {
                0
            }
        };

        // 3. Backpressure.
        {
            let mut q = inner.queue.lock();
            while q.len() >= OUTPUT_CACHE {
                if inner.quit.load(Ordering::Relaxed) || inner.seek.lock().is_some() {
                    break;
                }
                inner.queue_cv.wait_for(&mut q, IDLE);
            }
            if q.len() >= OUTPUT_CACHE {
                continue;
            }
        }

        let read_sample = inner.read_sample.load(Ordering::SeqCst);
        let timestamp = read_sample as f64 / rate as f64;

        // 4. One block per track through the mixer.
        let mixed = {
            let mut tracks = inner.tracks.lock();
            if tracks.is_empty() {
                Some(SampleBlock::silence(
                    BLOCK_SIZE,
                    spec.channels,
                    spec.sample_rate,
                    timestamp,
                ))
            } else {
                if graph.is_none() || tracks.len() != track_count {
                    // Track set changed without a restart — rebuild.
                    match build_mix_graph(tracks.len(), spec) {
                        Ok(new_graph) => {
                            graph = Some(new_graph);
                            track_count = tracks.len();
                        }
                        Err(e) => {
                            *inner.last_error.lock() = Some(format!("rebuild mixer: {e:#}"));
                            break;
                        }
                    }
                }
                let g = graph.as_mut().unwrap();
                match mix_one_block(g, &mut tracks, &spec, next_pts, timestamp) {
                    Ok(b) => b,
                    Err(e) => {
                        log::error!("[acomp] mix failed: {e:#}");
                        *inner.last_error.lock() = Some(format!("mix: {e:#}"));
                        break;
                    }
                }
            }
        };
        next_pts += BLOCK_SIZE as i64;

        // The tracks consumed a block either way; keep the composer cursor
        // in lock-step even while the graph primes.
        let forward = inner.forward.load(Ordering::Relaxed);
        inner.read_sample.store(
            read_sample + if forward { BLOCK_SIZE as i64 } else { -(BLOCK_SIZE as i64) },
            Ordering::SeqCst,
        );

        let Some(mut block) = mixed else {
            // The graph is still priming; try again.
            continue;
        };

        // 5. Probe fade envelope.
        if stage != 0 {
            let n = block.sample_count();
            let ch = block.channels as usize;
            for i in 0..n {
                let g = stage_gain(stage, i, n);
                for c in 0..ch {
                    block.data[i * ch + c] *= g;
                }
            }
        }

        // 6. Post-mix effects.
        {
            let mut fx = inner.effect.lock();
            if let Some(fx) = fx.as_mut() {
                match fx.apply(&block) {
                    Ok(out) if !out.is_empty() => block = out,
                    Ok(_) => {}
                    Err(e) => log::warn!("[acomp] post-mix effect failed (passthrough): {e}"),
                }
            }
        }

        inner.queue.lock().push_back(block);
        inner.queue_cv.notify_all();

        // 7. Advance the probe machine once per produced block.
        {
            let mut p = inner.probe.lock();
            if p.active {
                if p.stage == 0 {
                    p.steady_elapsed_ms += block_ms;
                }
                p.stage = advance_probe_stage(p.stage, p.steady_elapsed_ms, p.probe_duration_ms);
            }
        }
    }
}

/// Feed one block from every track, pull one mixed block from the sink.
/// Returns `None` while the graph buffers its first input.
fn mix_one_block(
    graph: &mut filter::Graph,
    tracks: &mut [AudioTrack],
    spec: &AudioOutputSpec,
    pts: i64,
    timestamp: f64,
) -> anyhow::Result<Option<SampleBlock>> {
    for (i, track) in tracks.iter_mut().enumerate() {
        let block = track
            .read_audio_samples(BLOCK_SIZE)
            .map_err(|e| anyhow!("track {} read: {e}", track.id()))?;
        let frame = ffutil::block_to_fltp_frame(&block, pts);
        graph
            .get(&format!("in_{i}"))
            .ok_or_else(|| anyhow!("mixer input in_{i} missing"))?
            .source()
            .add(&frame)
            .map_err(|e| anyhow!("feed in_{i}: {e}"))?;
    }

    let mut out = AvAudio::empty();
    match graph
        .get("out")
        .ok_or_else(|| anyhow!("mixer sink missing"))?
        .sink()
        .frame(&mut out)
    {
        Ok(()) => {
            let block = ffutil::flt_frame_to_block(&out, spec.sample_rate, timestamp)?;
            Ok(Some(block))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_stage_fades_in_for_exactly_one_block() {
        assert_eq!(advance_probe_stage(1, 0, 1000), 0);
    }

    #[test]
    fn probe_stage_holds_steady_inside_budget() {
        assert_eq!(advance_probe_stage(0, 500, 1000), 0);
    }

    #[test]
    fn probe_stage_fades_out_after_budget() {
        assert_eq!(advance_probe_stage(0, 1000, 1000), -1);
        assert_eq!(advance_probe_stage(0, 2500, 1000), -1);
    }

    #[test]
    fn probe_stage_stays_faded_out() {
        assert_eq!(advance_probe_stage(-1, 0, 1000), -1);
    }

    #[test]
    fn nearby_probe_seeks_coalesce() {
        assert!(coalesce_probe_seek(5000, 5400, 1000));
        assert!(coalesce_probe_seek(5000, 4200, 1000));
        assert!(!coalesce_probe_seek(5000, 6500, 1000));
    }

    #[test]
    fn stage_gain_ramps() {
        assert_eq!(stage_gain(0, 0, 4), 1.0);
        assert_eq!(stage_gain(1, 0, 4), 0.0);
        assert!(stage_gain(1, 3, 4) > 0.7);
        assert_eq!(stage_gain(-1, 0, 4), 1.0);
        assert!(stage_gain(-1, 3, 4) < 0.3);
    }
}
