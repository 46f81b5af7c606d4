// crates/cutline-media/src/overview.rs
//
// Overview scanner: one pass over a file's audio stream producing per-
// column min/max peak pairs for timeline lane rendering.
//
// Decodes in-process (mono, low rate — waveform columns don't need more),
// runs on one cancellable worker and delivers the finished result over a
// bounded channel so the caller polls or blocks as it likes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context as _};
use crossbeam_channel::{bounded, Receiver, Sender};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::resampling;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AvAudio;

use crate::error::{Error, Result};
use crate::parser::MediaParser;
use crate::sysutil::spawn_named;

/// Mono decode rate for peak extraction. 2 kHz resolves 1000 columns on
/// anything longer than half a second.
const SCAN_RATE: u32 = 2000;

const DEFAULT_COLUMNS: usize = 1000;

/// One waveform column: the extremes of the samples it covers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PeakPair {
    pub min: f32,
    pub max: f32,
}

/// The finished scan.
#[derive(Clone, Debug)]
pub struct Overview {
    pub url: String,
    pub duration: f64,
    pub peaks: Vec<PeakPair>,
}

pub struct OverviewScanner {
    rx: Receiver<Result<Overview>>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl OverviewScanner {
    /// Start scanning `parser`'s audio stream into `columns` peak pairs.
    pub fn start(parser: Arc<MediaParser>, columns: Option<usize>) -> Result<Self> {
        if parser.audio_stream_index().is_none() {
            return Err(Error::NotOpened);
        }
        let columns = columns.unwrap_or(DEFAULT_COLUMNS).max(1);
        let (tx, rx) = bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&cancel);
        let worker = spawn_named("overview-scan", move || {
            let result = scan(&parser, columns, &flag)
                .map_err(|e| Error::Worker(format!("overview scan: {e:#}")));
            let _ = tx.send(result);
        });

        Ok(Self { rx, cancel, worker: Some(worker) })
    }

    /// Non-blocking poll; `None` while the scan is still running.
    pub fn try_result(&self) -> Option<Result<Overview>> {
        self.rx.try_recv().ok()
    }

    /// Block until the scan finishes (or was cancelled).
    pub fn wait(&self) -> Result<Overview> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Error::Worker("overview worker vanished".into())))
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl Drop for OverviewScanner {
    fn drop(&mut self) {
        self.cancel();
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}

fn scan(parser: &MediaParser, columns: usize, cancel: &AtomicBool) -> anyhow::Result<Overview> {
    let stream_index = parser
        .audio_stream_index()
        .ok_or_else(|| anyhow!("no audio stream"))?;

    let mut ictx = ffmpeg::format::input(&parser.url().to_string()).context("open input")?;
    let stream = ictx
        .stream(stream_index)
        .ok_or_else(|| anyhow!("stream vanished"))?;
    let ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("decoder context")?;
    let mut decoder = ctx.decoder().audio().context("open audio decoder")?;

    let mut resampler: Option<resampling::Context> = None;
    let mut samples: Vec<f32> = Vec::new();
    let target_fmt = ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed);

    let mut collect = |frame: &AvAudio, resampler: &mut Option<resampling::Context>| {
        if resampler.is_none() {
            match resampling::Context::get2(
                frame.format(),
                frame.ch_layout(),
                frame.rate(),
                target_fmt,
                ChannelLayout::MONO,
                SCAN_RATE,
            ) {
                Ok(ctx) => *resampler = Some(ctx),
                Err(e) => {
                    log::warn!("[overview] resampler create failed: {e}");
                    return;
                }
            }
        }
        let mut mono = AvAudio::empty();
        if resampler.as_mut().unwrap().run(frame, &mut mono).is_ok() && mono.samples() > 0 {
            unsafe {
                let src = std::slice::from_raw_parts(
                    mono.data(0).as_ptr() as *const f32,
                    mono.samples(),
                );
                samples.extend(src.iter().map(|s| s.clamp(-1.0, 1.0)));
            }
        }
    };

    for result in ictx.packets() {
        if cancel.load(Ordering::Relaxed) {
            return Err(anyhow!("cancelled"));
        }
        let Ok((s, packet)) = result else { break };
        if s.index() != stream_index {
            continue;
        }
        if decoder.send_packet(&packet).is_err() {
            continue;
        }
        let mut frame = AvAudio::empty();
        while decoder.receive_frame(&mut frame).is_ok() {
            collect(&frame, &mut resampler);
        }
    }
    let _ = decoder.send_eof();
    let mut frame = AvAudio::empty();
    while decoder.receive_frame(&mut frame).is_ok() {
        collect(&frame, &mut resampler);
    }

    if samples.is_empty() {
        return Err(anyhow!("no audio samples decoded"));
    }

    let peaks = reduce_peaks(&samples, columns);
    log::debug!("[overview] {} peaks <- {}", peaks.len(), parser.url());
    Ok(Overview {
        url: parser.url().to_string(),
        duration: parser.duration(),
        peaks,
    })
}

/// Fold samples into at most `columns` min/max pairs.
fn reduce_peaks(samples: &[f32], columns: usize) -> Vec<PeakPair> {
    let block = (samples.len() / columns).max(1);
    samples
        .chunks(block)
        .take(columns)
        .map(|chunk| {
            chunk.iter().fold(
                PeakPair { min: f32::MAX, max: f32::MIN },
                |acc, &s| PeakPair { min: acc.min.min(s), max: acc.max.max(s) },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_covers_extremes() {
        let samples = vec![0.0, 0.5, -0.25, 0.1, -0.9, 0.9, 0.0, 0.2];
        let peaks = reduce_peaks(&samples, 2);
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0], PeakPair { min: -0.25, max: 0.5 });
        assert_eq!(peaks[1], PeakPair { min: -0.9, max: 0.9 });
    }

    #[test]
    fn reduce_handles_fewer_samples_than_columns() {
        let peaks = reduce_peaks(&[0.3, -0.3], 10);
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0], PeakPair { min: 0.3, max: 0.3 });
    }
}
