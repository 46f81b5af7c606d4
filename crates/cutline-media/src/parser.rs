// crates/cutline-media/src/parser.rs
//
// MediaParser: probe one media file once, share the result everywhere.
//
// A parser is cheap to clone around (`Arc`) and owns no open file handle —
// readers and the snapshot generator each open their own format context
// from the url. The one expensive derived product, the key-frame pts index
// of the video stream, is scanned lazily on first request and cached.

use std::sync::Arc;

use parking_lot::Mutex;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::media::Type as MediaType;

use cutline_core::time::Ratio;
use cutline_core::{AudioStreamInfo, MediaInfo, StreamInfo, StreamKind, VideoStreamInfo};

use crate::error::{ff, Error, Result};
use crate::ffutil;

pub struct MediaParser {
    url: String,
    info: MediaInfo,
    video_stream: Option<usize>,
    audio_stream: Option<usize>,
    // Key-frame pts (stream time-base, ascending) of the best video stream.
    seek_points: Mutex<Option<Arc<Vec<i64>>>>,
}

impl MediaParser {
    /// Probe `url` and build the stream description. Fails with
    /// [`Error::NotOpened`] when the container cannot be opened and with a
    /// wrapped codec-library error when stream info is unreadable.
    pub fn open(url: &str) -> Result<Arc<MediaParser>> {
        let ictx = ffmpeg::format::input(&url).map_err(|e| {
            log::warn!("[parser] open '{url}' failed: {e}");
            match e {
                ffmpeg::Error::InvalidData => ff("avformat_open_input", e),
                _ => Error::NotOpened,
            }
        })?;

        let container_duration = if ictx.duration() > 0 {
            ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        } else {
            0.0
        };

        let mut streams = Vec::new();
        let mut video_stream = None;
        let mut audio_stream = None;

        for stream in ictx.streams() {
            let tb = ffutil::ratio_of(stream.time_base());
            let start_time = if stream.start_time() == ffmpeg::ffi::AV_NOPTS_VALUE {
                0.0
            } else {
                ffutil::pts_to_secs(stream.start_time(), tb)
            };
            let duration = if stream.duration() > 0 {
                ffutil::pts_to_secs(stream.duration(), tb)
            } else {
                container_duration
            };

            let params = stream.parameters();
            let decoder_ctx = ffmpeg::codec::context::Context::from_parameters(params.clone())
                .map_err(|e| ff("avcodec_parameters_to_context", e))?;

            let mut info = StreamInfo {
                index: stream.index(),
                kind: StreamKind::Unknown,
                duration,
                start_time,
                bitrate: unsafe { (*params.as_ptr()).bit_rate },
                time_base: tb,
                video: None,
                audio: None,
            };

            match decoder_ctx.medium() {
                MediaType::Video => {
                    info.kind = StreamKind::Video;
                    let (w, h, pix_fmt, bit_depth) = unsafe {
                        let p = params.as_ptr();
                        let fmt: ffmpeg::format::Pixel =
                            std::mem::transmute::<i32, ffmpeg::ffi::AVPixelFormat>((*p).format).into();
                        let name = format!("{fmt:?}").to_lowercase();
                        let depth = if name.contains("12") { 12 } else if name.contains("10") { 10 } else { 8 };
                        ((*p).width as u32, (*p).height as u32, name, depth)
                    };
                    let avg = ffutil::ratio_of(stream.avg_frame_rate());
                    let real = ffutil::ratio_of(stream.rate());
                    // Single-frame streams with no usable rate are stills.
                    let is_image = stream.frames() == 1
                        || (!avg.is_valid() && !real.is_valid() && duration <= 0.0);
                    let codec_name = format!("{:?}", decoder_ctx.id()).to_lowercase();
                    if video_stream.is_none() {
                        video_stream = Some(stream.index());
                    }
                    info.video = Some(VideoStreamInfo {
                        width: w,
                        height: h,
                        pixel_format: pix_fmt,
                        codec_name,
                        avg_frame_rate: avg,
                        real_frame_rate: real,
                        is_image,
                        is_hdr: bit_depth > 8,
                        bit_depth,
                    });
                }
                MediaType::Audio => {
                    info.kind = StreamKind::Audio;
                    let (channels, sample_rate, sample_fmt, bit_depth) = unsafe {
                        let p = params.as_ptr();
                        let fmt: ffmpeg::format::Sample =
                            std::mem::transmute::<i32, ffmpeg::ffi::AVSampleFormat>((*p).format).into();
                        (
                            (*p).ch_layout.nb_channels as u16,
                            (*p).sample_rate as u32,
                            format!("{fmt:?}").to_lowercase(),
                            ((*p).bits_per_raw_sample).max(16) as u8,
                        )
                    };
                    if audio_stream.is_none() {
                        audio_stream = Some(stream.index());
                    }
                    info.audio = Some(AudioStreamInfo {
                        channels,
                        sample_rate,
                        sample_format: sample_fmt,
                        bit_depth,
                    });
                }
                MediaType::Subtitle => info.kind = StreamKind::Subtitle,
                _ => {}
            }

            streams.push(info);
        }

        let start_time = if ictx.start_time() == ffmpeg::ffi::AV_NOPTS_VALUE {
            0.0
        } else {
            ictx.start_time() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        };

        let duration = if container_duration > 0.0 {
            container_duration
        } else {
            streams.iter().map(|s| s.duration).fold(0.0, f64::max)
        };

        let info = MediaInfo {
            url: url.to_string(),
            duration,
            start_time,
            bitrate: unsafe { (*ictx.as_ptr()).bit_rate },
            streams,
        };

        log::debug!(
            "[parser] '{url}': {:.3}s, {} stream(s), video={video_stream:?}, audio={audio_stream:?}",
            info.duration,
            info.streams.len()
        );

        Ok(Arc::new(MediaParser {
            url: url.to_string(),
            info,
            video_stream,
            audio_stream,
            seek_points: Mutex::new(None),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    pub fn duration(&self) -> f64 {
        self.info.duration
    }

    pub fn video_stream_index(&self) -> Option<usize> {
        self.video_stream
    }

    pub fn audio_stream_index(&self) -> Option<usize> {
        self.audio_stream
    }

    pub fn video_info(&self) -> Option<&VideoStreamInfo> {
        self.info
            .streams
            .iter()
            .find(|s| Some(s.index) == self.video_stream)
            .and_then(|s| s.video.as_ref())
    }

    pub fn audio_info(&self) -> Option<&AudioStreamInfo> {
        self.info
            .streams
            .iter()
            .find(|s| Some(s.index) == self.audio_stream)
            .and_then(|s| s.audio.as_ref())
    }

    pub fn video_stream_info(&self) -> Option<&StreamInfo> {
        self.info
            .streams
            .iter()
            .find(|s| Some(s.index) == self.video_stream)
    }

    /// Frame rate the engine derives intervals from (avg → real → 1/tb).
    pub fn effective_frame_rate(&self) -> Ratio {
        let Some(s) = self.video_stream_info() else {
            return Ratio::ZERO;
        };
        let v = s.video.as_ref().unwrap();
        cutline_core::time::effective_frame_rate(v.avg_frame_rate, v.real_frame_rate, s.time_base)
    }

    /// Key-frame pts list of the video stream, ascending, in stream
    /// time-base units. Scanned once (a demux-only pass, no decoding) and
    /// cached; concurrent callers share the scan result.
    pub fn seek_points(&self) -> Result<Arc<Vec<i64>>> {
        {
            let cached = self.seek_points.lock();
            if let Some(pts) = cached.as_ref() {
                return Ok(Arc::clone(pts));
            }
        }

        let stream_index = self.video_stream.ok_or(Error::NotOpened)?;
        let mut ictx = ffmpeg::format::input(&self.url).map_err(|_| Error::NotOpened)?;

        let mut points = Vec::new();
        for result in ictx.packets() {
            let Ok((stream, packet)) = result else { break };
            if stream.index() != stream_index || !packet.is_key() {
                continue;
            }
            if let Some(pts) = packet.pts().or_else(|| packet.dts()) {
                points.push(pts);
            }
        }
        points.sort_unstable();
        points.dedup();
        if points.is_empty() {
            // A stream with no flagged key frames still needs one seek
            // anchor: its declared start.
            points.push(0);
        }
        log::debug!("[parser] '{}' key-frame index: {} entries", self.url, points.len());

        let arc = Arc::new(points);
        *self.seek_points.lock() = Some(Arc::clone(&arc));
        Ok(arc)
    }
}

impl std::fmt::Debug for MediaParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaParser")
            .field("url", &self.url)
            .field("duration", &self.info.duration)
            .finish()
    }
}
