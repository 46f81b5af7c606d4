// crates/cutline-media/src/ffutil.rs
//
// Shared FFmpeg plumbing: timestamp rescaling, stride-free pixel copies,
// stream-accurate seeking, hardware-decode attachment, PCM frame packing.
//
// Everything here is deliberately free of engine state so the readers, the
// composers and the snapshot generator can all lean on the same primitives.

use anyhow::{anyhow, Context as _};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::frame::audio::Audio as AvAudio;
use ffmpeg::util::frame::video::Video as AvVideo;

use cutline_core::time::Ratio;
use cutline_core::{SampleBlock, VideoFrame};

// ── Timestamps ───────────────────────────────────────────────────────────────

pub fn ratio_of(r: ffmpeg::util::rational::Rational) -> Ratio {
    Ratio::new(r.numerator(), r.denominator())
}

/// Seconds represented by `pts` in `time_base` units.
pub fn pts_to_secs(pts: i64, time_base: Ratio) -> f64 {
    pts as f64 * time_base.as_f64()
}

/// `secs` expressed in `time_base` units, rounded to the nearest tick.
pub fn secs_to_pts(secs: f64, time_base: Ratio) -> i64 {
    if time_base.as_f64() == 0.0 {
        return 0;
    }
    (secs / time_base.as_f64()).round() as i64
}

// ── Seeking ──────────────────────────────────────────────────────────────────

/// Seek `ictx` so the demuxer resumes at the key frame at-or-before
/// `target_pts` (stream time-base units) on `stream_index`.
///
/// A backward seek is the only safe default here: a forward seek lands on
/// the key frame *after* the target, and every source frame between the
/// target and that key frame would be missing from the decode stream. The
/// pre-roll frames a backward seek introduces are discarded by the callers'
/// pts filtering.
///
/// Failure is soft by policy — the demuxer keeps its current position and
/// the caller's pts filter still works; we log and return `false` so call
/// sites that need hard errors can make their own policy.
pub fn seek_stream(
    ictx: &mut ffmpeg::format::context::Input,
    stream_index: usize,
    target_pts: i64,
    label: &str,
) -> bool {
    let rc = unsafe {
        ffmpeg::ffi::avformat_seek_file(
            ictx.as_mut_ptr(),
            stream_index as i32,
            i64::MIN,
            target_pts,
            target_pts,
            ffmpeg::ffi::AVSEEK_FLAG_BACKWARD,
        )
    };
    if rc < 0 {
        log::warn!("[seek] soft-fail in {label} at pts {target_pts}: code {rc}");
        false
    } else {
        true
    }
}

// ── Video frame copies ───────────────────────────────────────────────────────

/// Copy a scaled RGBA `AvVideo` into an owned, stride-free [`VideoFrame`].
///
/// FFmpeg rows may carry padding; the output is packed `w * 4` bytes/row.
pub fn rgba_frame_to_image(frame: &AvVideo, w: u32, h: u32, timestamp: f64) -> VideoFrame {
    let stride = frame.stride(0);
    let raw = frame.data(0);
    let row_bytes = w as usize * 4;
    let mut data = vec![0u8; row_bytes * h as usize];
    for row in 0..h as usize {
        let src = row * stride;
        data[row * row_bytes..(row + 1) * row_bytes]
            .copy_from_slice(&raw[src..src + row_bytes]);
    }
    VideoFrame { width: w, height: h, data, timestamp }
}

/// Wrap an owned RGBA image back into an `AvVideo` (for filter feeding).
pub fn image_to_rgba_frame(image: &VideoFrame) -> AvVideo {
    let mut frame = AvVideo::new(ffmpeg::format::Pixel::RGBA, image.width, image.height);
    let stride = frame.stride(0);
    let row_bytes = image.width as usize * 4;
    let dst = frame.data_mut(0);
    for row in 0..image.height as usize {
        dst[row * stride..row * stride + row_bytes]
            .copy_from_slice(&image.data[row * row_bytes..(row + 1) * row_bytes]);
    }
    frame
}

// ── Hardware decode ──────────────────────────────────────────────────────────

/// Try to attach any available hardware decode device to `codec_ctx`.
///
/// Walks the registered device types and keeps the first one that opens.
/// Returns the device type that opened, or `None` when no device opened —
/// the decoder then runs in software, which is the documented fallback, not
/// an error.
///
/// # Safety
/// `codec_ctx` must point at a live, not-yet-opened `AVCodecContext`.
pub unsafe fn attach_hw_device(
    codec_ctx: *mut ffmpeg::ffi::AVCodecContext,
) -> Option<ffmpeg::ffi::AVHWDeviceType> {
    use ffmpeg::ffi::*;
    let mut kind = AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
    loop {
        kind = av_hwdevice_iterate_types(kind);
        if kind == AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            return None;
        }
        let mut device: *mut AVBufferRef = std::ptr::null_mut();
        let rc = av_hwdevice_ctx_create(&mut device, kind, std::ptr::null(), std::ptr::null_mut(), 0);
        if rc == 0 && !device.is_null() {
            (*codec_ctx).hw_device_ctx = av_buffer_ref(device);
            av_buffer_unref(&mut device);
            log::debug!("[hwdec] attached device type {kind:?}");
            return Some(kind);
        }
    }
}

/// True when `frame` lives in GPU memory and must be transferred before use.
pub fn is_hw_frame(frame: &AvVideo) -> bool {
    unsafe { !(*frame.as_ptr()).hw_frames_ctx.is_null() }
}

/// Download a hardware frame into system memory. The returned frame carries
/// the source's pts.
pub fn transfer_hw_frame(frame: &AvVideo) -> anyhow::Result<AvVideo> {
    let mut sw = AvVideo::empty();
    let rc = unsafe {
        ffmpeg::ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), frame.as_ptr(), 0)
    };
    if rc < 0 {
        return Err(anyhow!("av_hwframe_transfer_data failed: code {rc}"));
    }
    sw.set_pts(frame.pts());
    Ok(sw)
}

// ── PCM frame packing ────────────────────────────────────────────────────────

/// Copy an interleaved-f32 [`SampleBlock`] into a planar-float `AvAudio`
/// frame — the format the mix graph's input buffers expect.
pub fn block_to_fltp_frame(block: &SampleBlock, pts: i64) -> AvAudio {
    use ffmpeg::format::sample::{Sample, Type as SampleType};
    use ffmpeg::util::channel_layout::ChannelLayoutMask;

    let n = block.sample_count();
    let ch = block.channels as usize;
    let layout = match ch {
        1 => ChannelLayoutMask::MONO,
        _ => ChannelLayoutMask::STEREO,
    };
    let mut frame = AvAudio::new(Sample::F32(SampleType::Planar), n, layout);
    frame.set_rate(block.sample_rate);
    frame.set_pts(Some(pts));

    unsafe {
        for c in 0..ch.min(2) {
            let plane = frame.data_mut(c);
            let dst = std::slice::from_raw_parts_mut(plane.as_mut_ptr() as *mut f32, n);
            for (i, d) in dst.iter_mut().enumerate() {
                *d = block.data[i * ch + c];
            }
        }
    }
    frame
}

/// Copy an interleaved-f32 [`SampleBlock`] into a packed-float `AvAudio`
/// frame — a straight memcpy, used to feed effect graphs declared `flt`.
pub fn block_to_flt_frame(block: &SampleBlock, pts: i64) -> AvAudio {
    use ffmpeg::format::sample::{Sample, Type as SampleType};
    use ffmpeg::util::channel_layout::ChannelLayoutMask;

    let n = block.sample_count();
    let ch = block.channels as usize;
    let layout = match ch {
        1 => ChannelLayoutMask::MONO,
        _ => ChannelLayoutMask::STEREO,
    };
    let mut frame = AvAudio::new(Sample::F32(SampleType::Packed), n, layout);
    frame.set_rate(block.sample_rate);
    frame.set_pts(Some(pts));
    unsafe {
        let dst = std::slice::from_raw_parts_mut(frame.data_mut(0).as_mut_ptr() as *mut f32, n * ch);
        dst.copy_from_slice(&block.data);
    }
    frame
}

/// Copy a packed-float `AvAudio` frame (the mix sink's output) into an
/// interleaved [`SampleBlock`].
pub fn flt_frame_to_block(frame: &AvAudio, sample_rate: u32, timestamp: f64) -> anyhow::Result<SampleBlock> {
    use ffmpeg::format::sample::{Sample, Type as SampleType};

    let n = frame.samples();
    let ch = frame.ch_layout().channels() as usize;
    let mut data = vec![0.0f32; n * ch];
    match frame.format() {
        Sample::F32(SampleType::Packed) => unsafe {
            let src = std::slice::from_raw_parts(frame.data(0).as_ptr() as *const f32, n * ch);
            data.copy_from_slice(src);
        },
        Sample::F32(SampleType::Planar) => unsafe {
            for c in 0..ch {
                let plane = std::slice::from_raw_parts(frame.data(c).as_ptr() as *const f32, n);
                for i in 0..n {
                    data[i * ch + c] = plane[i];
                }
            }
        },
        other => {
            return Err(anyhow!("unexpected sink sample format {other:?}"))
                .context("flt_frame_to_block");
        }
    }
    Ok(SampleBlock {
        channels: ch as u16,
        sample_rate,
        data,
        timestamp,
    })
}
