// crates/cutline-media/src/reader/image.rs
//
// ImageReader: still-image sources (PNG, JPEG, single-frame streams).
//
// No seek, no direction, no worker threads — the single frame is decoded
// and converted once at start and served for every position. The owning
// clip supplies the duration, so EOF is simply "position past what the
// caller declared".

use std::sync::Arc;

use anyhow::{anyhow, Context as _};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::scaling::Context as SwsContext;
use ffmpeg::util::frame::video::Video as AvVideo;

use cutline_core::VideoFrame;

use crate::error::{Error, Result};
use crate::ffutil;
use crate::parser::MediaParser;
use crate::reader::Interp;

pub struct ImageReader {
    parser: Arc<MediaParser>,
    out: Option<(u32, u32, Interp)>,
    image: Option<VideoFrame>,
}

impl ImageReader {
    pub fn from_parser(parser: Arc<MediaParser>) -> Result<Self> {
        if parser.video_stream_index().is_none() {
            return Err(Error::NotOpened);
        }
        Ok(Self { parser, out: None, image: None })
    }

    pub fn configure(&mut self, out_w: u32, out_h: u32, interp: Interp) -> Result<()> {
        if out_w == 0 || out_h == 0 {
            return Err(Error::invalid("output size must be non-zero"));
        }
        self.out = Some((out_w, out_h, interp));
        self.image = None; // force redecode at the new geometry
        Ok(())
    }

    /// Decode and convert the single frame. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.image.is_some() {
            return Ok(());
        }
        let (w, h, interp) = self.out.ok_or(Error::NotConfigured)?;
        let image = decode_still(&self.parser, w, h, interp)
            .map_err(|e| Error::Worker(format!("decode still image: {e:#}")))?;
        self.image = Some(image);
        Ok(())
    }

    /// The converted image, regardless of position. `eof` is decided by the
    /// owning clip against its own duration.
    pub fn read_video_frame(&self, pos_secs: f64) -> Result<VideoFrame> {
        let img = self.image.as_ref().ok_or(Error::NotStarted)?;
        let mut out = img.clone();
        out.timestamp = pos_secs;
        Ok(out)
    }
}

fn decode_still(parser: &MediaParser, out_w: u32, out_h: u32, interp: Interp) -> anyhow::Result<VideoFrame> {
    let stream_index = parser
        .video_stream_index()
        .ok_or_else(|| anyhow!("no video stream"))?;

    let mut ictx = ffmpeg::format::input(&parser.url().to_string()).context("open image")?;
    let stream = ictx
        .stream(stream_index)
        .ok_or_else(|| anyhow!("stream vanished"))?;
    let ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("decoder context")?;
    let mut decoder = ctx.decoder().video().context("open image decoder")?;

    let mut decoded = AvVideo::empty();
    let mut got = false;
    for result in ictx.packets() {
        let Ok((s, packet)) = result else { break };
        if s.index() != stream_index {
            continue;
        }
        if decoder.send_packet(&packet).is_err() {
            continue;
        }
        if decoder.receive_frame(&mut decoded).is_ok() {
            got = true;
            break;
        }
    }
    if !got {
        // Some codecs need the drain to hand over the only frame.
        let _ = decoder.send_eof();
        got = decoder.receive_frame(&mut decoded).is_ok();
    }
    if !got {
        return Err(anyhow!("no frame decoded from '{}'", parser.url()));
    }

    let mut scaler = SwsContext::get(
        decoded.format(),
        decoded.width(),
        decoded.height(),
        ffmpeg::format::Pixel::RGBA,
        out_w,
        out_h,
        interp.sws_flags(),
    )
    .context("create scaler")?;
    let mut rgba = AvVideo::empty();
    scaler.run(&decoded, &mut rgba).context("sws_scale")?;
    Ok(ffutil::rgba_frame_to_image(&rgba, out_w, out_h, 0.0))
}
