// crates/cutline-core/src/media_info.rs
//
// Immutable per-file stream description, filled in by the media parser.
// Plain data only — the engine passes this around by Arc and never mutates it.

use crate::time::Ratio;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Unknown,
}

#[derive(Clone, Debug)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub codec_name: String,
    pub avg_frame_rate: Ratio,
    pub real_frame_rate: Ratio,
    /// True for single-frame sources (PNG, JPEG, …) that carry no timeline
    /// of their own; the owning clip supplies the duration.
    pub is_image: bool,
    pub is_hdr: bool,
    pub bit_depth: u8,
}

#[derive(Clone, Debug)]
pub struct AudioStreamInfo {
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_format: String,
    pub bit_depth: u8,
}

/// One elementary stream inside a container.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    /// Stream duration in seconds; 0.0 when the container does not say.
    pub duration: f64,
    /// Stream start time in seconds.
    pub start_time: f64,
    pub bitrate: i64,
    pub time_base: Ratio,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
}

/// Everything the engine knows about a media file after probing.
#[derive(Clone, Debug)]
pub struct MediaInfo {
    pub url: String,
    /// Container duration in seconds (longest stream when absent).
    pub duration: f64,
    pub start_time: f64,
    pub bitrate: i64,
    pub streams: Vec<StreamInfo>,
}

impl MediaInfo {
    /// The stream a video reader would attach to, if any.
    pub fn best_video(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.kind == StreamKind::Video)
    }

    pub fn best_audio(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.kind == StreamKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.best_video().is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.best_audio().is_some()
    }

    /// True when the file is a still image (single-frame video, no audio).
    pub fn is_image(&self) -> bool {
        self.best_video()
            .and_then(|s| s.video.as_ref())
            .map(|v| v.is_image)
            .unwrap_or(false)
    }
}
