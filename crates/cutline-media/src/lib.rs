// crates/cutline-media/src/lib.rs
//
// The cutline engine: everything that touches FFmpeg or spawns a thread.
//
// Layering, bottom-up:
//   parser    — probe one file, expose MediaInfo + key-frame index
//   reader    — per-file decode pipelines (video / audio / still image)
//   clip      — a trimmed window of one source placed on the timeline
//   overlap   — where two clips on a track intersect; owns the transition
//   track     — ordered clips + derived overlaps + read cursor
//   composer  — N tracks → one frame/sample stream, on a mixing worker
//   filter    — audio effect chain, video transform chain
//   snapshot  — sparse thumbnail service over a single video
//   overview  — whole-file waveform scan
//   encoder   — the pull surface an external encoder drains

pub mod clip;
pub mod composer;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod overlap;
pub mod overview;
pub mod parser;
pub mod reader;
pub mod snapshot;
pub mod sysutil;
pub mod track;

mod ffutil;

pub use clip::{AudioClip, VideoClip};
pub use composer::{AudioComposer, ComposedFrame, VideoComposer};
pub use error::{Error, Result};
pub use filter::{AudioEffectFilter, AudioEffectParams, ScaleType, VideoTransformFilter};
pub use overview::{Overview, OverviewScanner, PeakPair};
pub use parser::MediaParser;
pub use reader::{AudioOutputSpec, AudioReader, ImageReader, Interp, VideoOutputSpec, VideoReader};
pub use snapshot::{Snapshot, SnapshotConfig, SnapshotGenerator, Viewer};
pub use sysutil::{initialize, release};
pub use track::{AudioTrack, VideoTrack};

#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
