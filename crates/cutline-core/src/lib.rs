// crates/cutline-core/src/lib.rs
//
// Pure data and math for the cutline engine. No FFmpeg, no threads —
// everything in this crate is constructible in a unit test with literals.

pub mod blend;
pub mod curves;
pub mod frame;
pub mod ids;
pub mod media_info;
pub mod raster;
pub mod time;
pub mod transitions;

pub use frame::{CorrelativeFrame, Phase, SampleBlock, VideoFrame};
pub use ids::{Id, NIL_ID};
pub use media_info::{AudioStreamInfo, MediaInfo, StreamInfo, StreamKind, VideoStreamInfo};
pub use time::Ratio;
