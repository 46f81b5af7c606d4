// crates/cutline-media/src/filter/mod.rs
//
// Per-clip and per-composer filters.
//
// `VideoFilter` is the plug-in seam: a clip may carry one user-supplied
// filter that runs between the source reader and the transform chain.
// `VideoTransformFilter` (crop → scale → rotate → position) and
// `AudioEffectFilter` (codec-library filter-graph chain) are the two
// in-tree implementations of the fixed pipeline stages.

pub mod audio_effect;
pub mod transform;

pub use audio_effect::{AudioEffectFilter, AudioEffectParams};
pub use transform::{ScaleType, TransformParams, VideoTransformFilter};

use cutline_core::VideoFrame;

/// A user-supplied per-clip video effect.
///
/// Receives the clip-local position so time-varying effects can animate.
/// Implementations run on the composer's mixing thread — keep them
/// allocation-light.
pub trait VideoFilter: Send {
    fn name(&self) -> &'static str;

    fn apply(&mut self, frame: VideoFrame, pos_ms: i64) -> VideoFrame;

    /// Clone into a new box; required so clips survive a composer clone.
    fn clone_box(&self) -> Box<dyn VideoFilter>;
}

impl Clone for Box<dyn VideoFilter> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
