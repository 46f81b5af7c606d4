// crates/cutline-media/src/filter/transform.rs
//
// VideoTransformFilter: the fixed geometry chain every video clip's output
// runs through before track composition.
//
//   crop → scale → rotate → position
//
// Stage order is part of the contract — crop offsets are in *input* pixels,
// the scale stage decides how the (cropped) image meets the output canvas,
// rotation expands to the diagonal bounding box around the image centre,
// and the position stage overlays the result onto a transparent canvas with
// the rotation pivot at the canvas centre plus the user offset. Any stage
// whose parameters are identity is skipped.
//
// Parameters may be driven by key-point curves: `set_key_point` attaches a
// bundle, and each `apply` samples the curves at the frame's position and
// overrides the matching static parameter.

use cutline_core::blend::alpha_over;
use cutline_core::curves::CurveBundle;
use cutline_core::raster::{crop_border, resize_bilinear, rotate_rgba};
use cutline_core::VideoFrame;

use crate::error::{Error, Result};

/// How the (cropped, user-scaled) image meets the output canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ScaleType {
    /// Largest size that fits entirely inside the canvas.
    #[default]
    Fit,
    /// Keep source pixels 1:1; overflow is clipped by the position stage.
    Crop,
    /// Smallest size that covers the whole canvas.
    Fill,
    /// Distort to exactly the canvas size.
    Stretch,
}

/// The static parameter set. Every field has an identity default.
#[derive(Clone, Copy, Debug)]
pub struct TransformParams {
    pub crop_l: u32,
    pub crop_t: u32,
    pub crop_r: u32,
    pub crop_b: u32,
    pub scale_type: ScaleType,
    pub scale_h: f32,
    pub scale_v: f32,
    /// Degrees, counter-clockwise positive.
    pub rotation: f32,
    /// Offset of the image centre from the canvas centre, output pixels.
    pub pos_off_h: i32,
    pub pos_off_v: i32,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            crop_l: 0,
            crop_t: 0,
            crop_r: 0,
            crop_b: 0,
            scale_type: ScaleType::Fit,
            scale_h: 1.0,
            scale_v: 1.0,
            rotation: 0.0,
            pos_off_h: 0,
            pos_off_v: 0,
        }
    }
}

impl TransformParams {
    fn has_crop(&self) -> bool {
        self.crop_l != 0 || self.crop_t != 0 || self.crop_r != 0 || self.crop_b != 0
    }

    fn has_rotation(&self) -> bool {
        self.rotation.rem_euclid(360.0).abs() > f32::EPSILON
    }
}

/// Base scale factors that land the image on the canvas per `scale_type`,
/// before user factors are applied.
pub(crate) fn fit_scale(
    scale_type: ScaleType,
    in_w: u32,
    in_h: u32,
    out_w: u32,
    out_h: u32,
) -> (f32, f32) {
    if in_w == 0 || in_h == 0 {
        return (1.0, 1.0);
    }
    let rw = out_w as f32 / in_w as f32;
    let rh = out_h as f32 / in_h as f32;
    match scale_type {
        ScaleType::Fit => {
            let s = rw.min(rh);
            (s, s)
        }
        ScaleType::Crop => (1.0, 1.0),
        ScaleType::Fill => {
            let s = rw.max(rh);
            (s, s)
        }
        ScaleType::Stretch => (rw, rh),
    }
}

#[derive(Clone)]
pub struct VideoTransformFilter {
    out_w: u32,
    out_h: u32,
    params: TransformParams,
    curves: Option<CurveBundle>,
}

impl VideoTransformFilter {
    pub fn new(out_w: u32, out_h: u32) -> Result<Self> {
        if out_w == 0 || out_h == 0 {
            return Err(Error::invalid("transform canvas must be non-zero"));
        }
        Ok(Self { out_w, out_h, params: TransformParams::default(), curves: None })
    }

    pub fn params(&self) -> &TransformParams {
        &self.params
    }

    /// The same parameters and curves, retargeted at a new canvas.
    pub(crate) fn clone_with_canvas(&self, out_w: u32, out_h: u32) -> Self {
        Self { out_w, out_h, params: self.params, curves: self.curves.clone() }
    }

    pub fn set_params(&mut self, params: TransformParams) -> Result<()> {
        if params.scale_h <= 0.0 || params.scale_v <= 0.0 {
            return Err(Error::invalid("scale factors must be positive"));
        }
        self.params = params;
        Ok(())
    }

    pub fn set_crop(&mut self, l: u32, t: u32, r: u32, b: u32) {
        self.params.crop_l = l;
        self.params.crop_t = t;
        self.params.crop_r = r;
        self.params.crop_b = b;
    }

    pub fn set_scale_type(&mut self, scale_type: ScaleType) {
        self.params.scale_type = scale_type;
    }

    pub fn set_scale(&mut self, h: f32, v: f32) -> Result<()> {
        if h <= 0.0 || v <= 0.0 {
            return Err(Error::invalid("scale factors must be positive"));
        }
        self.params.scale_h = h;
        self.params.scale_v = v;
        Ok(())
    }

    pub fn set_rotation(&mut self, degrees: f32) {
        self.params.rotation = degrees;
    }

    pub fn set_position_offset(&mut self, h: i32, v: i32) {
        self.params.pos_off_h = h;
        self.params.pos_off_v = v;
    }

    /// Attach curve-driven parameters. Recognised names: `crop_l`,
    /// `crop_t`, `crop_r`, `crop_b`, `scale`, `scale_h`, `scale_v`,
    /// `rotation`, `pos_off_h`, `pos_off_v`. Unknown names are logged by
    /// the bundle and ignored.
    pub fn set_key_point(&mut self, curves: CurveBundle) {
        self.curves = Some(curves);
    }

    /// Parameters effective at `pos_ms`, with curve overrides applied.
    fn params_at(&self, pos_ms: i64) -> TransformParams {
        let mut p = self.params;
        let Some(curves) = &self.curves else { return p };
        if let Some(v) = curves.sample("crop_l", pos_ms) {
            p.crop_l = v.max(0.0) as u32;
        }
        if let Some(v) = curves.sample("crop_t", pos_ms) {
            p.crop_t = v.max(0.0) as u32;
        }
        if let Some(v) = curves.sample("crop_r", pos_ms) {
            p.crop_r = v.max(0.0) as u32;
        }
        if let Some(v) = curves.sample("crop_b", pos_ms) {
            p.crop_b = v.max(0.0) as u32;
        }
        if let Some(v) = curves.sample("scale", pos_ms) {
            p.scale_h = v.max(0.001);
            p.scale_v = v.max(0.001);
        }
        if let Some(v) = curves.sample("scale_h", pos_ms) {
            p.scale_h = v.max(0.001);
        }
        if let Some(v) = curves.sample("scale_v", pos_ms) {
            p.scale_v = v.max(0.001);
        }
        if let Some(v) = curves.sample("rotation", pos_ms) {
            p.rotation = v;
        }
        if let Some(v) = curves.sample("pos_off_h", pos_ms) {
            p.pos_off_h = v as i32;
        }
        if let Some(v) = curves.sample("pos_off_v", pos_ms) {
            p.pos_off_v = v as i32;
        }
        p
    }

    /// Run the chain on one frame. Empty frames pass through untouched.
    pub fn apply(&self, frame: VideoFrame, pos_ms: i64) -> VideoFrame {
        if frame.is_empty() {
            return frame;
        }
        let p = self.params_at(pos_ms);
        let timestamp = frame.timestamp;
        let mut img = frame;

        if p.has_crop() {
            crop_border(&mut img, p.crop_l, p.crop_t, p.crop_r, p.crop_b);
        }

        let (base_x, base_y) = fit_scale(p.scale_type, img.width, img.height, self.out_w, self.out_h);
        let sx = base_x * p.scale_h;
        let sy = base_y * p.scale_v;
        let dst_w = ((img.width as f32 * sx).round() as u32).max(1);
        let dst_h = ((img.height as f32 * sy).round() as u32).max(1);
        if dst_w != img.width || dst_h != img.height {
            img = resize_bilinear(&img, dst_w, dst_h);
        }

        if p.has_rotation() {
            img = rotate_rgba(&img, p.rotation);
        }

        // Fast path: a Fit-scaled, unrotated, unmoved image that already
        // matches the canvas needs no compositing pass.
        if img.width == self.out_w
            && img.height == self.out_h
            && p.pos_off_h == 0
            && p.pos_off_v == 0
        {
            img.timestamp = timestamp;
            return img;
        }

        let mut canvas = VideoFrame::transparent(self.out_w, self.out_h, timestamp);
        let x = (self.out_w as i64 - img.width as i64) / 2 + p.pos_off_h as i64;
        let y = (self.out_h as i64 - img.height as i64) / 2 + p.pos_off_v as i64;
        alpha_over(&mut canvas, &img, x, y);
        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgba: [u8; 4]) -> VideoFrame {
        let mut f = VideoFrame::transparent(w, h, 0.0);
        for px in f.data.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
        f
    }

    #[test]
    fn fit_scale_modes() {
        // 200×100 into 100×100:
        assert_eq!(fit_scale(ScaleType::Fit, 200, 100, 100, 100), (0.5, 0.5));
        assert_eq!(fit_scale(ScaleType::Fill, 200, 100, 100, 100), (1.0, 1.0));
        assert_eq!(fit_scale(ScaleType::Crop, 200, 100, 100, 100), (1.0, 1.0));
        assert_eq!(fit_scale(ScaleType::Stretch, 200, 100, 100, 100), (0.5, 1.0));
    }

    #[test]
    fn identity_transform_fits_to_canvas() {
        let f = VideoTransformFilter::new(8, 8).unwrap();
        let out = f.apply(solid(8, 8, [1, 2, 3, 255]), 0);
        assert_eq!((out.width, out.height), (8, 8));
        assert_eq!(&out.data[0..4], &[1, 2, 3, 255]);
    }

    #[test]
    fn fit_centres_widescreen_input() {
        let f = VideoTransformFilter::new(8, 8).unwrap();
        let out = f.apply(solid(16, 8, [255, 0, 0, 255]), 0);
        assert_eq!((out.width, out.height), (8, 8));
        // Image lands as 8×4, vertically centred: rows 0–1 and 6–7 transparent.
        assert_eq!(out.row(0)[3], 0);
        assert_eq!(out.row(4)[3], 255);
        assert_eq!(out.row(7)[3], 0);
    }

    #[test]
    fn position_offset_moves_image() {
        let mut f = VideoTransformFilter::new(8, 8).unwrap();
        f.set_scale_type(ScaleType::Crop);
        f.set_position_offset(2, 0);
        let out = f.apply(solid(4, 4, [0, 255, 0, 255]), 0);
        // 4×4 at centre(2,2) + offset 2 → x in [4,8).
        assert_eq!(out.row(3)[3 * 4 + 3], 0); // x=3 transparent
        assert_eq!(out.row(3)[4 * 4 + 3], 255); // x=4 painted
    }

    #[test]
    fn curves_override_static_params() {
        use cutline_core::curves::{Curve, KeyPoint};
        let mut f = VideoTransformFilter::new(8, 8).unwrap();
        f.set_scale_type(ScaleType::Crop);
        let mut bundle = CurveBundle::new();
        bundle.insert(
            "pos_off_h",
            Curve::new(vec![
                KeyPoint { pos_ms: 0, value: 0.0 },
                KeyPoint { pos_ms: 1000, value: 2.0 },
            ]),
        );
        f.set_key_point(bundle);
        let p0 = f.params_at(0);
        let p1 = f.params_at(1000);
        assert_eq!(p0.pos_off_h, 0);
        assert_eq!(p1.pos_off_h, 2);
    }

    #[test]
    fn empty_frame_passes_through() {
        let f = VideoTransformFilter::new(8, 8).unwrap();
        let out = f.apply(VideoFrame::empty(1.5), 0);
        assert!(out.is_empty());
        assert_eq!(out.timestamp, 1.5);
    }

    #[test]
    fn rejects_degenerate_canvas() {
        assert!(VideoTransformFilter::new(0, 8).is_err());
    }

    #[test]
    fn rejects_nonpositive_scale() {
        let mut f = VideoTransformFilter::new(8, 8).unwrap();
        assert!(f.set_scale(0.0, 1.0).is_err());
    }
}
