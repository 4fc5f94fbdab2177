// ============================================================================
// TRANSFORM OPERATIONS: crop, resize, rotate, flip for images and canvases
// ============================================================================
//
// Transforms change dimensions, so they are never masked. The image-level
// functions are pure; the canvas-level ones apply the same transform to every
// layer in parallel and update the tracked canvas size.

use std::fmt;
use std::str::FromStr;

use image::{RgbaImage, imageops};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{premultiply, unpremultiply};
use crate::canvas::{CanvasState, MAX_CANVAS_DIM};
use crate::error::{Result, StudioError};

/// Interpolation method for resize operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Lanczos3,
}

impl Interpolation {
    pub fn name(&self) -> &'static str {
        match self {
            Interpolation::Nearest => "nearest",
            Interpolation::Bilinear => "bilinear",
            Interpolation::Bicubic => "bicubic",
            Interpolation::Lanczos3 => "lanczos3",
        }
    }

    pub fn all() -> &'static [Interpolation] {
        &[
            Interpolation::Nearest,
            Interpolation::Bilinear,
            Interpolation::Bicubic,
            Interpolation::Lanczos3,
        ]
    }

    pub fn to_filter(&self) -> imageops::FilterType {
        match self {
            Interpolation::Nearest => imageops::FilterType::Nearest,
            Interpolation::Bilinear => imageops::FilterType::Triangle,
            Interpolation::Bicubic => imageops::FilterType::CatmullRom,
            Interpolation::Lanczos3 => imageops::FilterType::Lanczos3,
        }
    }
}

impl FromStr for Interpolation {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" | "point" => Ok(Interpolation::Nearest),
            "bilinear" | "linear" | "triangle" => Ok(Interpolation::Bilinear),
            "bicubic" | "cubic" | "catmullrom" => Ok(Interpolation::Bicubic),
            "lanczos3" | "lanczos" => Ok(Interpolation::Lanczos3),
            other => Err(StudioError::invalid("interpolation", format!("unknown method '{other}'"))),
        }
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Clockwise quarter-turn rotations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }

    /// Accepts any multiple of 90 except full turns; negative values turn
    /// counter-clockwise.
    pub fn from_degrees(deg: i32) -> Result<Self> {
        match deg.rem_euclid(360) {
            90 if deg % 90 == 0 => Ok(Rotation::Cw90),
            180 if deg % 90 == 0 => Ok(Rotation::Cw180),
            270 if deg % 90 == 0 => Ok(Rotation::Cw270),
            _ => Err(StudioError::invalid("rotate", format!("{deg} is not 90, 180 or 270"))),
        }
    }

    /// Dimensions after rotating a `w x h` image.
    pub fn rotated_size(&self, w: u32, h: u32) -> (u32, u32) {
        match self {
            Rotation::Cw180 => (w, h),
            Rotation::Cw90 | Rotation::Cw270 => (h, w),
        }
    }
}

fn check_dims(op: &str, w: u32, h: u32) -> Result<()> {
    if w == 0 || h == 0 {
        return Err(StudioError::invalid(op, format!("target size {w}x{h} is empty")));
    }
    if w > MAX_CANVAS_DIM || h > MAX_CANVAS_DIM {
        return Err(StudioError::LimitExceeded {
            what: "canvas size",
            detail: format!("{w}x{h} (max {MAX_CANVAS_DIM} per side)"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
//  Image transforms
// ---------------------------------------------------------------------------

/// Cut out the `width x height` rectangle at (`x`, `y`). The rectangle is
/// clipped to the image; a rectangle that misses the image entirely is an
/// error.
pub fn crop(src: &RgbaImage, x: u32, y: u32, width: u32, height: u32) -> Result<RgbaImage> {
    if src.width() == 0 || src.height() == 0 {
        return Ok(src.clone());
    }
    let w = width.min(src.width().saturating_sub(x));
    let h = height.min(src.height().saturating_sub(y));
    if w == 0 || h == 0 {
        return Err(StudioError::invalid(
            "crop",
            format!("{width}x{height}+{x}+{y} lies outside {}x{}", src.width(), src.height()),
        ));
    }
    Ok(imageops::crop_imm(src, x, y, w, h).to_image())
}

pub fn resize(src: &RgbaImage, width: u32, height: u32, interp: Interpolation) -> Result<RgbaImage> {
    check_dims("resize", width, height)?;
    if src.width() == 0 || src.height() == 0 {
        return Ok(src.clone());
    }
    if src.dimensions() == (width, height) {
        return Ok(src.clone());
    }
    Ok(imageops::resize(src, width, height, interp.to_filter()))
}

/// Integer upscale by `factor` (1..=4).
pub fn upscale(src: &RgbaImage, factor: u32, interp: Interpolation) -> Result<RgbaImage> {
    if !(1..=4).contains(&factor) {
        return Err(StudioError::invalid("upscale", format!("factor {factor} outside 1..=4")));
    }
    if src.width() == 0 || src.height() == 0 {
        return Ok(src.clone());
    }
    resize(src, src.width() * factor, src.height() * factor, interp)
}

pub fn rotate(src: &RgbaImage, rotation: Rotation) -> RgbaImage {
    match rotation {
        Rotation::Cw90 => imageops::rotate90(src),
        Rotation::Cw180 => imageops::rotate180(src),
        Rotation::Cw270 => imageops::rotate270(src),
    }
}

/// Rotate clockwise by any angle. Whole quarter turns are lossless; other
/// angles resample bilinearly into the rotated bounding box, with uncovered
/// corners left transparent.
pub fn rotate_by(src: &RgbaImage, degrees: f32) -> Result<RgbaImage> {
    if !degrees.is_finite() {
        return Err(StudioError::invalid("rotate", format!("{degrees} is not a finite angle")));
    }
    let quarters = degrees / 90.0;
    if quarters.fract() == 0.0 {
        return Ok(match (quarters as i64).rem_euclid(4) {
            0 => src.clone(),
            1 => rotate(src, Rotation::Cw90),
            2 => rotate(src, Rotation::Cw180),
            _ => rotate(src, Rotation::Cw270),
        });
    }
    if src.width() == 0 || src.height() == 0 {
        return Ok(src.clone());
    }

    let (sin, cos) = degrees.to_radians().sin_cos();
    let (w, h) = (src.width() as f32, src.height() as f32);
    // Shave float noise so a 10x10 turned by 45 degrees is 15x15, not 16x16.
    let fit = |v: f32| (v - 1e-3).ceil().max(1.0) as u32;
    let out_w = fit(w * cos.abs() + h * sin.abs());
    let out_h = fit(w * sin.abs() + h * cos.abs());
    check_dims("rotate", out_w, out_h)?;

    let (sw, sh) = (src.width() as usize, src.height() as usize);
    let buf = premultiply(src.as_raw());
    let (scx, scy) = (w / 2.0, h / 2.0);
    let (dcx, dcy) = (out_w as f32 / 2.0, out_h as f32 / 2.0);

    let mut out = RgbaImage::new(out_w, out_h);
    out.par_chunks_mut(out_w as usize * 4).enumerate().for_each(|(y, row)| {
        let dy = y as f32 + 0.5 - dcy;
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            let dx = x as f32 + 0.5 - dcx;
            // Inverse rotation back into source pixel space.
            let sx = dx * cos + dy * sin + scx - 0.5;
            let sy = -dx * sin + dy * cos + scy - 0.5;
            px.copy_from_slice(&unpremultiply(sample_or_clear(&buf, sw, sh, sx, sy)));
        }
    });
    Ok(out)
}

/// Bilinear sample of a premultiplied buffer; outside the image is clear.
fn sample_or_clear(buf: &[f32], w: usize, h: usize, fx: f32, fy: f32) -> [f32; 4] {
    let x0 = fx.floor() as i64;
    let y0 = fy.floor() as i64;
    let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);
    let texel = |x: i64, y: i64| -> [f32; 4] {
        if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
            return [0.0; 4];
        }
        let i = (y as usize * w + x as usize) * 4;
        [buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]
    };
    let (p00, p10, p01, p11) = (texel(x0, y0), texel(x0 + 1, y0), texel(x0, y0 + 1), texel(x0 + 1, y0 + 1));
    let mut out = [0.0f32; 4];
    for c in 0..4 {
        out[c] = p00[c] * (1.0 - tx) * (1.0 - ty) + p10[c] * tx * (1.0 - ty) + p01[c] * (1.0 - tx) * ty + p11[c] * tx * ty;
    }
    out
}

/// Mirror left and right.
pub fn flip_horizontal(src: &RgbaImage) -> RgbaImage {
    imageops::flip_horizontal(src)
}

/// Mirror top and bottom.
pub fn flip_vertical(src: &RgbaImage) -> RgbaImage {
    imageops::flip_vertical(src)
}

// ---------------------------------------------------------------------------
//  Whole-canvas transforms (affect ALL layers)
// ---------------------------------------------------------------------------

/// Apply `op` to every layer in parallel. All layers must come back the same
/// size, which becomes the new canvas size. Nothing is changed on error.
pub fn transform_canvas<F>(state: &mut CanvasState, op: F) -> Result<()>
where
    F: Fn(&RgbaImage) -> Result<RgbaImage> + Sync,
{
    if state.layers.is_empty() {
        let probe = op(&RgbaImage::new(state.width, state.height))?;
        (state.width, state.height) = probe.dimensions();
        return Ok(());
    }
    let new_pixels = state
        .layers
        .par_iter()
        .map(|layer| op(&layer.pixels))
        .collect::<Result<Vec<_>>>()?;

    let dims = new_pixels[0].dimensions();
    if let Some(bad) = new_pixels.iter().find(|p| p.dimensions() != dims) {
        return Err(StudioError::size_mismatch(dims, bad.dimensions()));
    }
    for (layer, px) in state.layers.iter_mut().zip(new_pixels) {
        layer.pixels = px;
    }
    (state.width, state.height) = dims;
    tracing::debug!(width = dims.0, height = dims.1, "canvas transformed");
    Ok(())
}

pub fn crop_canvas(state: &mut CanvasState, x: u32, y: u32, width: u32, height: u32) -> Result<()> {
    transform_canvas(state, |img| crop(img, x, y, width, height))
}

/// Resize the entire image (all layers) to new dimensions with given interpolation.
pub fn resize_canvas(state: &mut CanvasState, width: u32, height: u32, interp: Interpolation) -> Result<()> {
    check_dims("resize", width, height)?;
    transform_canvas(state, |img| {
        if img.width() == 0 || img.height() == 0 {
            return Ok(RgbaImage::new(width, height));
        }
        resize(img, width, height, interp)
    })
}

pub fn rotate_canvas(state: &mut CanvasState, rotation: Rotation) -> Result<()> {
    transform_canvas(state, |img| Ok(rotate(img, rotation)))
}

/// Free rotation of every layer; the canvas grows to fit.
pub fn rotate_canvas_by(state: &mut CanvasState, degrees: f32) -> Result<()> {
    transform_canvas(state, |img| rotate_by(img, degrees))
}

pub fn flip_canvas_horizontal(state: &mut CanvasState) -> Result<()> {
    transform_canvas(state, |img| Ok(flip_horizontal(img)))
}

pub fn flip_canvas_vertical(state: &mut CanvasState) -> Result<()> {
    transform_canvas(state, |img| Ok(flip_vertical(img)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Layer;
    use image::Rgba;

    fn gradient(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| Rgba([x as u8, y as u8, 0, 255]))
    }

    #[test]
    fn crop_clips_to_image() {
        let img = gradient(10, 8);
        let out = crop(&img, 6, 4, 10, 10).unwrap();
        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(out.get_pixel(0, 0).0, [6, 4, 0, 255]);
        assert!(crop(&img, 12, 0, 2, 2).is_err());
    }

    #[test]
    fn upscale_factor_bounds() {
        let img = gradient(5, 3);
        assert_eq!(upscale(&img, 2, Interpolation::Bilinear).unwrap().dimensions(), (10, 6));
        assert_eq!(upscale(&img, 1, Interpolation::Nearest).unwrap(), img);
        assert!(upscale(&img, 5, Interpolation::Bilinear).is_err());
        assert!(upscale(&img, 0, Interpolation::Bilinear).is_err());
    }

    #[test]
    fn resize_rejects_empty_and_oversized_targets() {
        let img = gradient(4, 4);
        assert!(resize(&img, 0, 4, Interpolation::Bicubic).is_err());
        assert!(matches!(
            resize(&img, MAX_CANVAS_DIM + 1, 4, Interpolation::Nearest),
            Err(StudioError::LimitExceeded { .. })
        ));
    }

    /// Four quarter turns and two flips are identities.
    #[test]
    fn rotations_and_flips_round_trip() {
        let img = gradient(7, 3);
        let mut r = img.clone();
        for _ in 0..4 {
            r = rotate(&r, Rotation::Cw90);
        }
        assert_eq!(r, img);
        assert_eq!(rotate(&img, Rotation::Cw90).dimensions(), (3, 7));
        assert_eq!(flip_horizontal(&flip_horizontal(&img)), img);
        assert_eq!(flip_vertical(&img).get_pixel(0, 0).0, [0, 2, 0, 255]);
    }

    #[test]
    fn rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(90).unwrap(), Rotation::Cw90);
        assert_eq!(Rotation::from_degrees(-90).unwrap(), Rotation::Cw270);
        assert_eq!(Rotation::from_degrees(540).unwrap(), Rotation::Cw180);
        assert!(Rotation::from_degrees(45).is_err());
        assert!(Rotation::from_degrees(360).is_err());
    }

    #[test]
    fn quarter_turns_by_angle_are_lossless() {
        let img = gradient(7, 3);
        assert_eq!(rotate_by(&img, 90.0).unwrap(), rotate(&img, Rotation::Cw90));
        assert_eq!(rotate_by(&img, -90.0).unwrap(), rotate(&img, Rotation::Cw270));
        assert_eq!(rotate_by(&img, 360.0).unwrap(), img);
        assert_eq!(rotate_by(&img, 0.0).unwrap(), img);
        assert!(rotate_by(&img, f32::NAN).is_err());
    }

    /// A 45 degree turn grows the canvas to the bounding box and leaves the
    /// corners clear while the middle keeps the source colour.
    #[test]
    fn free_rotation_expands_canvas() {
        let img = RgbaImage::from_pixel(10, 10, Rgba([200, 40, 40, 255]));
        let out = rotate_by(&img, 45.0).unwrap();
        assert_eq!(out.dimensions(), (15, 15));
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 0]);
        assert_eq!(out.get_pixel(14, 14).0, [0, 0, 0, 0]);
        assert_eq!(out.get_pixel(7, 7).0, [200, 40, 40, 255]);

        let wide = rotate_by(&gradient(20, 4), 30.0).unwrap();
        assert_eq!(wide.dimensions(), (20, 14));
    }

    #[test]
    fn canvas_free_rotation_resizes_every_layer() {
        let mut state = CanvasState::from_image(gradient(10, 10));
        state.add_layer(Layer::new("top", 10, 10, Rgba([9, 9, 9, 255]))).unwrap();
        rotate_canvas_by(&mut state, -45.0).unwrap();
        assert_eq!((state.width, state.height), (15, 15));
        assert!(state.layers.iter().all(|l| l.pixels.dimensions() == (15, 15)));
    }

    #[test]
    fn interpolation_names_parse() {
        for i in Interpolation::all() {
            assert_eq!(i.name().parse::<Interpolation>().unwrap(), *i);
        }
        assert_eq!("Linear".parse::<Interpolation>().unwrap(), Interpolation::Bilinear);
        assert!("sinc".parse::<Interpolation>().is_err());
    }

    #[test]
    fn canvas_rotate_swaps_size_for_all_layers() {
        let mut state = CanvasState::from_image(gradient(6, 2));
        state.add_layer(Layer::new("top", 6, 2, Rgba([1, 2, 3, 4]))).unwrap();
        rotate_canvas(&mut state, Rotation::Cw270).unwrap();
        assert_eq!((state.width, state.height), (2, 6));
        assert!(state.layers.iter().all(|l| l.pixels.dimensions() == (2, 6)));
    }

    #[test]
    fn canvas_resize_without_layers_updates_size() {
        let mut state = CanvasState::new(10, 10);
        resize_canvas(&mut state, 20, 5, Interpolation::Bilinear).unwrap();
        assert_eq!((state.width, state.height), (20, 5));
    }

    #[test]
    fn failed_canvas_crop_leaves_state_alone() {
        let mut state = CanvasState::from_image(gradient(4, 4));
        assert!(crop_canvas(&mut state, 9, 9, 1, 1).is_err());
        assert_eq!((state.width, state.height), (4, 4));
    }
}
