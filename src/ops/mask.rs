// ============================================================================
// REGION MASKS: fractional shapes that restrict where a filter lands
// ============================================================================
//
// Every shape is given in fractions of the image extent, so one shape can be
// rasterised against inputs of any size.

use image::{GrayImage, Luma, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StudioError};

/// A rectangle expressed in fractions of the image extent.
///
/// Coordinates are clamped to `0.0..=1.0` and reordered so that
/// `x0 <= x1` and `y0 <= y1`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Region {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        let c = |v: f32| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        let (x0, x1) = (c(x0), c(x1));
        let (y0, y1) = (c(y0), c(y1));
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    /// The centred region covering `fraction` of each axis,
    /// e.g. `center(0.8)` spans 0.1..0.9.
    pub fn center(fraction: f32) -> Self {
        let margin = (1.0 - fraction.clamp(0.0, 1.0)) / 2.0;
        Self::new(margin, margin, 1.0 - margin, 1.0 - margin)
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    /// Pixel bounds `(x0, y0, x1, y1)`, end-exclusive.
    pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let px = |f: f32, n: u32| ((f * n as f32).round() as u32).min(n);
        (
            px(self.x0, width),
            px(self.y0, height),
            px(self.x1, width),
            px(self.y1, height),
        )
    }

    pub fn contains_pixel(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        let (x0, y0, x1, y1) = self.to_pixels(width, height);
        x >= x0 && x < x1 && y >= y0 && y < y1
    }

    /// Rasterise into a hard-edged mask (255 inside, 0 outside).
    pub fn to_mask(&self, width: u32, height: u32) -> GrayImage {
        let (x0, y0, x1, y1) = self.to_pixels(width, height);
        GrayImage::from_fn(width, height, |x, y| {
            if x >= x0 && x < x1 && y >= y0 && y < y1 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    /// Rasterise with a linear ramp of `feather` pixels inside the edge.
    pub fn to_feathered_mask(&self, width: u32, height: u32, feather: u32) -> GrayImage {
        if feather == 0 {
            return self.to_mask(width, height);
        }
        let (x0, y0, x1, y1) = self.to_pixels(width, height);
        let f = feather as f32;
        GrayImage::from_fn(width, height, |x, y| {
            if x < x0 || x >= x1 || y < y0 || y >= y1 {
                return Luma([0]);
            }
            // Distance to the nearest edge, counted in whole pixels from 1.
            let d = (x - x0 + 1).min(x1 - x).min(y - y0 + 1).min(y1 - y) as f32;
            Luma([((d / f).min(1.0) * 255.0).round() as u8])
        })
    }
}

/// Linear ramp: 255 at `start`, 0 at `end`, both in fractions of the image
/// extent. Pixels behind `start` stay at 255 and pixels past `end` at 0. When
/// the two points coincide the whole mask is 255.
pub fn gradient_mask(width: u32, height: u32, start: [f32; 2], end: [f32; 2]) -> GrayImage {
    let (w, h) = (width as f32, height as f32);
    let (sx, sy) = (start[0] * w, start[1] * h);
    let (vx, vy) = (end[0] * w - sx, end[1] * h - sy);
    let len2 = vx * vx + vy * vy;
    GrayImage::from_fn(width, height, |x, y| {
        if len2 <= f32::EPSILON {
            return Luma([255]);
        }
        let (px, py) = (x as f32 + 0.5 - sx, y as f32 + 0.5 - sy);
        let t = ((px * vx + py * vy) / len2).clamp(0.0, 1.0);
        Luma([((1.0 - t) * 255.0).round() as u8])
    })
}

/// 255 at `center`, falling linearly to 0 at `radius`. The centre is a
/// fraction of width and height; the radius is a fraction of the shorter
/// side, so `radius = 0.5` touches the near edges of a centred circle.
pub fn radial_mask(width: u32, height: u32, center: [f32; 2], radius: f32) -> GrayImage {
    let (cx, cy) = (center[0] * width as f32, center[1] * height as f32);
    let r = radius.max(0.0) * width.min(height) as f32;
    GrayImage::from_fn(width, height, |x, y| {
        if r <= 0.0 {
            return Luma([0]);
        }
        let (dx, dy) = (x as f32 + 0.5 - cx, y as f32 + 0.5 - cy);
        let t = ((dx * dx + dy * dy).sqrt() / r).min(1.0);
        Luma([((1.0 - t) * 255.0).round() as u8])
    })
}

/// Any of the mask shapes, as picked on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "kebab-case")]
pub enum MaskShape {
    Rect(Region),
    Gradient { start: [f32; 2], end: [f32; 2] },
    Radial { center: [f32; 2], radius: f32 },
}

impl MaskShape {
    pub fn to_mask(&self, width: u32, height: u32) -> GrayImage {
        match self {
            MaskShape::Rect(region) => region.to_mask(width, height),
            MaskShape::Gradient { start, end } => gradient_mask(width, height, *start, *end),
            MaskShape::Radial { center, radius } => radial_mask(width, height, *center, *radius),
        }
    }
}

/// Per-pixel maximum of two masks.
pub fn union(a: &GrayImage, b: &GrayImage) -> Result<GrayImage> {
    if a.dimensions() != b.dimensions() {
        return Err(StudioError::size_mismatch(a.dimensions(), b.dimensions()));
    }
    let mut out = a.clone();
    for (o, v) in out.iter_mut().zip(b.iter()) {
        *o = (*o).max(*v);
    }
    Ok(out)
}

/// Mix `filtered` back over `original` by the mask: 0 keeps the original,
/// 255 takes the filtered pixel, values in between interpolate.
pub fn apply_mask(original: &RgbaImage, filtered: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage> {
    if original.dimensions() != filtered.dimensions() {
        return Err(StudioError::size_mismatch(original.dimensions(), filtered.dimensions()));
    }
    if original.dimensions() != mask.dimensions() {
        return Err(StudioError::size_mismatch(original.dimensions(), mask.dimensions()));
    }
    let mut out = original.clone();
    for ((o, f), m) in out
        .chunks_exact_mut(4)
        .zip(filtered.chunks_exact(4))
        .zip(mask.iter())
    {
        match *m {
            0 => {}
            255 => o.copy_from_slice(f),
            m => {
                let t = m as f32 / 255.0;
                for c in 0..4 {
                    o[c] = (o[c] as f32 + (f[c] as f32 - o[c] as f32) * t).round() as u8;
                }
            }
        }
    }
    Ok(out)
}
