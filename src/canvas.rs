use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, StudioError};

// ============================================================================
// BLEND MODES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Additive,
    Reflect,
    Glow,
    ColorBurn,
    ColorDodge,
    Overlay,
    Difference,
    Negation,
    Lighten,
    Darken,
    Xor,
    Overwrite,
    HardLight,
    SoftLight,
    Exclusion,
    Subtract,
    Divide,
    LinearBurn,
    VividLight,
    LinearLight,
    PinLight,
    HardMix,
}

impl BlendMode {
    /// Every blend mode, in menu order.
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Additive,
            BlendMode::Overlay,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Lighten,
            BlendMode::Darken,
            BlendMode::ColorBurn,
            BlendMode::ColorDodge,
            BlendMode::Difference,
            BlendMode::Exclusion,
            BlendMode::Negation,
            BlendMode::Reflect,
            BlendMode::Glow,
            BlendMode::Subtract,
            BlendMode::Divide,
            BlendMode::LinearBurn,
            BlendMode::VividLight,
            BlendMode::LinearLight,
            BlendMode::PinLight,
            BlendMode::HardMix,
            BlendMode::Xor,
            BlendMode::Overwrite,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Additive => "Additive",
            BlendMode::Reflect => "Reflect",
            BlendMode::Glow => "Glow",
            BlendMode::ColorBurn => "Color Burn",
            BlendMode::ColorDodge => "Color Dodge",
            BlendMode::Overlay => "Overlay",
            BlendMode::Difference => "Difference",
            BlendMode::Negation => "Negation",
            BlendMode::Lighten => "Lighten",
            BlendMode::Darken => "Darken",
            BlendMode::Xor => "Xor",
            BlendMode::Overwrite => "Overwrite",
            BlendMode::HardLight => "Hard Light",
            BlendMode::SoftLight => "Soft Light",
            BlendMode::Exclusion => "Exclusion",
            BlendMode::Subtract => "Subtract",
            BlendMode::Divide => "Divide",
            BlendMode::LinearBurn => "Linear Burn",
            BlendMode::VividLight => "Vivid Light",
            BlendMode::LinearLight => "Linear Light",
            BlendMode::PinLight => "Pin Light",
            BlendMode::HardMix => "Hard Mix",
        }
    }

    /// Convert to a stable u8 for binary serialization
    pub fn to_u8(&self) -> u8 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Multiply => 1,
            BlendMode::Screen => 2,
            BlendMode::Additive => 3,
            BlendMode::Reflect => 4,
            BlendMode::Glow => 5,
            BlendMode::ColorBurn => 6,
            BlendMode::ColorDodge => 7,
            BlendMode::Overlay => 8,
            BlendMode::Difference => 9,
            BlendMode::Negation => 10,
            BlendMode::Lighten => 11,
            BlendMode::Darken => 12,
            BlendMode::Xor => 13,
            BlendMode::Overwrite => 14,
            BlendMode::HardLight => 15,
            BlendMode::SoftLight => 16,
            BlendMode::Exclusion => 17,
            BlendMode::Subtract => 18,
            BlendMode::Divide => 19,
            BlendMode::LinearBurn => 20,
            BlendMode::VividLight => 21,
            BlendMode::LinearLight => 22,
            BlendMode::PinLight => 23,
            BlendMode::HardMix => 24,
        }
    }

    /// Reconstruct from a u8. Unknown values are a project-file error, not
    /// a silent fallback to Normal.
    pub fn from_u8(v: u8) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|m| m.to_u8() == v)
            .ok_or_else(|| StudioError::UnknownBlendMode(format!("#{v}")))
    }
}

impl FromStr for BlendMode {
    type Err = StudioError;

    /// Accepts "Color Dodge", "color-dodge", "color_dodge" or "colordodge".
    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .flat_map(char::to_lowercase)
            .collect();
        let alias = match key.as_str() {
            "add" => "additive",
            "dodge" => "colordodge",
            "burn" => "colorburn",
            other => other,
        };
        BlendMode::all()
            .iter()
            .copied()
            .find(|m| m.name().replace(' ', "").to_lowercase() == alias)
            .ok_or_else(|| StudioError::UnknownBlendMode(s.to_string()))
    }
}

impl std::fmt::Display for BlendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// PIXEL BLENDING
// ============================================================================

#[inline]
fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Blend `top` over `base` with the given mode and opacity (0..=1).
///
/// Channel math runs in normalised f32 and is rounded back, so
/// multiply(200, 100) lands on 78 rather than truncating.
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode, opacity: f32) -> Rgba<u8> {
    // Fast path: nothing of the top layer survives
    if top[3] == 0 || opacity <= 0.0 || opacity.is_nan() {
        return base;
    }

    // Fast path: Normal blend, full opacity, fully opaque top pixel, just overwrite
    if mode == BlendMode::Normal && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);

    let base_r = base[0] as f32 / 255.0;
    let base_g = base[1] as f32 / 255.0;
    let base_b = base[2] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;

    let top_r = top[0] as f32 / 255.0;
    let top_g = top[1] as f32 / 255.0;
    let top_b = top[2] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity;

    let per_channel = |f: fn(f32, f32) -> f32| (f(base_r, top_r), f(base_g, top_g), f(base_b, top_b));

    let (r, g, b) = match mode {
        BlendMode::Overwrite => {
            return Rgba([top[0], top[1], top[2], to_u8(top_a)]);
        }
        BlendMode::Xor => {
            let xor_a = base_a * (1.0 - top_a) + top_a * (1.0 - base_a);
            if xor_a == 0.0 {
                return Rgba([0, 0, 0, 0]);
            }
            let mix = |b: f32, t: f32| (b * base_a * (1.0 - top_a) + t * top_a * (1.0 - base_a)) / xor_a;
            return Rgba([
                to_u8(mix(base_r, top_r)),
                to_u8(mix(base_g, top_g)),
                to_u8(mix(base_b, top_b)),
                to_u8(xor_a),
            ]);
        }
        BlendMode::Normal => (top_r, top_g, top_b),
        BlendMode::Multiply => per_channel(|b, t| b * t),
        BlendMode::Screen => per_channel(|b, t| 1.0 - (1.0 - b) * (1.0 - t)),
        BlendMode::Additive => per_channel(|b, t| (b + t).min(1.0)),
        BlendMode::Overlay => per_channel(overlay_channel),
        BlendMode::Lighten => per_channel(f32::max),
        BlendMode::Darken => per_channel(f32::min),
        BlendMode::Difference => per_channel(|b, t| (b - t).abs()),
        BlendMode::Negation => per_channel(|b, t| 1.0 - (1.0 - b - t).abs()),
        BlendMode::ColorBurn => per_channel(color_burn_channel),
        BlendMode::ColorDodge => per_channel(color_dodge_channel),
        BlendMode::Reflect => per_channel(reflect_channel),
        BlendMode::Glow => per_channel(|b, t| reflect_channel(t, b)),
        BlendMode::HardLight => per_channel(|b, t| overlay_channel(t, b)),
        BlendMode::SoftLight => per_channel(soft_light_channel),
        BlendMode::Exclusion => per_channel(|b, t| b + t - 2.0 * b * t),
        BlendMode::Subtract => per_channel(|b, t| (b - t).max(0.0)),
        BlendMode::Divide => per_channel(divide_channel),
        BlendMode::LinearBurn => per_channel(|b, t| (b + t - 1.0).max(0.0)),
        BlendMode::VividLight => per_channel(vivid_light_channel),
        BlendMode::LinearLight => per_channel(|b, t| (b + 2.0 * t - 1.0).clamp(0.0, 1.0)),
        BlendMode::PinLight => per_channel(pin_light_channel),
        BlendMode::HardMix => per_channel(|b, t| if b + t >= 1.0 { 1.0 } else { 0.0 }),
    };

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a == 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    Rgba([to_u8(out_r), to_u8(out_g), to_u8(out_b), to_u8(out_a)])
}

// Blend mode helper functions
fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

fn color_burn_channel(base: f32, top: f32) -> f32 {
    if top == 0.0 {
        0.0
    } else {
        (1.0 - (1.0 - base) / top).max(0.0)
    }
}

fn color_dodge_channel(base: f32, top: f32) -> f32 {
    if top >= 1.0 {
        1.0
    } else {
        (base / (1.0 - top)).min(1.0)
    }
}

fn reflect_channel(base: f32, top: f32) -> f32 {
    if top >= 1.0 {
        1.0
    } else {
        (base * base / (1.0 - top)).min(1.0)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

fn divide_channel(base: f32, top: f32) -> f32 {
    if top <= 0.0 { 1.0 } else { (base / top).min(1.0) }
}

fn vivid_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        // Color Burn with 2*top
        let t2 = 2.0 * top;
        if t2 <= 0.0 { 0.0 } else { (1.0 - (1.0 - base) / t2).max(0.0) }
    } else {
        // Color Dodge with 2*(top-0.5)
        let t2 = 2.0 * (top - 0.5);
        if t2 >= 1.0 { 1.0 } else { (base / (1.0 - t2)).min(1.0) }
    }
}

fn pin_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base.min(2.0 * top)
    } else {
        base.max(2.0 * (top - 0.5))
    }
}

/// Blend two same-sized bitmaps into a new one.
pub fn blend_images(base: &RgbaImage, top: &RgbaImage, mode: BlendMode, opacity: f32) -> Result<RgbaImage> {
    if base.dimensions() != top.dimensions() {
        return Err(StudioError::size_mismatch(base.dimensions(), top.dimensions()));
    }
    let mut out = base.clone();
    blend_into(&mut out, top, mode, opacity);
    Ok(out)
}

/// Blend `top` onto `acc` in place, one rayon task per row.
/// Callers guarantee equal dimensions.
fn blend_into(acc: &mut RgbaImage, top: &RgbaImage, mode: BlendMode, opacity: f32) {
    let stride = acc.width() as usize * 4;
    if stride == 0 {
        return;
    }
    let top_raw = top.as_raw();
    acc.as_mut()
        .par_chunks_mut(stride)
        .zip(top_raw.par_chunks(stride))
        .for_each(|(dst_row, src_row)| {
            for (d, s) in dst_row.chunks_exact_mut(4).zip(src_row.chunks_exact(4)) {
                let out = blend_pixel(
                    Rgba([d[0], d[1], d[2], d[3]]),
                    Rgba([s[0], s[1], s[2], s[3]]),
                    mode,
                    opacity,
                );
                d.copy_from_slice(&out.0);
            }
        });
}

// ============================================================================
// LAYERS
// ============================================================================

#[derive(Clone, Debug)]
pub struct Layer {
    pub id: Uuid,
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub pixels: RgbaImage,
}

impl Layer {
    pub fn new(name: impl Into<String>, width: u32, height: u32, fill_color: Rgba<u8>) -> Self {
        Self::from_image(name, RgbaImage::from_pixel(width, height, fill_color))
    }

    pub fn from_image(name: impl Into<String>, pixels: RgbaImage) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            pixels,
        }
    }

    pub fn with_blend(mut self, mode: BlendMode, opacity: f32) -> Self {
        self.blend_mode = mode;
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn memory_bytes(&self) -> usize {
        self.pixels.as_raw().len() + self.name.len()
    }
}

// ============================================================================
// CANVAS (layer stack + compositor)
// ============================================================================

/// Largest width or height accepted for a canvas.
pub const MAX_CANVAS_DIM: u32 = 32768;

/// Most layers a project file may carry.
pub const MAX_LAYERS: usize = 256;

/// An ordered layer stack, bottom (index 0) to top.
#[derive(Clone, Debug)]
pub struct CanvasState {
    pub width: u32,
    pub height: u32,
    pub layers: Vec<Layer>,
    pub active_layer_index: usize,
}

impl CanvasState {
    /// An empty canvas of the given size (no layers).
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            layers: Vec::new(),
            active_layer_index: 0,
        }
    }

    /// Canvas with a single "Background" layer holding `image`.
    pub fn from_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            layers: vec![Layer::from_image("Background", image)],
            active_layer_index: 0,
        }
    }

    fn check_size(&self, img: &RgbaImage) -> Result<()> {
        if img.dimensions() != (self.width, self.height) {
            return Err(StudioError::size_mismatch((self.width, self.height), img.dimensions()));
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.layers.len() {
            return Err(StudioError::LayerIndex {
                index,
                count: self.layers.len(),
            });
        }
        Ok(())
    }

    /// Push a layer on top of the stack and make it active.
    pub fn add_layer(&mut self, layer: Layer) -> Result<usize> {
        self.check_size(&layer.pixels)?;
        self.layers.push(layer);
        self.active_layer_index = self.layers.len() - 1;
        Ok(self.active_layer_index)
    }

    pub fn remove_layer(&mut self, index: usize) -> Result<Layer> {
        self.check_index(index)?;
        let removed = self.layers.remove(index);
        if self.active_layer_index >= self.layers.len() {
            self.active_layer_index = self.layers.len().saturating_sub(1);
        }
        Ok(removed)
    }

    /// Move a layer from `from` to `to` (both indices into the current stack).
    pub fn move_layer(&mut self, from: usize, to: usize) -> Result<()> {
        self.check_index(from)?;
        self.check_index(to)?;
        let layer = self.layers.remove(from);
        self.layers.insert(to, layer);
        if self.active_layer_index == from {
            self.active_layer_index = to;
        }
        Ok(())
    }

    pub fn duplicate_layer(&mut self, index: usize) -> Result<usize> {
        self.check_index(index)?;
        let mut copy = self.layers[index].clone();
        copy.id = Uuid::new_v4();
        copy.name = format!("{} copy", copy.name);
        self.layers.insert(index + 1, copy);
        self.active_layer_index = index + 1;
        Ok(index + 1)
    }

    pub fn active_layer(&self) -> Option<&Layer> {
        self.layers.get(self.active_layer_index)
    }

    pub fn active_layer_mut(&mut self) -> Option<&mut Layer> {
        self.layers.get_mut(self.active_layer_index)
    }

    /// Replace one layer's pixels; the new bitmap must match the canvas size.
    pub fn set_layer_pixels(&mut self, index: usize, pixels: RgbaImage) -> Result<()> {
        self.check_index(index)?;
        self.check_size(&pixels)?;
        self.layers[index].pixels = pixels;
        Ok(())
    }

    /// Flatten all visible layers bottom-to-top into one bitmap.
    /// An empty (or fully hidden) stack yields a transparent canvas.
    pub fn composite(&self) -> RgbaImage {
        let mut acc = RgbaImage::new(self.width, self.height);
        for layer in self.layers.iter().filter(|l| l.visible && l.opacity > 0.0) {
            if layer.pixels.dimensions() != acc.dimensions() {
                tracing::warn!(layer = %layer.name, "skipping layer with mismatched size");
                continue;
            }
            blend_into(&mut acc, &layer.pixels, layer.blend_mode, layer.opacity);
        }
        acc
    }

    /// Collapse the stack into a single "Background" layer.
    pub fn flatten(&mut self) {
        let composite = self.composite();
        self.layers.clear();
        self.layers.push(Layer::from_image("Background", composite));
        self.active_layer_index = 0;
    }

    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(Layer::memory_bytes).sum()
    }
}
