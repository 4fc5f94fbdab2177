// ============================================================================
// FILTER PIPELINE: named filters, parameter parsing, masked application
// ============================================================================
//
// `Filter` is the single entry point the CLI, recipes and documents use. A
// filter is parsed from `name` or `name=v1,v2,...`, validated once, then
// dispatched to the pure function in `adjustments`, `filters`, `effects` or
// `transform`. Masks are applied here, after filtering, so no individual
// filter needs to know about them.
// ============================================================================

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

use super::mask::apply_mask;
use super::transform::Interpolation;
use super::{JobContext, adjustments as adj, effects as fx, filters as flt, transform as tf};
use crate::canvas::MAX_CANVAS_DIM;
use crate::error::{Result, StudioError};

/// Channel weights used by `black-white` when none are given.
pub const DEFAULT_BW_WEIGHTS: [f32; 3] = [30.0, 59.0, 11.0];

fn default_gamma() -> f32 {
    1.0
}
fn default_out_white() -> f32 {
    255.0
}
fn default_feather() -> f32 {
    50.0
}
fn default_radius() -> f32 {
    1.0
}
fn default_bg_threshold() -> f32 {
    fx::BACKGROUND_THRESHOLD
}
fn default_bw_weights() -> [f32; 3] {
    DEFAULT_BW_WEIGHTS
}
fn default_sepia() -> f32 {
    100.0
}
fn default_center() -> [f32; 2] {
    [0.5, 0.5]
}

/// Every operation the pipeline can run, with its parameters.
///
/// Serialised (recipes) with an internal `"filter"` tag holding the
/// kebab-case name, e.g. `{"filter": "gaussian-blur", "sigma": 2.0}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "kebab-case")]
pub enum Filter {
    // -- Tone / color --
    Brightness { amount: f32 },
    Contrast { amount: f32 },
    BrightnessContrast { brightness: f32, contrast: f32 },
    Saturation { amount: f32 },
    Hue { degrees: f32 },
    Temperature { amount: f32 },
    Tint { amount: f32 },
    Exposure { ev: f32 },
    Highlights { amount: f32 },
    Shadows { amount: f32 },
    Whites { amount: f32 },
    Blacks { amount: f32 },
    Vibrance { amount: f32 },
    Levels {
        in_black: f32,
        in_white: f32,
        #[serde(default = "default_gamma")]
        gamma: f32,
        #[serde(default)]
        out_black: f32,
        #[serde(default = "default_out_white")]
        out_white: f32,
    },
    Curves { points: Vec<[f32; 2]> },
    ColorBalance {
        shadows: [f32; 3],
        midtones: [f32; 3],
        highlights: [f32; 3],
    },
    Posterize { levels: u32 },
    Invert,
    Grayscale,
    Sepia {
        #[serde(default = "default_sepia")]
        amount: f32,
    },
    Threshold { level: f32 },
    BlackWhite {
        #[serde(default = "default_bw_weights")]
        weights: [f32; 3],
    },
    AutoLevels,
    AutoEnhance,
    ColorMatch { target: [f32; 3] },

    // -- Neighborhood --
    GaussianBlur { sigma: f32 },
    BoxBlur { radius: u32 },
    MotionBlur { angle: f32, distance: f32 },
    /// `center` is in fractions of width and height.
    RadialBlur {
        amount: f32,
        #[serde(default = "default_center")]
        center: [f32; 2],
    },
    LensBlur { radius: f32 },
    Sharpen {
        amount: f32,
        #[serde(default = "default_radius")]
        radius: f32,
    },
    Clarity { amount: f32 },
    Denoise { amount: f32 },
    SkinSmooth { strength: f32 },
    Blemish { strength: f32 },
    RemoveBackground {
        #[serde(default = "default_bg_threshold")]
        threshold: f32,
    },
    Vignette {
        amount: f32,
        #[serde(default = "default_feather")]
        feather: f32,
    },
    Grain {
        amount: f32,
        #[serde(default)]
        seed: u32,
    },
    Vintage { amount: f32 },
    Dehaze { amount: f32 },
    PortraitEnhance,

    // -- Transforms --
    Crop { x: u32, y: u32, width: u32, height: u32 },
    Resize {
        width: u32,
        height: u32,
        #[serde(default)]
        interpolation: Interpolation,
    },
    Upscale {
        factor: u32,
        #[serde(default)]
        interpolation: Interpolation,
    },
    /// Clockwise; angles off the quarter turns grow the canvas.
    Rotate { degrees: f32 },
    FlipH,
    FlipV,
}

/// Map a user-supplied name (any case, `_`/space/`-` separators, common
/// aliases) to the canonical kebab-case filter name.
pub fn canonical_name(name: &str) -> Option<&'static str> {
    let key: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '_' | ' ' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    let canonical = match key.as_str() {
        "brightness" => "brightness",
        "contrast" => "contrast",
        "brightness-contrast" => "brightness-contrast",
        "saturation" => "saturation",
        "hue" | "hue-shift" => "hue",
        "temperature" | "temp" => "temperature",
        "tint" => "tint",
        "exposure" => "exposure",
        "highlights" => "highlights",
        "shadows" => "shadows",
        "whites" => "whites",
        "blacks" => "blacks",
        "vibrance" => "vibrance",
        "levels" => "levels",
        "curves" => "curves",
        "color-balance" | "colour-balance" => "color-balance",
        "posterize" => "posterize",
        "invert" => "invert",
        "grayscale" | "greyscale" | "desaturate" => "grayscale",
        "sepia" => "sepia",
        "threshold" => "threshold",
        "black-white" | "black-and-white" | "bw" => "black-white",
        "auto-levels" => "auto-levels",
        "auto-enhance" => "auto-enhance",
        "color-match" | "colour-match" => "color-match",
        "gaussian-blur" | "blur" => "gaussian-blur",
        "box-blur" => "box-blur",
        "motion-blur" => "motion-blur",
        "radial-blur" | "zoom-blur" => "radial-blur",
        "lens-blur" | "bokeh" => "lens-blur",
        "sharpen" | "unsharp-mask" => "sharpen",
        "clarity" => "clarity",
        "denoise" | "median" | "noise-reduction" => "denoise",
        "skin-smooth" | "smooth-skin" => "skin-smooth",
        "blemish" | "remove-blemishes" => "blemish",
        "remove-background" => "remove-background",
        "vignette" => "vignette",
        "grain" | "film-grain" => "grain",
        "vintage" => "vintage",
        "dehaze" => "dehaze",
        "portrait-enhance" => "portrait-enhance",
        "crop" => "crop",
        "resize" => "resize",
        "upscale" => "upscale",
        "rotate" => "rotate",
        "flip-h" | "flip-horizontal" => "flip-h",
        "flip-v" | "flip-vertical" => "flip-v",
        _ => return None,
    };
    Some(canonical)
}

// ---------------------------------------------------------------------------
//  Parameter parsing
// ---------------------------------------------------------------------------

/// Comma-separated argument list of one `name=...` token.
struct Args<'a> {
    filter: &'static str,
    raw: &'a str,
    values: Vec<&'a str>,
}

impl<'a> Args<'a> {
    fn new(filter: &'static str, raw: Option<&'a str>) -> Self {
        let raw = raw.unwrap_or("").trim();
        let values = if raw.is_empty() {
            Vec::new()
        } else {
            raw.split(',').map(str::trim).collect()
        };
        Self { filter, raw, values }
    }

    fn arity(&self, min: usize, max: usize) -> Result<()> {
        let n = self.values.len();
        if n < min || n > max {
            let expected = if min == max { format!("{min}") } else { format!("{min} to {max}") };
            return Err(StudioError::invalid(self.filter, format!("expected {expected} values, got {n}")));
        }
        Ok(())
    }

    fn f32_or(&self, i: usize, default: f32) -> Result<f32> {
        match self.values.get(i) {
            None => Ok(default),
            Some(v) => v
                .parse::<f32>()
                .map_err(|_| StudioError::invalid(self.filter, format!("'{v}' is not a number"))),
        }
    }

    fn require(&self, i: usize) -> Result<()> {
        if i >= self.values.len() {
            return Err(StudioError::invalid(self.filter, format!("missing value {}", i + 1)));
        }
        Ok(())
    }

    fn f32(&self, i: usize) -> Result<f32> {
        self.require(i)?;
        self.f32_or(i, 0.0)
    }

    fn u32_or(&self, i: usize, default: u32) -> Result<u32> {
        match self.values.get(i) {
            None => Ok(default),
            Some(v) => v
                .parse::<u32>()
                .map_err(|_| StudioError::invalid(self.filter, format!("'{v}' is not a whole number"))),
        }
    }

    fn u32(&self, i: usize) -> Result<u32> {
        self.require(i)?;
        self.u32_or(i, 0)
    }

    fn triple(&self, offset: usize) -> Result<[f32; 3]> {
        Ok([self.f32(offset)?, self.f32(offset + 1)?, self.f32(offset + 2)?])
    }

    /// `x0:y0;x1:y1;...`
    fn points(&self) -> Result<Vec<[f32; 2]>> {
        self.raw
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|pair| {
                let (x, y) = pair
                    .split_once(':')
                    .ok_or_else(|| StudioError::invalid(self.filter, format!("point '{pair}' is not x:y")))?;
                let num = |s: &str| {
                    s.trim()
                        .parse::<f32>()
                        .map_err(|_| StudioError::invalid(self.filter, format!("'{s}' is not a number")))
                };
                Ok([num(x)?, num(y)?])
            })
            .collect()
    }
}

impl FromStr for Filter {
    type Err = StudioError;

    /// Parse `name` or `name=v1,v2,...`. The result is validated.
    fn from_str(s: &str) -> Result<Self> {
        let (raw_name, raw_args) = match s.split_once('=') {
            Some((n, a)) => (n, Some(a)),
            None => (s, None),
        };
        let name = canonical_name(raw_name).ok_or_else(|| StudioError::UnknownFilter(raw_name.trim().to_string()))?;
        let a = Args::new(name, raw_args);

        let filter = match name {
            "brightness" | "contrast" | "saturation" | "temperature" | "tint" | "highlights" | "shadows"
            | "whites" | "blacks" | "vibrance" | "clarity" | "denoise" | "vintage" | "dehaze" => {
                a.arity(1, 1)?;
                let amount = a.f32(0)?;
                match name {
                    "brightness" => Filter::Brightness { amount },
                    "contrast" => Filter::Contrast { amount },
                    "saturation" => Filter::Saturation { amount },
                    "temperature" => Filter::Temperature { amount },
                    "tint" => Filter::Tint { amount },
                    "highlights" => Filter::Highlights { amount },
                    "shadows" => Filter::Shadows { amount },
                    "whites" => Filter::Whites { amount },
                    "blacks" => Filter::Blacks { amount },
                    "vibrance" => Filter::Vibrance { amount },
                    "clarity" => Filter::Clarity { amount },
                    "denoise" => Filter::Denoise { amount },
                    "vintage" => Filter::Vintage { amount },
                    _ => Filter::Dehaze { amount },
                }
            }
            "brightness-contrast" => {
                a.arity(2, 2)?;
                Filter::BrightnessContrast { brightness: a.f32(0)?, contrast: a.f32(1)? }
            }
            "hue" => {
                a.arity(1, 1)?;
                Filter::Hue { degrees: a.f32(0)? }
            }
            "exposure" => {
                a.arity(1, 1)?;
                Filter::Exposure { ev: a.f32(0)? }
            }
            "levels" => {
                a.arity(2, 5)?;
                Filter::Levels {
                    in_black: a.f32(0)?,
                    in_white: a.f32(1)?,
                    gamma: a.f32_or(2, 1.0)?,
                    out_black: a.f32_or(3, 0.0)?,
                    out_white: a.f32_or(4, 255.0)?,
                }
            }
            "curves" => Filter::Curves { points: a.points()? },
            "color-balance" => match a.values.len() {
                3 => {
                    let rgb = a.triple(0)?;
                    Filter::ColorBalance { shadows: rgb, midtones: rgb, highlights: rgb }
                }
                9 => Filter::ColorBalance {
                    shadows: a.triple(0)?,
                    midtones: a.triple(3)?,
                    highlights: a.triple(6)?,
                },
                n => return Err(StudioError::invalid(name, format!("expected 3 or 9 values, got {n}"))),
            },
            "posterize" => {
                a.arity(1, 1)?;
                Filter::Posterize { levels: a.u32(0)? }
            }
            "invert" | "grayscale" | "auto-levels" | "auto-enhance" | "portrait-enhance" | "flip-h" | "flip-v" => {
                a.arity(0, 0)?;
                match name {
                    "invert" => Filter::Invert,
                    "grayscale" => Filter::Grayscale,
                    "auto-levels" => Filter::AutoLevels,
                    "auto-enhance" => Filter::AutoEnhance,
                    "portrait-enhance" => Filter::PortraitEnhance,
                    "flip-h" => Filter::FlipH,
                    _ => Filter::FlipV,
                }
            }
            "sepia" => {
                a.arity(0, 1)?;
                Filter::Sepia { amount: a.f32_or(0, default_sepia())? }
            }
            "threshold" => {
                a.arity(0, 1)?;
                Filter::Threshold { level: a.f32_or(0, 128.0)? }
            }
            "black-white" => {
                a.arity(0, 3)?;
                let weights = if a.values.is_empty() { DEFAULT_BW_WEIGHTS } else { a.triple(0)? };
                Filter::BlackWhite { weights }
            }
            "color-match" => {
                a.arity(3, 3)?;
                Filter::ColorMatch { target: a.triple(0)? }
            }
            "gaussian-blur" => {
                a.arity(1, 1)?;
                Filter::GaussianBlur { sigma: a.f32(0)? }
            }
            "box-blur" => {
                a.arity(1, 1)?;
                Filter::BoxBlur { radius: a.u32(0)? }
            }
            "radial-blur" => {
                if a.values.len() == 2 {
                    return Err(StudioError::invalid(name, "expected amount or amount,cx,cy"));
                }
                a.arity(1, 3)?;
                let center = if a.values.len() == 3 { [a.f32(1)?, a.f32(2)?] } else { default_center() };
                Filter::RadialBlur { amount: a.f32(0)?, center }
            }
            "lens-blur" => {
                a.arity(1, 1)?;
                Filter::LensBlur { radius: a.f32(0)? }
            }
            "motion-blur" => {
                a.arity(2, 2)?;
                Filter::MotionBlur { angle: a.f32(0)?, distance: a.f32(1)? }
            }
            "sharpen" => {
                a.arity(1, 2)?;
                Filter::Sharpen { amount: a.f32(0)?, radius: a.f32_or(1, default_radius())? }
            }
            "skin-smooth" | "blemish" => {
                a.arity(0, 1)?;
                let strength = a.f32_or(0, 0.5)?;
                if name == "blemish" {
                    Filter::Blemish { strength }
                } else {
                    Filter::SkinSmooth { strength }
                }
            }
            "remove-background" => {
                a.arity(0, 1)?;
                Filter::RemoveBackground { threshold: a.f32_or(0, fx::BACKGROUND_THRESHOLD)? }
            }
            "vignette" => {
                a.arity(1, 2)?;
                Filter::Vignette { amount: a.f32(0)?, feather: a.f32_or(1, default_feather())? }
            }
            "grain" => {
                a.arity(1, 2)?;
                Filter::Grain { amount: a.f32(0)?, seed: a.u32_or(1, 0)? }
            }
            "crop" => {
                a.arity(4, 4)?;
                Filter::Crop { x: a.u32(0)?, y: a.u32(1)?, width: a.u32(2)?, height: a.u32(3)? }
            }
            "resize" => {
                a.arity(2, 3)?;
                Filter::Resize {
                    width: a.u32(0)?,
                    height: a.u32(1)?,
                    interpolation: a.values.get(2).map(|s| s.parse::<Interpolation>()).transpose()?.unwrap_or_default(),
                }
            }
            "upscale" => {
                a.arity(1, 2)?;
                Filter::Upscale {
                    factor: a.u32(0)?,
                    interpolation: a.values.get(1).map(|s| s.parse::<Interpolation>()).transpose()?.unwrap_or_default(),
                }
            }
            "rotate" => {
                a.arity(1, 1)?;
                Filter::Rotate { degrees: a.f32(0)? }
            }
            other => return Err(StudioError::UnknownFilter(other.to_string())),
        };
        filter.validate()?;
        Ok(filter)
    }
}

fn in_range(filter: &str, what: &str, v: f32, lo: f32, hi: f32) -> Result<()> {
    if !v.is_finite() || v < lo || v > hi {
        return Err(StudioError::invalid(filter, format!("{what} {v} outside {lo}..={hi}")));
    }
    Ok(())
}

fn all_in_range(filter: &str, what: &str, vs: &[f32], lo: f32, hi: f32) -> Result<()> {
    vs.iter().try_for_each(|&v| in_range(filter, what, v, lo, hi))
}

impl Filter {
    /// Canonical kebab-case name, as accepted by the parser.
    pub fn name(&self) -> &'static str {
        match self {
            Filter::Brightness { .. } => "brightness",
            Filter::Contrast { .. } => "contrast",
            Filter::BrightnessContrast { .. } => "brightness-contrast",
            Filter::Saturation { .. } => "saturation",
            Filter::Hue { .. } => "hue",
            Filter::Temperature { .. } => "temperature",
            Filter::Tint { .. } => "tint",
            Filter::Exposure { .. } => "exposure",
            Filter::Highlights { .. } => "highlights",
            Filter::Shadows { .. } => "shadows",
            Filter::Whites { .. } => "whites",
            Filter::Blacks { .. } => "blacks",
            Filter::Vibrance { .. } => "vibrance",
            Filter::Levels { .. } => "levels",
            Filter::Curves { .. } => "curves",
            Filter::ColorBalance { .. } => "color-balance",
            Filter::Posterize { .. } => "posterize",
            Filter::Invert => "invert",
            Filter::Grayscale => "grayscale",
            Filter::Sepia { .. } => "sepia",
            Filter::Threshold { .. } => "threshold",
            Filter::BlackWhite { .. } => "black-white",
            Filter::AutoLevels => "auto-levels",
            Filter::AutoEnhance => "auto-enhance",
            Filter::ColorMatch { .. } => "color-match",
            Filter::GaussianBlur { .. } => "gaussian-blur",
            Filter::BoxBlur { .. } => "box-blur",
            Filter::MotionBlur { .. } => "motion-blur",
            Filter::RadialBlur { .. } => "radial-blur",
            Filter::LensBlur { .. } => "lens-blur",
            Filter::Sharpen { .. } => "sharpen",
            Filter::Clarity { .. } => "clarity",
            Filter::Denoise { .. } => "denoise",
            Filter::SkinSmooth { .. } => "skin-smooth",
            Filter::Blemish { .. } => "blemish",
            Filter::RemoveBackground { .. } => "remove-background",
            Filter::Vignette { .. } => "vignette",
            Filter::Grain { .. } => "grain",
            Filter::Vintage { .. } => "vintage",
            Filter::Dehaze { .. } => "dehaze",
            Filter::PortraitEnhance => "portrait-enhance",
            Filter::Crop { .. } => "crop",
            Filter::Resize { .. } => "resize",
            Filter::Upscale { .. } => "upscale",
            Filter::Rotate { .. } => "rotate",
            Filter::FlipH => "flip-h",
            Filter::FlipV => "flip-v",
        }
    }

    /// Geometry changes. These run unmasked and may change the bitmap size.
    pub fn is_transform(&self) -> bool {
        matches!(
            self,
            Filter::Crop { .. }
                | Filter::Resize { .. }
                | Filter::Upscale { .. }
                | Filter::Rotate { .. }
                | Filter::FlipH
                | Filter::FlipV
        )
    }

    /// Check every parameter against its documented range.
    pub fn validate(&self) -> Result<()> {
        let n = self.name();
        match self {
            Filter::Brightness { amount }
            | Filter::Contrast { amount }
            | Filter::Saturation { amount }
            | Filter::Temperature { amount }
            | Filter::Tint { amount }
            | Filter::Highlights { amount }
            | Filter::Shadows { amount }
            | Filter::Vibrance { amount }
            | Filter::Clarity { amount } => in_range(n, "amount", *amount, -100.0, 100.0),
            Filter::BrightnessContrast { brightness, contrast } => {
                in_range(n, "brightness", *brightness, -100.0, 100.0)?;
                in_range(n, "contrast", *contrast, -100.0, 100.0)
            }
            Filter::Whites { amount } | Filter::Blacks { amount } => in_range(n, "amount", *amount, -100.0, 90.0),
            Filter::Hue { degrees } => in_range(n, "degrees", *degrees, -180.0, 180.0),
            Filter::Exposure { ev } => in_range(n, "ev", *ev, -5.0, 5.0),
            Filter::Levels { in_black, in_white, gamma, out_black, out_white } => {
                all_in_range(n, "level", &[*in_black, *in_white, *out_black, *out_white], 0.0, 255.0)?;
                in_range(n, "gamma", *gamma, 0.1, 10.0)?;
                if in_black >= in_white {
                    return Err(StudioError::invalid(n, "input black must be below input white"));
                }
                Ok(())
            }
            Filter::Curves { points } => {
                if points.len() < 2 {
                    return Err(StudioError::invalid(n, "at least two points are required"));
                }
                all_in_range(n, "point", &points.concat(), 0.0, 255.0)
            }
            Filter::ColorBalance { shadows, midtones, highlights } => {
                all_in_range(n, "shift", &[*shadows, *midtones, *highlights].concat(), -100.0, 100.0)
            }
            Filter::Posterize { levels } => {
                if !(2..=255).contains(levels) {
                    return Err(StudioError::invalid(n, format!("levels {levels} outside 2..=255")));
                }
                Ok(())
            }
            Filter::Threshold { level } => in_range(n, "level", *level, 0.0, 255.0),
            Filter::BlackWhite { weights } => all_in_range(n, "weight", weights, -200.0, 300.0),
            Filter::ColorMatch { target } => all_in_range(n, "target", target, 0.0, 255.0),
            Filter::GaussianBlur { sigma } => in_range(n, "sigma", *sigma, 0.0, 100.0),
            Filter::BoxBlur { radius } => in_range(n, "radius", *radius as f32, 0.0, 250.0),
            Filter::MotionBlur { angle, distance } => {
                in_range(n, "angle", *angle, -360.0, 360.0)?;
                in_range(n, "distance", *distance, 0.0, 500.0)
            }
            Filter::RadialBlur { amount, center } => {
                in_range(n, "amount", *amount, 0.0, 100.0)?;
                all_in_range(n, "center", center, 0.0, 1.0)
            }
            Filter::LensBlur { radius } => in_range(n, "radius", *radius, 0.0, 50.0),
            Filter::Sepia { amount }
            | Filter::Denoise { amount }
            | Filter::Vintage { amount }
            | Filter::Dehaze { amount }
            | Filter::Grain { amount, .. } => in_range(n, "amount", *amount, 0.0, 100.0),
            Filter::Sharpen { amount, radius } => {
                in_range(n, "amount", *amount, 0.0, 10.0)?;
                in_range(n, "radius", *radius, 0.0, 100.0)
            }
            Filter::SkinSmooth { strength } | Filter::Blemish { strength } => {
                in_range(n, "strength", *strength, 0.0, 1.0)
            }
            Filter::RemoveBackground { threshold } => in_range(n, "threshold", *threshold, 0.0, 255.0),
            Filter::Vignette { amount, feather } => {
                in_range(n, "amount", *amount, 0.0, 100.0)?;
                in_range(n, "feather", *feather, 0.0, 100.0)
            }
            Filter::Crop { width, height, .. } => {
                if *width == 0 || *height == 0 {
                    return Err(StudioError::invalid(n, "crop rectangle is empty"));
                }
                Ok(())
            }
            Filter::Resize { width, height, .. } => {
                if *width == 0 || *height == 0 || *width > MAX_CANVAS_DIM || *height > MAX_CANVAS_DIM {
                    return Err(StudioError::invalid(
                        n,
                        format!("size {width}x{height} outside 1..={MAX_CANVAS_DIM}"),
                    ));
                }
                Ok(())
            }
            Filter::Upscale { factor, .. } => {
                if !(1..=4).contains(factor) {
                    return Err(StudioError::invalid(n, format!("factor {factor} outside 1..=4")));
                }
                Ok(())
            }
            Filter::Rotate { degrees } => in_range(n, "degrees", *degrees, -360.0, 360.0),
            Filter::Invert
            | Filter::Grayscale
            | Filter::AutoLevels
            | Filter::AutoEnhance
            | Filter::PortraitEnhance
            | Filter::FlipH
            | Filter::FlipV => Ok(()),
        }
    }

    /// Run the filter without any mask.
    fn run(&self, src: &RgbaImage, ctx: &JobContext) -> Result<RgbaImage> {
        let out = match self {
            Filter::Brightness { amount } => adj::brightness(src, *amount, ctx),
            Filter::Contrast { amount } => adj::contrast(src, *amount, ctx),
            Filter::BrightnessContrast { brightness, contrast } => {
                adj::brightness_contrast(src, *brightness, *contrast, ctx)
            }
            Filter::Saturation { amount } => adj::saturation(src, *amount, ctx),
            Filter::Hue { degrees } => adj::hue_shift(src, *degrees, ctx),
            Filter::Temperature { amount } => adj::temperature_tint(src, *amount, 0.0, ctx),
            Filter::Tint { amount } => adj::temperature_tint(src, 0.0, *amount, ctx),
            Filter::Exposure { ev } => adj::exposure(src, *ev, ctx),
            Filter::Highlights { amount } => adj::highlights_shadows(src, 0.0, *amount, ctx),
            Filter::Shadows { amount } => adj::highlights_shadows(src, *amount, 0.0, ctx),
            Filter::Whites { amount } => adj::whites(src, *amount, ctx),
            Filter::Blacks { amount } => adj::blacks(src, *amount, ctx),
            Filter::Vibrance { amount } => adj::vibrance(src, *amount, ctx),
            Filter::Levels { in_black, in_white, gamma, out_black, out_white } => {
                adj::levels(src, *in_black, *in_white, *gamma, *out_black, *out_white, ctx)
            }
            Filter::Curves { points } => {
                let pts: Vec<(f32, f32)> = points.iter().map(|p| (p[0], p[1])).collect();
                adj::curves(src, &pts, ctx)
            }
            Filter::ColorBalance { shadows, midtones, highlights } => {
                adj::color_balance(src, *shadows, *midtones, *highlights, ctx)
            }
            Filter::Posterize { levels } => adj::posterize(src, *levels, ctx),
            Filter::Invert => adj::invert(src, ctx),
            Filter::Grayscale => flt::grayscale(src, ctx),
            Filter::Sepia { amount } => adj::sepia(src, *amount, ctx),
            Filter::Threshold { level } => adj::threshold(src, *level, ctx),
            Filter::BlackWhite { weights } => adj::black_and_white(src, *weights, ctx),
            Filter::AutoLevels => adj::auto_levels(src, ctx),
            Filter::AutoEnhance => adj::auto_enhance(src, ctx),
            Filter::ColorMatch { target } => adj::color_match(src, *target, ctx),
            Filter::GaussianBlur { sigma } => flt::gaussian_blur(src, *sigma, ctx),
            Filter::BoxBlur { radius } => flt::box_blur(src, *radius, ctx),
            Filter::MotionBlur { angle, distance } => fx::motion_blur(src, *angle, *distance, ctx),
            Filter::RadialBlur { amount, center } => fx::radial_blur(src, *amount, (center[0], center[1]), ctx),
            Filter::LensBlur { radius } => fx::lens_blur(src, *radius, ctx),
            Filter::Sharpen { amount, radius } => fx::sharpen(src, *amount, *radius, ctx),
            Filter::Clarity { amount } => fx::clarity(src, *amount, ctx),
            Filter::Denoise { amount } => fx::denoise(src, *amount, ctx),
            Filter::SkinSmooth { strength } => fx::skin_smooth(src, *strength, ctx),
            Filter::Blemish { strength } => fx::remove_blemishes(src, *strength, ctx),
            Filter::RemoveBackground { threshold } => fx::remove_background(src, *threshold, ctx),
            Filter::Vignette { amount, feather } => fx::vignette(src, *amount, *feather, ctx),
            Filter::Grain { amount, seed } => fx::film_grain(src, *amount, *seed, ctx),
            Filter::Vintage { amount } => fx::vintage(src, *amount, ctx),
            Filter::Dehaze { amount } => fx::dehaze(src, *amount, ctx),
            Filter::PortraitEnhance => fx::portrait_enhance(src, ctx),
            Filter::Crop { x, y, width, height } => tf::crop(src, *x, *y, *width, *height),
            Filter::Resize { width, height, interpolation } => tf::resize(src, *width, *height, *interpolation),
            Filter::Upscale { factor, interpolation } => tf::upscale(src, *factor, *interpolation),
            Filter::Rotate { degrees } => tf::rotate_by(src, *degrees),
            Filter::FlipH => Ok(tf::flip_horizontal(src)),
            Filter::FlipV => Ok(tf::flip_vertical(src)),
        }?;
        ctx.report(1.0);
        Ok(out)
    }
}

/// Formats back to the `name=v1,v2` form the parser accepts.
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |vs: &[f32]| vs.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",");
        let args = match self {
            Filter::Brightness { amount }
            | Filter::Contrast { amount }
            | Filter::Saturation { amount }
            | Filter::Temperature { amount }
            | Filter::Tint { amount }
            | Filter::Highlights { amount }
            | Filter::Shadows { amount }
            | Filter::Whites { amount }
            | Filter::Blacks { amount }
            | Filter::Vibrance { amount }
            | Filter::Clarity { amount }
            | Filter::Denoise { amount }
            | Filter::Vintage { amount }
            | Filter::Dehaze { amount } => amount.to_string(),
            Filter::BrightnessContrast { brightness, contrast } => join(&[*brightness, *contrast]),
            Filter::Hue { degrees } => degrees.to_string(),
            Filter::Exposure { ev } => ev.to_string(),
            Filter::Levels { in_black, in_white, gamma, out_black, out_white } => {
                join(&[*in_black, *in_white, *gamma, *out_black, *out_white])
            }
            Filter::Curves { points } => points
                .iter()
                .map(|[x, y]| format!("{x}:{y}"))
                .collect::<Vec<_>>()
                .join(";"),
            Filter::ColorBalance { shadows, midtones, highlights } => {
                if shadows == midtones && midtones == highlights {
                    join(midtones)
                } else {
                    join(&[*shadows, *midtones, *highlights].concat())
                }
            }
            Filter::Posterize { levels } => levels.to_string(),
            Filter::Sepia { amount } if *amount == default_sepia() => String::new(),
            Filter::Sepia { amount } => amount.to_string(),
            Filter::RadialBlur { amount, center } if *center == default_center() => amount.to_string(),
            Filter::RadialBlur { amount, center } => join(&[*amount, center[0], center[1]]),
            Filter::LensBlur { radius } => radius.to_string(),
            Filter::Threshold { level } => level.to_string(),
            Filter::BlackWhite { weights } => join(weights),
            Filter::ColorMatch { target } => join(target),
            Filter::GaussianBlur { sigma } => sigma.to_string(),
            Filter::BoxBlur { radius } => radius.to_string(),
            Filter::MotionBlur { angle, distance } => join(&[*angle, *distance]),
            Filter::Sharpen { amount, radius } => join(&[*amount, *radius]),
            Filter::SkinSmooth { strength } | Filter::Blemish { strength } => strength.to_string(),
            Filter::RemoveBackground { threshold } => threshold.to_string(),
            Filter::Vignette { amount, feather } => join(&[*amount, *feather]),
            Filter::Grain { amount, seed } => format!("{amount},{seed}"),
            Filter::Crop { x, y, width, height } => format!("{x},{y},{width},{height}"),
            Filter::Resize { width, height, interpolation } => format!("{width},{height},{interpolation}"),
            Filter::Upscale { factor, interpolation } => format!("{factor},{interpolation}"),
            Filter::Rotate { degrees } => degrees.to_string(),
            Filter::Invert
            | Filter::Grayscale
            | Filter::AutoLevels
            | Filter::AutoEnhance
            | Filter::PortraitEnhance
            | Filter::FlipH
            | Filter::FlipV => String::new(),
        };
        if args.is_empty() {
            f.write_str(self.name())
        } else {
            write!(f, "{}={}", self.name(), args)
        }
    }
}

// ---------------------------------------------------------------------------
//  Application
// ---------------------------------------------------------------------------

/// Apply one filter. With a mask the filtered result is mixed back over the
/// source by mask value; transforms cannot be masked. Empty input returns an
/// empty bitmap.
pub fn apply_filter(src: &RgbaImage, filter: &Filter, mask: Option<&GrayImage>, ctx: &JobContext) -> Result<RgbaImage> {
    apply_filters(src, std::slice::from_ref(filter), mask, ctx)
}

/// Apply `filters` in order. Each step gets an equal slice of the progress
/// range. A mask is applied once, over the whole chain.
pub fn apply_filters(
    src: &RgbaImage,
    filters: &[Filter],
    mask: Option<&GrayImage>,
    ctx: &JobContext,
) -> Result<RgbaImage> {
    for f in filters {
        f.validate()?;
    }
    if mask.is_some()
        && let Some(t) = filters.iter().find(|f| f.is_transform())
    {
        return Err(StudioError::invalid(t.name(), "transforms cannot be restricted to a region"));
    }
    if src.width() == 0 || src.height() == 0 {
        return Ok(src.clone());
    }
    ctx.check()?;

    let n = filters.len().max(1) as f32;
    let mut current: Option<RgbaImage> = None;
    for (i, filter) in filters.iter().enumerate() {
        let started = Instant::now();
        let input = current.as_ref().unwrap_or(src);
        let step_ctx = ctx.span(i as f32 / n, (i + 1) as f32 / n);
        let out = filter.run(input, &step_ctx).inspect_err(|e| {
            if !e.is_cancelled() {
                tracing::warn!(filter = %filter, error = %e, "filter failed");
            }
        })?;
        tracing::debug!(
            filter = %filter,
            width = out.width(),
            height = out.height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "filter applied"
        );
        current = Some(out);
    }

    let out = current.unwrap_or_else(|| src.clone());
    ctx.report(1.0);
    match mask {
        Some(m) => apply_mask(src, &out, m),
        None => Ok(out),
    }
}

// ---------------------------------------------------------------------------
//  Recipes
// ---------------------------------------------------------------------------

/// An ordered, named list of filters loaded from JSON.
///
/// Accepted shapes: `{"name": "...", "filters": [...]}` or a bare list.
/// Each entry is either a filter object (`{"filter": "sharpen", "amount": 1}`)
/// or a string in the command-line form (`"sharpen=1,2"`).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Recipe {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub filters: Vec<Filter>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecipeFile {
    Full {
        #[serde(default)]
        name: Option<String>,
        filters: Vec<serde_json::Value>,
    },
    List(Vec<serde_json::Value>),
}

fn filter_from_value(value: serde_json::Value) -> Result<Filter> {
    use serde_json::Value;
    match value {
        Value::String(s) => s.parse(),
        Value::Object(mut obj) => {
            let raw = obj
                .get("filter")
                .and_then(Value::as_str)
                .ok_or_else(|| StudioError::invalid("recipe", "entry has no \"filter\" name"))?
                .to_string();
            let name = canonical_name(&raw).ok_or(StudioError::UnknownFilter(raw))?;
            obj.insert("filter".into(), Value::String(name.into()));
            let filter: Filter =
                serde_json::from_value(Value::Object(obj)).map_err(|e| StudioError::invalid(name, e.to_string()))?;
            filter.validate()?;
            Ok(filter)
        }
        other => Err(StudioError::invalid("recipe", format!("unexpected entry {other}"))),
    }
}

impl Recipe {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { name: None, filters }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let (name, entries) = match serde_json::from_str::<RecipeFile>(text)? {
            RecipeFile::Full { name, filters } => (name, filters),
            RecipeFile::List(filters) => (None, filters),
        };
        let filters = entries.into_iter().map(filter_from_value).collect::<Result<Vec<_>>>()?;
        Ok(Self { name, filters })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let recipe = Self::from_json(&text)?;
        tracing::info!(path = %path.display(), steps = recipe.filters.len(), "recipe loaded");
        Ok(recipe)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn apply(&self, src: &RgbaImage, mask: Option<&GrayImage>, ctx: &JobContext) -> Result<RgbaImage> {
        apply_filters(src, &self.filters, mask, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::mask::Region;
    use image::Rgba;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    fn solid(w: u32, h: u32, c: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(c))
    }

    #[test]
    fn parses_names_values_and_aliases() {
        assert_eq!("brightness=20".parse::<Filter>().unwrap(), Filter::Brightness { amount: 20.0 });
        assert_eq!("Gaussian_Blur=2.5".parse::<Filter>().unwrap(), Filter::GaussianBlur { sigma: 2.5 });
        assert_eq!("blur=1".parse::<Filter>().unwrap(), Filter::GaussianBlur { sigma: 1.0 });
        assert_eq!("FLIP-H".parse::<Filter>().unwrap(), Filter::FlipH);
        assert_eq!(
            "remove-background".parse::<Filter>().unwrap(),
            Filter::RemoveBackground { threshold: 30.0 }
        );
        assert_eq!(
            "color-balance=10,0,-10".parse::<Filter>().unwrap(),
            Filter::ColorBalance { shadows: [10.0, 0.0, -10.0], midtones: [10.0, 0.0, -10.0], highlights: [10.0, 0.0, -10.0] }
        );
        assert_eq!(
            "curves=0:0;128:160;255:255".parse::<Filter>().unwrap(),
            Filter::Curves { points: vec![[0.0, 0.0], [128.0, 160.0], [255.0, 255.0]] }
        );
        assert_eq!(
            "resize=64,32,lanczos".parse::<Filter>().unwrap(),
            Filter::Resize { width: 64, height: 32, interpolation: Interpolation::Lanczos3 }
        );
    }

    #[test]
    fn unknown_filter_is_an_error() {
        match "sparkle=3".parse::<Filter>() {
            Err(StudioError::UnknownFilter(name)) => assert_eq!(name, "sparkle"),
            other => panic!("expected UnknownFilter, got {other:?}"),
        }
    }

    #[test]
    fn bad_parameters_are_invalid() {
        for text in [
            "brightness=lots",
            "brightness=150",
            "brightness",
            "brightness=1,2",
            "posterize=1",
            "upscale=8",
            "rotate=400",
            "whites=95",
            "lens-blur=80",
            "radial-blur=40,0.5",
            "radial-blur=40,1.5,0.5",
            "sepia=120",
            "levels=200,100",
            "curves=0:0",
            "skin-smooth=2",
            "color-balance=1,2",
            "crop=0,0,0,5",
        ] {
            assert!(
                matches!(text.parse::<Filter>(), Err(StudioError::InvalidParam { .. })),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn display_is_parseable() {
        for text in ["brightness=20", "vignette=40,60", "grain=25,7", "rotate=270", "rotate=12.5", "sepia", "sepia=40", "radial-blur=30", "radial-blur=30,0.25,0.75", "lens-blur=4", "whites=-20", "upscale=2,bicubic"] {
            let f: Filter = text.parse().unwrap();
            assert_eq!(f.to_string(), text);
            assert_eq!(f.to_string().parse::<Filter>().unwrap(), f);
        }
    }

    #[test]
    fn parses_tone_end_points_and_optional_arguments() {
        assert_eq!("whites=30".parse::<Filter>().unwrap(), Filter::Whites { amount: 30.0 });
        assert_eq!("blacks=-10".parse::<Filter>().unwrap(), Filter::Blacks { amount: -10.0 });
        assert_eq!("sepia".parse::<Filter>().unwrap(), Filter::Sepia { amount: 100.0 });
        assert_eq!("sepia=25".parse::<Filter>().unwrap(), Filter::Sepia { amount: 25.0 });
        assert_eq!("bokeh=3".parse::<Filter>().unwrap(), Filter::LensBlur { radius: 3.0 });
        assert_eq!(
            "radial-blur=50".parse::<Filter>().unwrap(),
            Filter::RadialBlur { amount: 50.0, center: [0.5, 0.5] }
        );
        assert_eq!(
            "zoom-blur=50,0.2,0.8".parse::<Filter>().unwrap(),
            Filter::RadialBlur { amount: 50.0, center: [0.2, 0.8] }
        );
        assert_eq!("rotate=-30".parse::<Filter>().unwrap(), Filter::Rotate { degrees: -30.0 });
    }

    /// Recipes may leave out the optional sepia amount and radial centre.
    #[test]
    fn recipe_defaults_for_optional_fields() {
        let recipe = Recipe::from_json(r#"[{"filter": "sepia"}, {"filter": "radial-blur", "amount": 20}]"#).unwrap();
        assert_eq!(
            recipe.filters,
            vec![Filter::Sepia { amount: 100.0 }, Filter::RadialBlur { amount: 20.0, center: [0.5, 0.5] }]
        );
    }

    #[test]
    fn free_rotation_grows_the_bitmap() {
        let img = solid(10, 10, [50, 60, 70, 255]);
        let out = apply_filter(&img, &"rotate=45".parse().unwrap(), None, &JobContext::new()).unwrap();
        assert_eq!(out.dimensions(), (15, 15));
        assert_eq!(out.get_pixel(0, 0)[3], 0);
        let quarter = apply_filter(&solid(6, 2, [1, 2, 3, 255]), &"rotate=-90".parse().unwrap(), None, &JobContext::new()).unwrap();
        assert_eq!(quarter.dimensions(), (2, 6));
    }

    #[test]
    fn whites_filter_brightens_midtones() {
        let img = solid(2, 2, [100, 100, 100, 255]);
        let out = apply_filter(&img, &Filter::Whites { amount: 50.0 }, None, &JobContext::new()).unwrap();
        assert_eq!(out.get_pixel(1, 1).0, [200, 200, 200, 255]);
    }

    /// brightness(+50) on (100,100,100) gives 150; contrast(0) changes nothing.
    #[test]
    fn brightness_then_neutral_contrast() {
        let img = solid(4, 4, [100, 100, 100, 255]);
        let filters = [Filter::Brightness { amount: 50.0 }, Filter::Contrast { amount: 0.0 }];
        let out = apply_filters(&img, &filters, None, &JobContext::new()).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [150, 150, 150, 255]);
    }

    #[test]
    fn posterize_gradient_has_four_values() {
        let img = RgbaImage::from_fn(256, 1, |x, _| Rgba([x as u8, x as u8, x as u8, 255]));
        let out = apply_filter(&img, &"posterize=4".parse().unwrap(), None, &JobContext::new()).unwrap();
        let distinct: HashSet<u8> = out.pixels().map(|p| p[0]).collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn invert_twice_is_identity() {
        let img = RgbaImage::from_fn(16, 16, |x, y| Rgba([(x * 16) as u8, (y * 16) as u8, 77, 200]));
        let out = apply_filters(&img, &[Filter::Invert, Filter::Invert], None, &JobContext::new()).unwrap();
        assert_eq!(out, img);
    }

    /// Only the masked half of the image changes.
    #[test]
    fn mask_restricts_the_filter() {
        let img = solid(10, 4, [100, 100, 100, 255]);
        let mask = Region::new(0.0, 0.0, 0.5, 1.0).to_mask(10, 4);
        let out = apply_filter(&img, &Filter::Invert, Some(&mask), &JobContext::new()).unwrap();
        assert_eq!(out.get_pixel(2, 2).0, [155, 155, 155, 255]);
        assert_eq!(out.get_pixel(7, 2).0, [100, 100, 100, 255]);
    }

    #[test]
    fn masked_transform_is_rejected() {
        let img = solid(4, 4, [0, 0, 0, 255]);
        let mask = Region::full().to_mask(4, 4);
        assert!(apply_filter(&img, &Filter::FlipH, Some(&mask), &JobContext::new()).is_err());
    }

    #[test]
    fn empty_input_returns_empty() {
        let img = RgbaImage::new(0, 0);
        let out = apply_filter(&img, &Filter::GaussianBlur { sigma: 3.0 }, None, &JobContext::new()).unwrap();
        assert_eq!(out.dimensions(), (0, 0));
    }

    #[test]
    fn chain_progress_reaches_one() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = JobContext::new().with_progress(move |p| sink.lock().unwrap().push(p));
        let img = solid(32, 32, [10, 20, 30, 255]);
        let filters = [Filter::GaussianBlur { sigma: 1.0 }, Filter::Sepia { amount: 100.0 }, Filter::FlipV];
        apply_filters(&img, &filters, None, &ctx).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().copied(), Some(1.0));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn cancelled_chain_fails() {
        let ctx = JobContext::new();
        ctx.cancel_token().cancel();
        let img = solid(8, 8, [1, 1, 1, 255]);
        let err = apply_filter(&img, &Filter::Invert, None, &ctx).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn recipe_accepts_objects_and_strings() {
        let json = r#"{
            "name": "warm portrait",
            "filters": [
                {"filter": "skin_smooth", "strength": 0.4},
                "brightness=10",
                {"filter": "vignette", "amount": 30}
            ]
        }"#;
        let recipe = Recipe::from_json(json).unwrap();
        assert_eq!(recipe.name.as_deref(), Some("warm portrait"));
        assert_eq!(
            recipe.filters,
            vec![
                Filter::SkinSmooth { strength: 0.4 },
                Filter::Brightness { amount: 10.0 },
                Filter::Vignette { amount: 30.0, feather: 50.0 },
            ]
        );
        let bare = Recipe::from_json(r#"["invert", "flip-v"]"#).unwrap();
        assert_eq!(bare.filters, vec![Filter::Invert, Filter::FlipV]);
    }

    #[test]
    fn recipe_errors_name_the_problem() {
        assert!(matches!(
            Recipe::from_json(r#"[{"filter": "sparkle"}]"#),
            Err(StudioError::UnknownFilter(_))
        ));
        assert!(matches!(
            Recipe::from_json(r#"[{"filter": "brightness", "amount": 400}]"#),
            Err(StudioError::InvalidParam { .. })
        ));
        assert!(matches!(
            Recipe::from_json(r#"[{"filter": "brightness"}]"#),
            Err(StudioError::InvalidParam { .. })
        ));
        assert!(matches!(Recipe::from_json("{not json"), Err(StudioError::Serialization(_))));
    }

    #[test]
    fn recipe_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("look.json");
        let recipe = Recipe::new(vec![Filter::Sepia { amount: 60.0 }, Filter::Grain { amount: 12.0, seed: 3 }]);
        recipe.save(&path).unwrap();
        assert_eq!(Recipe::load(&path).unwrap(), recipe);
    }
}
