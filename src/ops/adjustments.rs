// ============================================================================
// ADJUSTMENT OPERATIONS: per-pixel tone and color filters
// ============================================================================
//
// Every adjustment is a pure function of one pixel plus scalar parameters.
// Rows run in parallel via `map_rows`; results are rounded and clamped to
// 0..=255 so no channel can wrap. Alpha passes through untouched unless
// noted otherwise.
// ============================================================================

use std::collections::HashMap;

use image::{Rgba, RgbaImage};

use super::{JobContext, clamp_u8, luma, map_rows};
use crate::error::Result;

// ============================================================================
// HELPER: per-pixel transform
// ============================================================================

/// Apply `transform` to every pixel. It receives (r, g, b, a) as f32 in
/// 0..255 and returns the same.
pub fn apply_pixel_transform<F>(src: &RgbaImage, ctx: &JobContext, transform: F) -> Result<RgbaImage>
where
    F: Fn(f32, f32, f32, f32) -> (f32, f32, f32, f32) + Sync,
{
    let stride = src.width() as usize * 4;
    let src_raw = src.as_raw();
    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        let row_in = &src_raw[y * stride..(y + 1) * stride];
        for (px_in, px_out) in row_in.chunks_exact(4).zip(row_out.chunks_exact_mut(4)) {
            let (nr, ng, nb, na) = transform(
                px_in[0] as f32,
                px_in[1] as f32,
                px_in[2] as f32,
                px_in[3] as f32,
            );
            px_out[0] = clamp_u8(nr);
            px_out[1] = clamp_u8(ng);
            px_out[2] = clamp_u8(nb);
            px_out[3] = clamp_u8(na);
        }
    })
}

/// Map R, G and B through their own lookup tables.
fn apply_luts(src: &RgbaImage, ctx: &JobContext, luts: [[u8; 256]; 3]) -> Result<RgbaImage> {
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        (
            luts[0][r as usize] as f32,
            luts[1][g as usize] as f32,
            luts[2][b as usize] as f32,
            a,
        )
    })
}

// ============================================================================
// INSTANT OPERATIONS
// ============================================================================

/// Invert all color channels (R, G, B). Alpha is preserved.
pub fn invert(src: &RgbaImage, ctx: &JobContext) -> Result<RgbaImage> {
    apply_pixel_transform(src, ctx, |r, g, b, a| (255.0 - r, 255.0 - g, 255.0 - b, a))
}

/// Sepia: luma shifted warm (+40 red, +20 green, -20 blue at `amount` 100).
/// `amount` in 0..100 scales the warm shift; 0 leaves plain grey.
pub fn sepia(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let k = amount.clamp(0.0, 100.0) / 100.0;
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let gray = luma(r, g, b);
        (gray + 40.0 * k, gray + 20.0 * k, gray - 20.0 * k, a)
    })
}

/// Move the white point. `amount` in -100..=90: channel values are scaled
/// so that `255 * (100 - amount) / 100` lands on white. Negative amounts
/// pull white down instead.
pub fn whites(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if amount == 0.0 {
        return Ok(src.clone());
    }
    let k = 100.0 / (100.0 - amount.clamp(-100.0, 90.0));
    apply_pixel_transform(src, ctx, move |r, g, b, a| (r * k, g * k, b * k, a))
}

/// Move the black point. `amount` in -100..=90: `255 * amount / 100` maps
/// to black and the rest of the range is stretched to fill. Negative
/// amounts lift the blacks.
pub fn blacks(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if amount == 0.0 {
        return Ok(src.clone());
    }
    let black = 255.0 * amount.clamp(-100.0, 90.0) / 100.0;
    let k = 255.0 / (255.0 - black);
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        ((r - black) * k, (g - black) * k, (b - black) * k, a)
    })
}

/// Converts to black-and-white by threshold on luminance.
/// `level`: 0..255, pixels at or above it become white, others black.
pub fn threshold(src: &RgbaImage, level: f32, ctx: &JobContext) -> Result<RgbaImage> {
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let v = if luma(r, g, b) >= level { 255.0 } else { 0.0 };
        (v, v, v, a)
    })
}

/// Reduces each channel to `levels` evenly spaced values.
/// `levels`: 2..=255
pub fn posterize(src: &RgbaImage, levels: u32, ctx: &JobContext) -> Result<RgbaImage> {
    let steps = (levels.clamp(2, 255) - 1) as f32;
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let p = |v: f32| (v / 255.0 * steps).round() / steps * 255.0;
        (p(r), p(g), p(b), a)
    })
}

// ============================================================================
// TONE
// ============================================================================

/// Additive brightness, `amount` in -100..100 (+50 turns 100 into 150).
pub fn brightness(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    apply_pixel_transform(src, ctx, move |r, g, b, a| (r + amount, g + amount, b + amount, a))
}

/// Contrast around mid-grey, `amount` in -100..100 (0 = no change).
pub fn contrast(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let factor = contrast_factor(amount);
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        (
            factor * (r - 128.0) + 128.0,
            factor * (g - 128.0) + 128.0,
            factor * (b - 128.0) + 128.0,
            a,
        )
    })
}

/// Brightness then contrast in a single pass.
pub fn brightness_contrast(src: &RgbaImage, brightness: f32, contrast: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let factor = contrast_factor(contrast);
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let nr = factor * (r + brightness - 128.0) + 128.0;
        let ng = factor * (g + brightness - 128.0) + 128.0;
        let nb = factor * (b + brightness - 128.0) + 128.0;
        (nr, ng, nb, a)
    })
}

fn contrast_factor(contrast: f32) -> f32 {
    let c = contrast.clamp(-100.0, 100.0);
    (259.0 * (c + 255.0)) / (255.0 * (259.0 - c))
}

/// Exposure in EV stops: gain = 2^ev.
pub fn exposure(src: &RgbaImage, ev: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let gain = 2.0f32.powf(ev.clamp(-5.0, 5.0));
    apply_pixel_transform(src, ctx, move |r, g, b, a| (r * gain, g * gain, b * gain, a))
}

/// Highlights/Shadows adjustment.
/// `shadows`: -100..100 (positive = brighten shadows)
/// `highlights`: -100..100 (positive = brighten highlights)
pub fn highlights_shadows(src: &RgbaImage, shadows: f32, highlights: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let shadow_amt = shadows / 100.0;
    let highlight_amt = highlights / 100.0;
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let lum = luma(r, g, b) / 255.0;
        // Shadow weight: strong for dark pixels, falls off for bright
        let sw = (1.0 - lum).powi(2);
        let hw = lum.powi(2);
        let adjustment = sw * shadow_amt * 128.0 + hw * highlight_amt * 128.0;
        (r + adjustment, g + adjustment, b + adjustment, a)
    })
}

/// Levels: remap `[in_black, in_white]` through `gamma` onto
/// `[out_black, out_white]`.
pub fn levels(
    src: &RgbaImage,
    in_black: f32,
    in_white: f32,
    gamma: f32,
    out_black: f32,
    out_white: f32,
    ctx: &JobContext,
) -> Result<RgbaImage> {
    let lut = build_levels_lut(in_black, in_white, gamma, out_black, out_white);
    apply_luts(src, ctx, [lut; 3])
}

fn build_levels_lut(in_black: f32, in_white: f32, gamma: f32, out_black: f32, out_white: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    let in_range = (in_white - in_black).max(1.0);
    let out_range = out_white - out_black;
    let inv_gamma = 1.0 / gamma.max(0.01);

    for (i, slot) in lut.iter_mut().enumerate() {
        let normalized = ((i as f32 - in_black) / in_range).clamp(0.0, 1.0);
        *slot = clamp_u8(out_black + normalized.powf(inv_gamma) * out_range);
    }
    lut
}

/// Curves from `(input, output)` control points in 0..255.
pub fn curves(src: &RgbaImage, points: &[(f32, f32)], ctx: &JobContext) -> Result<RgbaImage> {
    let lut = build_curves_lut(points);
    apply_luts(src, ctx, [lut; 3])
}

/// Build a 256-entry lookup table from curve control points using
/// monotone cubic (Fritsch-Carlson) interpolation.
pub fn build_curves_lut(points: &[(f32, f32)]) -> [u8; 256] {
    let mut lut = identity_lut();
    let mut points: Vec<(f32, f32)> = points.to_vec();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    points.dedup_by(|a, b| (a.0 - b.0).abs() < 1e-6);
    let n = points.len();
    if n < 2 {
        return lut;
    }

    let delta: Vec<f32> = points
        .windows(2)
        .map(|w| (w[1].1 - w[0].1) / (w[1].0 - w[0].0))
        .collect();

    // Tangents
    let mut m = vec![0.0f32; n];
    m[0] = delta[0];
    m[n - 1] = delta[n - 2];
    for i in 1..n - 1 {
        m[i] = if delta[i - 1] * delta[i] <= 0.0 {
            0.0
        } else {
            (delta[i - 1] + delta[i]) / 2.0
        };
    }

    // Ensure monotonicity
    for i in 0..n - 1 {
        if delta[i].abs() < 1e-6 {
            m[i] = 0.0;
            m[i + 1] = 0.0;
        } else {
            let alpha = m[i] / delta[i];
            let beta = m[i + 1] / delta[i];
            let s = alpha * alpha + beta * beta;
            if s > 9.0 {
                let tau = 3.0 / s.sqrt();
                m[i] = tau * alpha * delta[i];
                m[i + 1] = tau * beta * delta[i];
            }
        }
    }

    for (i, slot) in lut.iter_mut().enumerate() {
        let x = i as f32;
        let val = if x <= points[0].0 {
            points[0].1
        } else if x >= points[n - 1].0 {
            points[n - 1].1
        } else {
            let seg = points.iter().rposition(|p| x >= p.0).unwrap_or(0).min(n - 2);
            let (x0, y0) = points[seg];
            let (x1, y1) = points[seg + 1];
            let h = x1 - x0;
            let t = (x - x0) / h;
            let t2 = t * t;
            let t3 = t2 * t;
            // Hermite basis
            let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
            let h10 = t3 - 2.0 * t2 + t;
            let h01 = -2.0 * t3 + 3.0 * t2;
            let h11 = t3 - t2;
            h00 * y0 + h10 * h * m[seg] + h01 * y1 + h11 * h * m[seg + 1]
        };
        *slot = clamp_u8(val);
    }
    lut
}

fn identity_lut() -> [u8; 256] {
    std::array::from_fn(|i| i as u8)
}

// ============================================================================
// COLOR
// ============================================================================

/// Scale HSV saturation, `amount` in -100..100 (-100 = fully desaturated).
pub fn saturation(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let factor = 1.0 + amount.clamp(-100.0, 100.0) / 100.0;
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let (h, s, v) = rgb_to_hsv(r / 255.0, g / 255.0, b / 255.0);
        let (nr, ng, nb) = hsv_to_rgb(h, (s * factor).clamp(0.0, 1.0), v);
        (nr * 255.0, ng * 255.0, nb * 255.0, a)
    })
}

/// Rotate HSV hue by `degrees`.
pub fn hue_shift(src: &RgbaImage, degrees: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let shift = degrees / 360.0;
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let (h, s, v) = rgb_to_hsv(r / 255.0, g / 255.0, b / 255.0);
        let (nr, ng, nb) = hsv_to_rgb((h + shift).rem_euclid(1.0), s, v);
        (nr * 255.0, ng * 255.0, nb * 255.0, a)
    })
}

/// Temperature/Tint adjustment.
/// `temperature`: -100..100 (negative = cooler/blue, positive = warmer/yellow)
/// `tint`: -100..100 (negative = green, positive = magenta)
pub fn temperature_tint(src: &RgbaImage, temperature: f32, tint: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let temp_shift = temperature * 1.5;
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        (r + temp_shift, g - tint * 0.5, b - temp_shift, a)
    })
}

/// Boosts saturation selectively, less-saturated colors more.
/// `amount`: -100..100 (positive = boost, negative = reduce)
pub fn vibrance(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let v = amount / 100.0;
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
        let boost = if v >= 0.0 { v * (1.0 - s).powi(2) } else { v * s.powi(2) };
        let (nr, ng, nb) = hsl_to_rgb(h, (s + boost).clamp(0.0, 1.0), l);
        (nr * 255.0, ng * 255.0, nb * 255.0, a)
    })
}

/// Color balance per tonal range. Each entry is an `[r, g, b]` shift in
/// -100..100; shadows/midtones/highlights weights always sum to one.
pub fn color_balance(
    src: &RgbaImage,
    shadows: [f32; 3],
    midtones: [f32; 3],
    highlights: [f32; 3],
    ctx: &JobContext,
) -> Result<RgbaImage> {
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let lum = luma(r, g, b) / 255.0;
        let sw = (1.0 - lum * 2.0).max(0.0).powi(2);
        let hw = (lum * 2.0 - 1.0).max(0.0).powi(2);
        let mw = (1.0 - sw - hw).max(0.0);
        let adj = |i: usize| (sw * shadows[i] + mw * midtones[i] + hw * highlights[i]) * 1.28;
        (r + adj(0), g + adj(1), b + adj(2), a)
    })
}

/// Channel-mix monochrome. Weights are percentages, normalised by their sum
/// so (30, 59, 11) and (60, 118, 22) give the same result.
pub fn black_and_white(src: &RgbaImage, weights: [f32; 3], ctx: &JobContext) -> Result<RgbaImage> {
    let total: f32 = weights.iter().sum();
    let w = if total.abs() < 1e-6 {
        [1.0 / 3.0; 3]
    } else {
        weights.map(|v| v / total)
    };
    apply_pixel_transform(src, ctx, move |r, g, b, a| {
        let v = r * w[0] + g * w[1] + b * w[2];
        (v, v, v, a)
    })
}

// ============================================================================
// AUTOMATIC
// ============================================================================

/// Stretch each channel so the darkest and brightest 0.5% clip to 0 / 255.
pub fn auto_levels(src: &RgbaImage, ctx: &JobContext) -> Result<RgbaImage> {
    let hist = compute_histogram(src);
    let clip = (hist.count() as f32 * 0.005) as u64;
    let lut_for = |h: &[u32; 256]| {
        let (lo, hi) = clipped_range(h, clip);
        build_stretch_lut(lo, hi)
    };
    let luts = [lut_for(&hist.red), lut_for(&hist.green), lut_for(&hist.blue)];
    tracing::debug!(pixels = hist.count(), "auto levels");
    apply_luts(src, ctx, luts)
}

fn clipped_range(hist: &[u32; 256], clip: u64) -> (u8, u8) {
    let mut acc = 0u64;
    let mut lo = 0u8;
    for (i, &c) in hist.iter().enumerate() {
        acc += c as u64;
        if acc > clip {
            lo = i as u8;
            break;
        }
    }
    acc = 0;
    let mut hi = 255u8;
    for (i, &c) in hist.iter().enumerate().rev() {
        acc += c as u64;
        if acc > clip {
            hi = i as u8;
            break;
        }
    }
    (lo, hi)
}

fn build_stretch_lut(min: u8, max: u8) -> [u8; 256] {
    if max <= min {
        // No range to stretch
        return identity_lut();
    }
    let range = (max - min) as f32;
    std::array::from_fn(|i| {
        if i as u8 <= min {
            0
        } else if i as u8 >= max {
            255
        } else {
            clamp_u8((i as f32 - min as f32) / range * 255.0)
        }
    })
}

/// Auto levels followed by a gentle (x1.1) saturation lift.
pub fn auto_enhance(src: &RgbaImage, ctx: &JobContext) -> Result<RgbaImage> {
    let leveled = auto_levels(src, &ctx.span(0.0, 0.5))?;
    saturation(&leveled, 10.0, &ctx.span(0.5, 1.0))
}

/// Scale each channel so the image mean matches `target` (opaque pixels only).
pub fn color_match(src: &RgbaImage, target: [f32; 3], ctx: &JobContext) -> Result<RgbaImage> {
    let mean = channel_means(src);
    let gain: [f32; 3] = std::array::from_fn(|i| {
        if mean[i] < 1e-3 { 1.0 } else { target[i] / mean[i] }
    });
    tracing::debug!(?mean, ?gain, "color match");
    apply_pixel_transform(src, ctx, move |r, g, b, a| (r * gain[0], g * gain[1], b * gain[2], a))
}

/// Match `src` to the color cast of `reference`.
pub fn color_match_to(src: &RgbaImage, reference: &RgbaImage, ctx: &JobContext) -> Result<RgbaImage> {
    color_match(src, channel_means(reference), ctx)
}

/// Mean R, G, B over pixels with non-zero alpha.
pub fn channel_means(src: &RgbaImage) -> [f32; 3] {
    let mut sum = [0u64; 3];
    let mut n = 0u64;
    for p in src.pixels().filter(|p| p[3] > 0) {
        for c in 0..3 {
            sum[c] += p[c] as u64;
        }
        n += 1;
    }
    if n == 0 {
        return [0.0; 3];
    }
    sum.map(|s| s as f32 / n as f32)
}

// ============================================================================
// ANALYSIS
// ============================================================================

/// Per-channel histograms over pixels with non-zero alpha.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Histogram {
    pub red: [u32; 256],
    pub green: [u32; 256],
    pub blue: [u32; 256],
    pub luma: [u32; 256],
}

impl Histogram {
    pub fn count(&self) -> u64 {
        self.luma.iter().map(|&c| c as u64).sum()
    }
}

pub fn compute_histogram(src: &RgbaImage) -> Histogram {
    let mut hist = Histogram {
        red: [0; 256],
        green: [0; 256],
        blue: [0; 256],
        luma: [0; 256],
    };
    for p in src.pixels().filter(|p| p[3] > 0) {
        let [r, g, b, _] = p.0;
        hist.red[r as usize] += 1;
        hist.green[g as usize] += 1;
        hist.blue[b as usize] += 1;
        hist.luma[clamp_u8(luma(r as f32, g as f32, b as f32)) as usize] += 1;
    }
    hist
}

/// Average color of the `(2 * radius + 1)^2` window around (x, y),
/// clamped at the image edges. `None` for an empty image.
pub fn sample_color(src: &RgbaImage, x: u32, y: u32, radius: u32) -> Option<Rgba<u8>> {
    let (w, h) = src.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let r = radius as i64;
    let mut sum = [0u64; 4];
    let mut n = 0u64;
    for dy in -r..=r {
        for dx in -r..=r {
            let px = super::sample_clamped(src.as_raw(), w as usize, h as usize, x as i64 + dx, y as i64 + dy);
            for c in 0..4 {
                sum[c] += px[c] as u64;
            }
            n += 1;
        }
    }
    Some(Rgba(sum.map(|s| ((s as f64 / n as f64).round()) as u8)))
}

/// The `count` most frequent colors, sampling every 4th pixel on each axis
/// and quantising channels to steps of 32. Ties resolve to the brighter key.
pub fn extract_palette(src: &RgbaImage, count: usize) -> Vec<Rgba<u8>> {
    let mut freq: HashMap<[u8; 3], u32> = HashMap::new();
    for y in (0..src.height()).step_by(4) {
        for x in (0..src.width()).step_by(4) {
            let p = src.get_pixel(x, y);
            let key = [p[0] / 32 * 32, p[1] / 32 * 32, p[2] / 32 * 32];
            *freq.entry(key).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<([u8; 3], u32)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
    ranked
        .into_iter()
        .take(count)
        .map(|([r, g, b], _)| Rgba([r, g, b, 255]))
        .collect()
}

// ============================================================================
// COLOR SPACE HELPERS
// ============================================================================

/// RGB (0..1) → HSL (H: 0..1, S: 0..1, L: 0..1)
pub fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;

    if (max - min).abs() < 1e-6 {
        return (0.0, 0.0, l);
    }

    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };
    (hue_of(r, g, b, max, d), s, l)
}

/// HSL (H: 0..1, S: 0..1, L: 0..1) → RGB (0..1)
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s.abs() < 1e-6 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 { return p + (q - p) * 6.0 * t; }
    if t < 1.0 / 2.0 { return q; }
    if t < 2.0 / 3.0 { return p + (q - p) * (2.0 / 3.0 - t) * 6.0; }
    p
}

/// RGB (0..1) → HSV (all 0..1)
pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let d = max - min;
    if d < 1e-6 {
        return (0.0, 0.0, max);
    }
    let s = if max > 0.0 { d / max } else { 0.0 };
    (hue_of(r, g, b, max, d), s, max)
}

/// HSV (all 0..1) → RGB (0..1)
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    if s < 1e-6 {
        return (v, v, v);
    }
    let h6 = h.rem_euclid(1.0) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

fn hue_of(r: f32, g: f32, b: f32, max: f32, d: f32) -> f32 {
    if (max - r).abs() < 1e-6 {
        ((g - b) / d).rem_euclid(6.0) / 6.0
    } else if (max - g).abs() < 1e-6 {
        ((b - r) / d + 2.0) / 6.0
    } else {
        ((r - g) / d + 4.0) / 6.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> JobContext {
        JobContext::new()
    }

    fn gradient() -> RgbaImage {
        RgbaImage::from_fn(256, 4, |x, y| Rgba([x as u8, (255 - x) as u8, (x as u8).wrapping_mul(3), 255 - y as u8]))
    }

    /// brightness(+50) on (100,100,100) → (150,150,150); contrast(0) changes nothing.
    #[test]
    fn brightness_then_zero_contrast() {
        let img = RgbaImage::from_pixel(3, 3, Rgba([100, 100, 100, 255]));
        let bright = brightness(&img, 50.0, &ctx()).unwrap();
        assert!(bright.pixels().all(|p| p.0 == [150, 150, 150, 255]));
        let same = contrast(&bright, 0.0, &ctx()).unwrap();
        assert_eq!(same, bright);
        let both = brightness_contrast(&img, 50.0, 0.0, &ctx()).unwrap();
        assert_eq!(both, bright);
    }

    /// Extreme parameters clamp instead of wrapping.
    #[test]
    fn outputs_clamp() {
        let img = gradient();
        let hi = brightness(&img, 100.0, &ctx()).unwrap();
        assert!(hi.pixels().zip(img.pixels()).all(|(o, i)| o[0] >= i[0]));
        assert_eq!(hi.get_pixel(255, 0)[0], 255);
        let lo = brightness(&img, -100.0, &ctx()).unwrap();
        assert_eq!(lo.get_pixel(0, 0)[0], 0);
        let c = contrast(&img, 100.0, &ctx()).unwrap();
        assert_eq!(c.get_pixel(255, 0)[0], 255);
        assert_eq!(c.get_pixel(0, 0)[0], 0);
        let s = saturation(&img, 100.0, &ctx()).unwrap();
        assert_eq!(s.dimensions(), img.dimensions());
    }

    #[test]
    fn invert_twice_is_identity() {
        let img = gradient();
        let twice = invert(&invert(&img, &ctx()).unwrap(), &ctx()).unwrap();
        assert_eq!(twice, img);
    }

    /// Four levels over a full 0..255 ramp give exactly four values per channel.
    #[test]
    fn posterize_four_levels() {
        let img = gradient();
        let out = posterize(&img, 4, &ctx()).unwrap();
        let mut reds: Vec<u8> = out.pixels().map(|p| p[0]).collect();
        reds.sort_unstable();
        reds.dedup();
        assert_eq!(reds, vec![0, 85, 170, 255]);
    }

    #[test]
    fn saturation_minus_100_is_gray() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([200, 50, 10, 255]));
        let out = saturation(&img, -100.0, &ctx()).unwrap();
        let p = out.get_pixel(0, 0);
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
    }

    #[test]
    fn hue_full_turn_is_identity() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([200, 50, 10, 255]));
        let out = hue_shift(&img, 360.0, &ctx()).unwrap();
        assert_eq!(out, img);
        let red = RgbaImage::from_pixel(1, 1, Rgba([255, 0, 0, 255]));
        let green = hue_shift(&red, 120.0, &ctx()).unwrap();
        assert_eq!(green.get_pixel(0, 0).0, [0, 255, 0, 255]);
    }

    #[test]
    fn hsv_round_trip() {
        for &(r, g, b) in &[(0.2, 0.4, 0.6), (1.0, 0.0, 0.5), (0.3, 0.3, 0.3)] {
            let (h, s, v) = rgb_to_hsv(r, g, b);
            let (r2, g2, b2) = hsv_to_rgb(h, s, v);
            assert!((r - r2).abs() < 1e-4 && (g - g2).abs() < 1e-4 && (b - b2).abs() < 1e-4);
        }
    }

    #[test]
    fn exposure_one_stop_doubles() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([60, 100, 200, 255]));
        let out = exposure(&img, 1.0, &ctx()).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [120, 200, 255, 255]);
    }

    #[test]
    fn identity_curve_and_levels() {
        let img = gradient();
        assert_eq!(curves(&img, &[(0.0, 0.0), (255.0, 255.0)], &ctx()).unwrap(), img);
        assert_eq!(levels(&img, 0.0, 255.0, 1.0, 0.0, 255.0, &ctx()).unwrap(), img);
        let inverted = build_curves_lut(&[(0.0, 255.0), (255.0, 0.0)]);
        assert_eq!(inverted[0], 255);
        assert_eq!(inverted[255], 0);
    }

    #[test]
    fn threshold_and_sepia() {
        let img = RgbaImage::from_raw(2, 1, vec![10, 10, 10, 255, 240, 240, 240, 255]).unwrap();
        let t = threshold(&img, 128.0, &ctx()).unwrap();
        assert_eq!(t.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(t.get_pixel(1, 0).0, [255, 255, 255, 255]);
        let s = sepia(&img, 100.0, &ctx()).unwrap();
        assert_eq!(s.get_pixel(0, 0).0, [50, 30, 0, 255]);
        let half = sepia(&img, 50.0, &ctx()).unwrap();
        assert_eq!(half.get_pixel(0, 0).0, [30, 20, 0, 255]);
        let none = sepia(&img, 0.0, &ctx()).unwrap();
        assert_eq!(none.get_pixel(1, 0).0, [240, 240, 240, 255]);
    }

    #[test]
    fn whites_and_blacks_move_end_points() {
        let img = RgbaImage::from_raw(2, 1, vec![100, 100, 100, 255, 20, 40, 200, 128]).unwrap();
        let w = whites(&img, 50.0, &ctx()).unwrap();
        assert_eq!(w.get_pixel(0, 0).0, [200, 200, 200, 255]);
        assert_eq!(w.get_pixel(1, 0).0, [40, 80, 255, 128]);
        let dimmed = whites(&img, -100.0, &ctx()).unwrap();
        assert_eq!(dimmed.get_pixel(0, 0).0, [50, 50, 50, 255]);

        let b = blacks(&img, 20.0, &ctx()).unwrap();
        assert_eq!(b.get_pixel(0, 0).0, [61, 61, 61, 255]);
        assert_eq!(b.get_pixel(1, 0).0, [0, 0, 186, 128]);
        let lifted = blacks(&img, -100.0, &ctx()).unwrap();
        assert_eq!(lifted.get_pixel(1, 0)[0], 138);

        assert_eq!(whites(&img, 0.0, &ctx()).unwrap(), img);
        assert_eq!(blacks(&img, 0.0, &ctx()).unwrap(), img);
    }

    #[test]
    fn temperature_warms() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([100, 100, 100, 255]));
        let out = temperature_tint(&img, 20.0, 0.0, &ctx()).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [130, 100, 70, 255]);
    }

    /// A narrow-range image is stretched to the full range.
    #[test]
    fn auto_levels_stretches() {
        let img = RgbaImage::from_fn(100, 1, |x, _| {
            let v = 100 + (x as u8 / 2);
            Rgba([v, v, v, 255])
        });
        let out = auto_levels(&img, &ctx()).unwrap();
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(99, 0)[0], 255);
        let enhanced = auto_enhance(&img, &ctx()).unwrap();
        assert_eq!(enhanced.dimensions(), img.dimensions());
    }

    #[test]
    fn color_match_hits_target_mean() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([100, 50, 200, 255]));
        let out = color_match(&img, [50.0, 100.0, 100.0], &ctx()).unwrap();
        assert_eq!(out.get_pixel(2, 2).0, [50, 100, 100, 255]);
    }

    #[test]
    fn histogram_counts_opaque_pixels() {
        let mut img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        let h = compute_histogram(&img);
        assert_eq!(h.count(), 15);
        assert_eq!(h.red[10], 15);
        assert_eq!(h.blue[30], 15);
    }

    #[test]
    fn palette_and_sampling() {
        let mut img = RgbaImage::from_pixel(16, 16, Rgba([250, 10, 10, 255]));
        for y in 0..4 {
            for x in 0..16 {
                img.put_pixel(x, y, Rgba([5, 5, 250, 255]));
            }
        }
        let palette = extract_palette(&img, 4);
        assert_eq!(palette, vec![Rgba([224, 0, 0, 255]), Rgba([0, 0, 224, 255])]);
        assert_eq!(sample_color(&img, 8, 10, 1), Some(Rgba([250, 10, 10, 255])));
        assert_eq!(sample_color(&RgbaImage::new(0, 0), 0, 0, 1), None);
    }

    #[test]
    fn black_and_white_weights_normalise() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([90, 90, 90, 255]));
        let out = black_and_white(&img, [40.0, 40.0, 20.0], &ctx()).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [90, 90, 90, 255]);
    }
}
