// ============================================================================
// EFFECTS: neighborhood filters and the retouch heuristics built on them
// ============================================================================
//
// Effects read a window around each output pixel, so they always sample the
// untouched source and write into a fresh buffer, one rayon task per row.
//
// Edge policy differs per effect and is part of its contract:
//   - Blur / Sharpen / Radial / Lens: edges clamp (source coordinates are
//     clamped). Blurs average premultiplied colour.
//   - Clarity / Denoise / Skin smooth / Blemish: pixels whose window would
//     leave the image are copied through unchanged
//   - Remove background: border pixels have no full 4-neighbourhood and are
//     never classified as edges
// ============================================================================

use image::RgbaImage;

use super::adjustments::{apply_pixel_transform, contrast, saturation};
use super::filters::{box_blur, gaussian_blur};
use super::{JobContext, clamp_u8, luma, map_rows, premultiply, sample_clamped, unpremultiply};
use crate::error::Result;

// ============================================================================
// SHARED HELPERS
// ============================================================================

/// One pixel of a premultiplied f32 buffer, coordinates clamped.
#[inline]
fn texel(buf: &[f32], w: usize, h: usize, x: i64, y: i64) -> [f32; 4] {
    let cx = x.clamp(0, w as i64 - 1) as usize;
    let cy = y.clamp(0, h as i64 - 1) as usize;
    let i = (cy * w + cx) * 4;
    [buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]
}

/// Bilinear-sample a premultiplied buffer at fractional coordinates, edges
/// clamped.
#[inline]
fn sample_bilinear(buf: &[f32], w: usize, h: usize, fx: f32, fy: f32) -> [f32; 4] {
    let x0 = fx.floor() as i64;
    let y0 = fy.floor() as i64;
    let dx = fx - x0 as f32;
    let dy = fy - y0 as f32;

    let p00 = texel(buf, w, h, x0, y0);
    let p10 = texel(buf, w, h, x0 + 1, y0);
    let p01 = texel(buf, w, h, x0, y0 + 1);
    let p11 = texel(buf, w, h, x0 + 1, y0 + 1);

    let mut out = [0.0f32; 4];
    for c in 0..4 {
        out[c] = p00[c] * (1.0 - dx) * (1.0 - dy)
            + p10[c] * dx * (1.0 - dy)
            + p01[c] * (1.0 - dx) * dy
            + p11[c] * dx * dy;
    }
    out
}

/// Write the mean of `sum` over `n` samples into `px`.
#[inline]
fn write_mean(px: &mut [u8], sum: [f32; 4], n: f32) {
    px.copy_from_slice(&unpremultiply(sum.map(|v| v / n)));
}

/// Simple hash for deterministic noise.
#[inline]
fn hash_u32(mut x: u32) -> u32 {
    x = x.wrapping_mul(0x9E3779B9);
    x ^= x >> 16;
    x = x.wrapping_mul(0x85EBCA6B);
    x ^= x >> 13;
    x = x.wrapping_mul(0xC2B2AE35);
    x ^= x >> 16;
    x
}

/// Hash to f32 in [0, 1).
#[inline]
fn hash_f32(x: u32, y: u32, seed: u32) -> f32 {
    let h = hash_u32(
        x.wrapping_mul(374761393)
            .wrapping_add(y.wrapping_mul(668265263))
            .wrapping_add(seed),
    );
    (h & 0x00FFFFFF) as f32 / 16777216.0
}

/// HSL lightness, `(max + min) / 2` over RGB.
#[inline]
fn lightness(px: [u8; 4]) -> i32 {
    let max = px[0].max(px[1]).max(px[2]) as i32;
    let min = px[0].min(px[1]).min(px[2]) as i32;
    (max + min) / 2
}

/// Heuristic skin-tone classifier: warm pixels with r > g > b inside fixed
/// per-channel bands.
#[inline]
pub fn is_skin_tone(r: u8, g: u8, b: u8) -> bool {
    r > 60 && g > 40 && g < 220 && b > 20 && b < 170 && r > g && g > b
}

/// Copy source row `y` into `row_out`; the starting point for effects that
/// leave part of the row untouched.
#[inline]
fn copy_row(raw: &[u8], stride: usize, y: usize, row_out: &mut [u8]) {
    row_out.copy_from_slice(&raw[y * stride..(y + 1) * stride]);
}

// ============================================================================
// BLUR EFFECTS
// ============================================================================

/// Average `2 * ceil(distance) + 1` samples along the direction `angle_deg`.
pub fn motion_blur(src: &RgbaImage, angle_deg: f32, distance: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if distance < 1.0 {
        return Ok(src.clone());
    }
    let w = src.width() as usize;
    let h = src.height() as usize;
    let buf = premultiply(src.as_raw());

    let angle = angle_deg.to_radians();
    let steps = distance.ceil() as i64;
    let (dx, dy) = (angle.cos(), angle.sin());
    let n = (steps * 2 + 1) as f32;

    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        for x in 0..w {
            let mut sum = [0.0f32; 4];
            for i in -steps..=steps {
                let sx = (x as f32 + i as f32 * dx).round() as i64;
                let sy = (y as f32 + i as f32 * dy).round() as i64;
                let p = texel(&buf, w, h, sx, sy);
                for c in 0..4 {
                    sum[c] += p[c];
                }
            }
            write_mean(&mut row_out[x * 4..x * 4 + 4], sum, n);
        }
    })
}

/// Zoom blur toward `center`, given as fractions of width and height
/// (`(0.5, 0.5)` is the image centre). `amount` in 0..100; each pixel
/// averages `amount / 5 + 3` samples on the segment between itself and a
/// point `amount`% of the way to the centre.
pub fn radial_blur(src: &RgbaImage, amount: f32, center: (f32, f32), ctx: &JobContext) -> Result<RgbaImage> {
    let amount = amount.clamp(0.0, 100.0);
    if amount <= 0.0 {
        return Ok(src.clone());
    }
    let w = src.width() as usize;
    let h = src.height() as usize;
    let buf = premultiply(src.as_raw());
    let cx = w as f32 * center.0.clamp(0.0, 1.0);
    let cy = h as f32 * center.1.clamp(0.0, 1.0);
    let samples = (amount as u32 / 5 + 3) as usize;
    let pull = amount / 100.0;

    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        for x in 0..w {
            let ox = x as f32 - cx;
            let oy = y as f32 - cy;
            let mut sum = [0.0f32; 4];
            for i in 0..samples {
                let t = i as f32 / samples as f32;
                let scale = 1.0 - t * pull;
                let p = sample_bilinear(&buf, w, h, cx + ox * scale, cy + oy * scale);
                for c in 0..4 {
                    sum[c] += p[c];
                }
            }
            write_mean(&mut row_out[x * 4..x * 4 + 4], sum, samples as f32);
        }
    })
}

/// Lens (bokeh) blur: flat average over a disc of `radius` pixels, so bright
/// points spread into discs rather than gaussian blobs. Edges clamp.
pub fn lens_blur(src: &RgbaImage, radius: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if radius < 1.0 {
        return Ok(src.clone());
    }
    let w = src.width() as usize;
    let h = src.height() as usize;
    let buf = premultiply(src.as_raw());

    let r = radius.floor() as i64;
    let r2 = radius * radius;
    let disc: Vec<(i64, i64)> = (-r..=r)
        .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
        .filter(|&(dx, dy)| (dx * dx + dy * dy) as f32 <= r2)
        .collect();
    let n = disc.len() as f32;

    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        for x in 0..w {
            let mut sum = [0.0f32; 4];
            for &(dx, dy) in &disc {
                let p = texel(&buf, w, h, x as i64 + dx, y as i64 + dy);
                for c in 0..4 {
                    sum[c] += p[c];
                }
            }
            write_mean(&mut row_out[x * 4..x * 4 + 4], sum, n);
        }
    })
}

// ============================================================================
// DETAIL
// ============================================================================

/// Unsharp mask: `s + amount * (s - gaussian(s, radius))`. Alpha is kept.
pub fn sharpen(src: &RgbaImage, amount: f32, radius: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if amount <= 0.0 || radius <= 0.0 {
        return Ok(src.clone());
    }
    let blurred = gaussian_blur(src, radius, &ctx.span(0.0, 0.5))?;
    let stride = src.width() as usize * 4;
    let raw = src.as_raw();
    let blur_raw = blurred.as_raw();

    map_rows(src.width(), src.height(), &ctx.span(0.5, 1.0), |y, row_out| {
        let base = y * stride;
        for (i, px) in row_out.chunks_exact_mut(4).enumerate() {
            let si = base + i * 4;
            for c in 0..3 {
                let s = raw[si + c] as f32;
                let b = blur_raw[si + c] as f32;
                px[c] = clamp_u8(s + amount * (s - b));
            }
            px[3] = raw[si + 3];
        }
    })
}

const CLARITY_RADIUS: usize = 10;

/// Local contrast: push each pixel away from its radius-10 box mean by
/// `amount`%. Pixels closer than the radius to an edge are left as is.
pub fn clarity(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if amount == 0.0 {
        return Ok(src.clone());
    }
    let w = src.width() as usize;
    let h = src.height() as usize;
    let r = CLARITY_RADIUS;
    // Inside the border the clamped box blur equals the true window mean.
    let mean = box_blur(src, r as u32, &ctx.span(0.0, 0.6))?;
    let raw = src.as_raw();
    let mean_raw = mean.as_raw();
    let stride = w * 4;
    let k = amount / 100.0;

    map_rows(src.width(), src.height(), &ctx.span(0.6, 1.0), |y, row_out| {
        copy_row(raw, stride, y, row_out);
        if y < r || y + r >= h {
            return;
        }
        for x in r..w.saturating_sub(r) {
            let si = y * stride + x * 4;
            for c in 0..3 {
                let v = raw[si + c] as f32;
                row_out[x * 4 + c] = clamp_u8(v + (v - mean_raw[si + c] as f32) * k);
            }
        }
    })
}

/// Median noise reduction with window radius `amount / 50 + 1`.
/// Border pixels are copied through.
pub fn denoise(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if amount <= 0.0 {
        return Ok(src.clone());
    }
    let radius = amount as usize / 50 + 1;
    median_interior(src, radius, ctx)
}

fn median_interior(src: &RgbaImage, radius: usize, ctx: &JobContext) -> Result<RgbaImage> {
    let w = src.width() as usize;
    let h = src.height() as usize;
    let raw = src.as_raw();
    let stride = w * 4;
    let r = radius as i64;

    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        copy_row(raw, stride, y, row_out);
        if y < radius || y + radius >= h {
            return;
        }
        let mut channels: [Vec<u8>; 4] = Default::default();
        for x in radius..w.saturating_sub(radius) {
            for c in &mut channels {
                c.clear();
            }
            for dy in -r..=r {
                for dx in -r..=r {
                    let p = sample_clamped(raw, w, h, x as i64 + dx, y as i64 + dy);
                    for c in 0..4 {
                        channels[c].push(p[c]);
                    }
                }
            }
            for c in 0..4 {
                channels[c].sort_unstable();
                row_out[x * 4 + c] = channels[c][channels[c].len() / 2];
            }
        }
    })
}

// ============================================================================
// RETOUCH
// ============================================================================

/// Soften skin-toned pixels. `strength` in 0..1 picks both the box radius
/// (`round(strength * 5) + 1`) and how far each pixel moves toward the box
/// mean. Non-skin pixels and the border are untouched.
pub fn skin_smooth(src: &RgbaImage, strength: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let strength = strength.clamp(0.0, 1.0);
    if strength <= 0.0 {
        return Ok(src.clone());
    }
    let radius = (strength * 5.0).round() as usize + 1;
    let w = src.width() as usize;
    let h = src.height() as usize;
    let mean = box_blur(src, radius as u32, &ctx.span(0.0, 0.6))?;
    let raw = src.as_raw();
    let mean_raw = mean.as_raw();
    let stride = w * 4;

    map_rows(src.width(), src.height(), &ctx.span(0.6, 1.0), |y, row_out| {
        copy_row(raw, stride, y, row_out);
        if y < radius || y + radius >= h {
            return;
        }
        for x in radius..w.saturating_sub(radius) {
            let si = y * stride + x * 4;
            if !is_skin_tone(raw[si], raw[si + 1], raw[si + 2]) {
                continue;
            }
            for c in 0..3 {
                let v = raw[si + c] as f32;
                let m = mean_raw[si + c] as f32;
                row_out[x * 4 + c] = clamp_u8(v + (m - v) * strength);
            }
        }
    })
}

/// Replace small dark spots. A pixel whose RGB average sits more than
/// `30 * strength` below the mean lightness of its four neighbours takes the
/// neighbours' average colour. A two-pixel border is skipped.
pub fn remove_blemishes(src: &RgbaImage, strength: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if strength <= 0.0 {
        return Ok(src.clone());
    }
    let w = src.width() as usize;
    let h = src.height() as usize;
    let raw = src.as_raw();
    let stride = w * 4;
    let limit = 30.0 * strength;

    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        copy_row(raw, stride, y, row_out);
        if y < 2 || y + 2 >= h {
            return;
        }
        for x in 2..w.saturating_sub(2) {
            let (xi, yi) = (x as i64, y as i64);
            let here = sample_clamped(raw, w, h, xi, yi);
            let around = [
                sample_clamped(raw, w, h, xi - 1, yi),
                sample_clamped(raw, w, h, xi + 1, yi),
                sample_clamped(raw, w, h, xi, yi - 1),
                sample_clamped(raw, w, h, xi, yi + 1),
            ];
            let around_l = around.iter().map(|&p| lightness(p)).sum::<i32>() as f32 / 4.0;
            let here_avg = (here[0] as f32 + here[1] as f32 + here[2] as f32) / 3.0;
            if around_l - here_avg <= limit {
                continue;
            }
            for c in 0..3 {
                let sum: u32 = around.iter().map(|p| p[c] as u32).sum();
                row_out[x * 4 + c] = (sum / 4) as u8;
            }
        }
    })
}

/// Default edge threshold for [`remove_background`].
pub const BACKGROUND_THRESHOLD: f32 = 30.0;

/// Crude subject cut-out. Pixels on a strong lightness edge (summed
/// 4-neighbour difference above `4 * threshold`) or inside the central
/// 0.1..=0.9 rectangle (bounds inclusive) keep their colour; everything
/// else becomes fully transparent.
pub fn remove_background(src: &RgbaImage, threshold: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let w = src.width() as usize;
    let h = src.height() as usize;
    let raw = src.as_raw();
    let stride = w * 4;
    let edge_limit = (threshold.max(0.0) * 4.0) as i32;
    let (wf, hf) = (w as f32, h as f32);

    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        let yf = y as f32;
        let central_row = yf >= hf * 0.1 && yf <= hf * 0.9;
        for x in 0..w {
            let xf = x as f32;
            let mut keep = central_row && xf >= wf * 0.1 && xf <= wf * 0.9;
            if !keep && x > 0 && x + 1 < w && y > 0 && y + 1 < h {
                let (xi, yi) = (x as i64, y as i64);
                let l = lightness(sample_clamped(raw, w, h, xi, yi));
                let diff: i32 = [(xi - 1, yi), (xi + 1, yi), (xi, yi - 1), (xi, yi + 1)]
                    .iter()
                    .map(|&(nx, ny)| (l - lightness(sample_clamped(raw, w, h, nx, ny))).abs())
                    .sum();
                keep = diff > edge_limit;
            }
            let si = y * stride + x * 4;
            let px = &mut row_out[x * 4..x * 4 + 4];
            if keep {
                px.copy_from_slice(&raw[si..si + 4]);
            } else {
                px.fill(0);
            }
        }
    })
}

/// Skin smoothing at half strength plus a +10 lift across the eye band
/// (`h/3 ± 20` rows, middle half of the columns).
pub fn portrait_enhance(src: &RgbaImage, ctx: &JobContext) -> Result<RgbaImage> {
    let smooth = skin_smooth(src, 0.5, &ctx.span(0.0, 0.8))?;
    let w = smooth.width() as usize;
    let h = smooth.height() as usize;
    let eye_y = (h / 3) as i64;
    let band = (eye_y - 20).max(0) as usize..((eye_y + 20).max(0) as usize).min(h);
    let cols = w / 4..w * 3 / 4;
    let raw = smooth.as_raw();
    let stride = w * 4;

    map_rows(smooth.width(), smooth.height(), &ctx.span(0.8, 1.0), |y, row_out| {
        copy_row(raw, stride, y, row_out);
        if !band.contains(&y) {
            return;
        }
        for x in cols.clone() {
            for c in 0..3 {
                let v = &mut row_out[x * 4 + c];
                *v = v.saturating_add(10);
            }
        }
    })
}

// ============================================================================
// STYLIZE
// ============================================================================

/// Darken toward the corners. The fall-off starts at `1 - feather/100` of
/// the centre-to-corner distance and reaches `1 - amount/100` at the corner.
/// Both parameters are in 0..100.
pub fn vignette(src: &RgbaImage, amount: f32, feather: f32, ctx: &JobContext) -> Result<RgbaImage> {
    let amount = amount.clamp(0.0, 100.0) / 100.0;
    if amount <= 0.0 {
        return Ok(src.clone());
    }
    let feather = feather.clamp(0.0, 100.0) / 100.0;
    let w = src.width() as usize;
    let raw = src.as_raw();
    let stride = w * 4;
    let cx = src.width() as f32 / 2.0;
    let cy = src.height() as f32 / 2.0;
    let max_dist = (cx * cx + cy * cy).sqrt();
    let inner = max_dist * (1.0 - feather);
    let ramp = max_dist * feather;

    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        copy_row(raw, stride, y, row_out);
        let dy = y as f32 - cy;
        for x in 0..w {
            let dx = x as f32 - cx;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist <= inner {
                continue;
            }
            let t = if ramp > 0.0 { ((dist - inner) / ramp).min(1.0) } else { 1.0 };
            let factor = (1.0 - t * amount).max(0.0);
            for c in 0..3 {
                let v = &mut row_out[x * 4 + c];
                *v = clamp_u8(*v as f32 * factor);
            }
        }
    })
}

/// Monochrome film grain: every pixel gets the same offset on R, G and B,
/// `(noise - 128) * amount / 100` with noise a deterministic hash of
/// position and `seed`.
pub fn film_grain(src: &RgbaImage, amount: f32, seed: u32, ctx: &JobContext) -> Result<RgbaImage> {
    if amount <= 0.0 {
        return Ok(src.clone());
    }
    let w = src.width() as usize;
    let raw = src.as_raw();
    let stride = w * 4;
    let k = amount / 100.0;

    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        copy_row(raw, stride, y, row_out);
        for x in 0..w {
            let noise = (hash_f32(x as u32, y as u32, seed) * 256.0).floor() - 128.0;
            for c in 0..3 {
                let v = &mut row_out[x * 4 + c];
                *v = clamp_u8(*v as f32 + noise * k);
            }
        }
    })
}

/// Faded warm film look: desaturate by `0.3 * amount`, push red up and blue
/// down, then a soft vignette at half the amount.
pub fn vintage(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if amount <= 0.0 {
        return Ok(src.clone());
    }
    let faded = saturation(src, -0.3 * amount, &ctx.span(0.0, 0.35))?;
    let (red, blue) = (0.3 * amount, 0.2 * amount);
    let warm = apply_pixel_transform(&faded, &ctx.span(0.35, 0.7), move |r, g, b, a| {
        (r + red, g, b - blue, a)
    })?;
    vignette(&warm, amount * 0.5, 50.0, &ctx.span(0.7, 1.0))
}

/// Haze removal: contrast at half the amount, then cool the blue channel.
pub fn dehaze(src: &RgbaImage, amount: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if amount <= 0.0 {
        return Ok(src.clone());
    }
    let punched = contrast(src, amount * 0.5, &ctx.span(0.0, 0.5))?;
    let blue = 0.3 * amount;
    apply_pixel_transform(&punched, &ctx.span(0.5, 1.0), move |r, g, b, a| (r, g, b - blue, a))
}

/// Mean luma of an image, 0..255. Used by tests and the bench to compare
/// overall brightness.
pub fn mean_luma(src: &RgbaImage) -> f32 {
    let n = src.width() as usize * src.height() as usize;
    if n == 0 {
        return 0.0;
    }
    let total: f64 = src
        .pixels()
        .map(|p| luma(p[0] as f32, p[1] as f32, p[2] as f32) as f64)
        .sum();
    (total / n as f64) as f32
}
