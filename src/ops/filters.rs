// ============================================================================
// IMAGE FILTERS: separable blurs and desaturation
// ============================================================================

use image::RgbaImage;
use rayon::prelude::*;

use super::{JobContext, clamp_u8, luma, map_rows, premultiply, unpremultiply};
use crate::error::{Result, StudioError};

/// Gaussian blur. `sigma` controls the strength; the kernel is truncated at
/// ceil(3 * sigma) and edges are clamped.
pub fn gaussian_blur(src: &RgbaImage, sigma: f32, ctx: &JobContext) -> Result<RgbaImage> {
    if sigma <= 0.0 {
        return Ok(src.clone());
    }
    separable_blur(src, &build_gaussian_kernel(sigma), ctx)
}

/// Box blur over a (2 * radius + 1) square window, edges clamped.
pub fn box_blur(src: &RgbaImage, radius: u32, ctx: &JobContext) -> Result<RgbaImage> {
    if radius == 0 {
        return Ok(src.clone());
    }
    let len = radius as usize * 2 + 1;
    separable_blur(src, &vec![1.0 / len as f32; len], ctx)
}

/// Convert to greyscale with BT.709 weights: 0.2126 R + 0.7152 G + 0.0722 B.
/// Alpha is preserved.
pub fn grayscale(src: &RgbaImage, ctx: &JobContext) -> Result<RgbaImage> {
    let stride = src.width() as usize * 4;
    let src_raw = src.as_raw();
    map_rows(src.width(), src.height(), ctx, |y, row_out| {
        let row_in = &src_raw[y * stride..(y + 1) * stride];
        for (px_in, px_out) in row_in.chunks_exact(4).zip(row_out.chunks_exact_mut(4)) {
            let lum = clamp_u8(luma(px_in[0] as f32, px_in[1] as f32, px_in[2] as f32));
            px_out[0] = lum;
            px_out[1] = lum;
            px_out[2] = lum;
            px_out[3] = px_in[3];
        }
    })
}

// ---------------------------------------------------------------------------
//  Parallel separable convolution (rayon)
// ---------------------------------------------------------------------------

/// Build a 1-D Gaussian kernel truncated at ceil(3*sigma).
pub fn build_gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (sigma * 3.0).ceil() as usize;
    if radius == 0 {
        return vec![1.0];
    }
    let len = radius * 2 + 1;
    let s2 = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..len)
        .map(|i| {
            let x = i as f32 - radius as f32;
            (-x * x / s2).exp()
        })
        .collect();
    let inv = 1.0 / kernel.iter().sum::<f32>();
    for v in &mut kernel {
        *v *= inv;
    }
    kernel
}

/// Horizontal then vertical pass of `kernel`, both row-parallel, on a
/// premultiplied f32 copy of the image.
fn separable_blur(src: &RgbaImage, kernel: &[f32], ctx: &JobContext) -> Result<RgbaImage> {
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 {
        return Ok(src.clone());
    }

    let buf_in = premultiply(src.as_raw());
    let buf_h = convolve_pass(&buf_in, w, h, kernel, true, &ctx.span(0.0, 0.5))?;
    let buf_v = convolve_pass(&buf_h, w, h, kernel, false, &ctx.span(0.5, 1.0))?;

    let dst_raw: Vec<u8> = buf_v
        .chunks_exact(4)
        .flat_map(|px| unpremultiply([px[0], px[1], px[2], px[3]]))
        .collect();
    RgbaImage::from_raw(w as u32, h as u32, dst_raw)
        .ok_or_else(|| StudioError::size_mismatch(src.dimensions(), (0, 0)))
}

fn convolve_pass(
    buf_in: &[f32],
    w: usize,
    h: usize,
    kernel: &[f32],
    horizontal: bool,
    ctx: &JobContext,
) -> Result<Vec<f32>> {
    let radius = (kernel.len() / 2) as isize;
    let mut out = vec![0.0f32; w * h * 4];
    let step = (h / 32).max(1);

    out.par_chunks_mut(w * 4).enumerate().for_each(|(y, row_out)| {
        if ctx.is_cancelled() {
            return;
        }
        for x in 0..w {
            let mut acc = [0.0f32; 4];
            for (ki, &kv) in kernel.iter().enumerate() {
                let offset = ki as isize - radius;
                let idx = if horizontal {
                    let sx = (x as isize + offset).clamp(0, w as isize - 1) as usize;
                    (y * w + sx) * 4
                } else {
                    let sy = (y as isize + offset).clamp(0, h as isize - 1) as usize;
                    (sy * w + x) * 4
                };
                for c in 0..4 {
                    acc[c] += buf_in[idx + c] * kv;
                }
            }
            row_out[x * 4..x * 4 + 4].copy_from_slice(&acc);
        }
        if y % step == 0 {
            ctx.report(y as f32 / h as f32);
        }
    });

    ctx.check()?;
    ctx.report(1.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// Blurring a flat image returns the same flat image.
    #[test]
    fn blur_of_flat_is_flat() {
        let img = RgbaImage::from_pixel(17, 9, Rgba([37, 180, 90, 200]));
        let ctx = JobContext::new();
        assert_eq!(gaussian_blur(&img, 2.5, &ctx).unwrap(), img);
        assert_eq!(box_blur(&img, 3, &ctx).unwrap(), img);
    }

    #[test]
    fn kernel_is_normalised_and_symmetric() {
        let k = build_gaussian_kernel(1.5);
        assert_eq!(k.len(), 11);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((k[0] - k[10]).abs() < 1e-7);
        assert!(k[5] > k[4]);
    }

    /// A single bright pixel spreads into its neighbours.
    #[test]
    fn blur_spreads_energy() {
        let mut img = RgbaImage::from_pixel(9, 9, Rgba([0, 0, 0, 255]));
        img.put_pixel(4, 4, Rgba([255, 255, 255, 255]));
        let out = box_blur(&img, 1, &JobContext::new()).unwrap();
        assert_eq!(out.get_pixel(4, 4)[0], 28);
        assert_eq!(out.get_pixel(3, 3)[0], 28);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn grayscale_is_idempotent() {
        let img = RgbaImage::from_fn(32, 8, |x, y| Rgba([(x * 8) as u8, (y * 30) as u8, (x * y) as u8, 255]));
        let ctx = JobContext::new();
        let once = grayscale(&img, &ctx).unwrap();
        let twice = grayscale(&once, &ctx).unwrap();
        assert_eq!(once, twice);
        assert!(once.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));
    }

    /// Colour hidden under alpha 0 must not leak into the visible side.
    #[test]
    fn transparent_colour_does_not_bleed() {
        let img = RgbaImage::from_fn(8, 1, |x, _| if x < 4 { Rgba([255, 0, 0, 0]) } else { Rgba([0, 0, 255, 255]) });
        let out = box_blur(&img, 1, &JobContext::new()).unwrap();
        assert_eq!(out.get_pixel(4, 0).0, [0, 0, 255, 170]);
        assert_eq!(out.get_pixel(3, 0).0, [0, 0, 255, 85]);
        assert_eq!(out.get_pixel(1, 0).0, [0, 0, 0, 0]);
    }

    #[test]
    fn cancelled_blur_fails() {
        let ctx = JobContext::new();
        ctx.cancel_token().cancel();
        let img = RgbaImage::from_pixel(8, 8, Rgba([1, 2, 3, 4]));
        assert!(gaussian_blur(&img, 1.0, &ctx).unwrap_err().is_cancelled());
    }
}
