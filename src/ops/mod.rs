// ============================================================================
// PIXEL OPERATIONS: shared job plumbing for every filter pass
// ============================================================================
//
// Filters are pure: they read a source bitmap and return a new one. Long
// passes run one rayon task per row and poll the job's cancel token once per
// row; a cancelled pass returns `StudioError::Cancelled`, never partial output.

pub mod adjustments;
pub mod effects;
pub mod filters;
pub mod mask;
pub mod pipeline;
pub mod transform;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use image::RgbaImage;
use rayon::prelude::*;

use crate::error::{Result, StudioError};

pub use pipeline::{Filter, Recipe, apply_filter, apply_filters};

/// Progress callback, receives a fraction in `0.0..=1.0`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// Cooperative cancellation flag shared between a job and whoever started it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything a long-running operation needs besides its pixels: the cancel
/// token it polls and the callback it reports progress through.
///
/// A context covers a `span` of the overall job so multi-pass filters can
/// hand each pass a slice of the progress range.
#[derive(Clone)]
pub struct JobContext {
    cancel: CancelToken,
    progress: Option<ProgressFn>,
    // Highest per-mille reported so far, shared by every span of one job.
    // Held while the callback runs so reports arrive in order.
    reported: Arc<Mutex<u32>>,
    span: (f32, f32),
}

impl Default for JobContext {
    fn default() -> Self {
        Self {
            cancel: CancelToken::new(),
            progress: None,
            reported: Arc::new(Mutex::new(0)),
            span: (0.0, 1.0),
        }
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("has_progress", &self.progress.is_some())
            .field("span", &self.span)
            .finish()
    }
}

impl JobContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, f: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once the token has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StudioError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report `fraction` of this span as done. Reports that would move the
    /// overall progress backwards are dropped.
    pub fn report(&self, fraction: f32) {
        let Some(cb) = &self.progress else { return };
        let (start, end) = self.span;
        let overall = (start + (end - start) * fraction.clamp(0.0, 1.0)).clamp(0.0, 1.0);
        let permille = (overall * 1000.0).round() as u32;
        let Ok(mut last) = self.reported.lock() else { return };
        if permille > *last {
            *last = permille;
            cb(overall);
        }
    }

    /// A child context covering `[start, end]` of this context's span.
    pub fn span(&self, start: f32, end: f32) -> JobContext {
        let (s, e) = self.span;
        let len = e - s;
        JobContext {
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            reported: Arc::clone(&self.reported),
            span: (s + len * start.clamp(0.0, 1.0), s + len * end.clamp(0.0, 1.0)),
        }
    }
}

/// Build a new image row by row in parallel.
///
/// `f(y, row_out)` fills one output row of `width * 4` bytes; it usually
/// reads the source through a captured reference. Rows are skipped once the
/// job is cancelled and the whole pass then fails with `Cancelled`.
pub(crate) fn map_rows<F>(width: u32, height: u32, ctx: &JobContext, f: F) -> Result<RgbaImage>
where
    F: Fn(usize, &mut [u8]) + Sync,
{
    let stride = width as usize * 4;
    if stride == 0 || height == 0 {
        return Ok(RgbaImage::new(width, height));
    }
    ctx.check()?;

    let mut out = vec![0u8; stride * height as usize];
    let done = AtomicUsize::new(0);
    let total = height as usize;
    let step = (total / 64).max(1);

    out.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        if ctx.is_cancelled() {
            return;
        }
        f(y, row);
        let n = done.fetch_add(1, Ordering::Relaxed) + 1;
        if n % step == 0 || n == total {
            ctx.report(n as f32 / total as f32);
        }
    });

    ctx.check()?;
    ctx.report(1.0);
    RgbaImage::from_raw(width, height, out)
        .ok_or_else(|| StudioError::size_mismatch((width, height), (0, 0)))
}

/// Raw RGBA bytes of one pixel, clamped to the image bounds.
#[inline]
pub(crate) fn sample_clamped(raw: &[u8], w: usize, h: usize, x: i64, y: i64) -> [u8; 4] {
    let cx = x.clamp(0, w as i64 - 1) as usize;
    let cy = y.clamp(0, h as i64 - 1) as usize;
    let i = (cy * w + cx) * 4;
    [raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]
}

/// BT.709 luma of an RGB triple, 0..255.
#[inline]
pub(crate) fn luma(r: f32, g: f32, b: f32) -> f32 {
    0.2126 * r + 0.7152 * g + 0.0722 * b
}

#[inline]
pub(crate) fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// RGBA bytes to alpha-premultiplied f32, 0..255 per channel. Neighbourhood
/// passes average in this space so transparent pixels add no colour.
pub(crate) fn premultiply(raw: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(raw.len());
    for px in raw.chunks_exact(4) {
        let a = px[3] as f32 / 255.0;
        out.extend_from_slice(&[px[0] as f32 * a, px[1] as f32 * a, px[2] as f32 * a, px[3] as f32]);
    }
    out
}

/// Back from premultiplied f32 to straight RGBA bytes.
#[inline]
pub(crate) fn unpremultiply(px: [f32; 4]) -> [u8; 4] {
    let a = clamp_u8(px[3]);
    if a == 0 {
        return [0, 0, 0, 0];
    }
    let k = 255.0 / px[3];
    [clamp_u8(px[0] * k), clamp_u8(px[1] * k), clamp_u8(px[2] * k), a]
}
