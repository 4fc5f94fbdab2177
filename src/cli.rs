// ============================================================================
// Knoux CLI: headless batch processing via command-line arguments
// ============================================================================
//
// Usage examples:
//   knoux -i photo.png -f brightness=20 -f contrast=10 -o result.png
//   knoux -i photo.jpg -o out.png                      (format inferred from output ext)
//   knoux -i "*.jpg" --recipe warm.json --output-dir processed/ --format png
//   knoux -i portrait.jpg -f skin-smooth=0.6 --region 0.1,0.1,0.9,0.9 -o soft.jpg
//   knoux -i sky.jpg -f blacks=15 --gradient 0.5,0,0.5,0.6 -o sky_out.jpg
//   knoux -i face.jpg -f lens-blur=6 --radial 0.5,0.4,0.6 -o bokeh.jpg
//   knoux -i base.png --overlay tex.png --blend multiply --opacity 0.5 -o mix.png
//   knoux -i project.kxs -o flat.jpg --quality 85
//
// Each input is loaded, optionally blended with an overlay, run through the
// filter chain on a background worker, and saved.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::canvas::{BlendMode, CanvasState, Layer};
use crate::error::{Result, StudioError};
use crate::io::{SaveFormat, SaveOptions, TiffCompression};
use crate::logger;
use crate::ops::mask::{MaskShape, Region};
use crate::ops::transform;
use crate::ops::{Filter, Recipe};
use crate::project::StudioContext;
use crate::worker::FilterWorker;

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// Knoux Studio headless image processor.
#[derive(Parser, Debug)]
#[command(
    name = "knoux",
    version,
    about = "Knoux Studio headless batch image processor",
    long_about = "Apply filter chains to image files and convert between formats.\n\
                  Reads anything the image crate decodes plus .kxs projects; writes\n\
                  PNG, JPEG, WEBP, BMP, TGA, ICO, TIFF and .kxs.\n\n\
                  Example:\n  \
                  knoux -i photo.png -f brightness=20 -f sharpen=1.5,1 -o result.png\n  \
                  knoux -i \"*.jpg\" --recipe warm.json --output-dir out/ --format png"
)]
pub struct CliArgs {
    /// Input file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    #[arg(short, long, required = true, num_args = 1..)]
    pub input: Vec<String>,

    /// Filter to apply, `name` or `name=v1,v2,...`. Repeat to chain; runs after --recipe.
    #[arg(short, long = "filter", value_name = "NAME[=ARGS]")]
    pub filters: Vec<Filter>,

    /// JSON recipe file with a list of filters.
    #[arg(long, value_name = "RECIPE.json")]
    pub recipe: Option<PathBuf>,

    /// Image to blend over each input before filtering. Resized to fit.
    #[arg(long, value_name = "FILE")]
    pub overlay: Option<PathBuf>,

    /// Blend mode for --overlay.
    #[arg(long, default_value = "normal", value_name = "MODE")]
    pub blend: BlendMode,

    /// Opacity for --overlay, 0.0–1.0.
    #[arg(long, default_value_t = 1.0, value_name = "0-1")]
    pub opacity: f32,

    /// Restrict pixel filters to a rectangle given as fractions `x0,y0,x1,y1`.
    #[arg(long, value_name = "X0,Y0,X1,Y1", value_parser = parse_region, conflicts_with_all = ["gradient", "radial"])]
    pub region: Option<Region>,

    /// Fade pixel filters out along a line: full strength at `x0,y0`, none at `x1,y1` (fractions).
    #[arg(long, value_name = "X0,Y0,X1,Y1", value_parser = parse_gradient, conflicts_with = "radial")]
    pub gradient: Option<MaskShape>,

    /// Fade pixel filters out from a centre `cx,cy` to radius `r` (fractions; r of the shorter side).
    #[arg(long, value_name = "CX,CY,R", value_parser = parse_radial)]
    pub radial: Option<MaskShape>,

    /// Output file path. Only valid for single-file input.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch processing.
    /// Files are written here with the original stem and the target format's extension.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Output format: png, jpeg, webp, bmp, tga, ico, tiff.
    /// When omitted, the format is inferred from --output's extension, defaulting to png.
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<SaveFormat>,

    /// JPEG quality (1–100). Defaults to the configured value.
    #[arg(short, long, value_name = "1-100", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: Option<u8>,

    /// TIFF compression mode: none, lzw, deflate.
    #[arg(long, value_name = "MODE")]
    pub tiff_compression: Option<TiffCompression>,

    /// Settings file to use instead of the platform default.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Debug logging plus per-file progress and timing.
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_fractions(s: &str, what: &str) -> std::result::Result<Vec<f32>, String> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("{what} values must be numbers: {e}"))?;
    if let Some(bad) = parts.iter().find(|v| !(0.0..=1.0).contains(*v)) {
        return Err(format!("{what} value {bad} is outside 0..=1"));
    }
    Ok(parts)
}

fn parse_region(s: &str) -> std::result::Result<Region, String> {
    let parts = parse_fractions(s, "region")?;
    let [x0, y0, x1, y1] = parts[..] else {
        return Err(format!("expected 4 values x0,y0,x1,y1, got {}", parts.len()));
    };
    let region = Region::new(x0, y0, x1, y1);
    if region.is_empty() {
        return Err("region is empty".into());
    }
    Ok(region)
}

fn parse_gradient(s: &str) -> std::result::Result<MaskShape, String> {
    let parts = parse_fractions(s, "gradient")?;
    let [x0, y0, x1, y1] = parts[..] else {
        return Err(format!("expected 4 values x0,y0,x1,y1, got {}", parts.len()));
    };
    Ok(MaskShape::Gradient { start: [x0, y0], end: [x1, y1] })
}

fn parse_radial(s: &str) -> std::result::Result<MaskShape, String> {
    let parts = parse_fractions(s, "radial")?;
    let [cx, cy, radius] = parts[..] else {
        return Err(format!("expected 3 values cx,cy,r, got {}", parts.len()));
    };
    if radius <= 0.0 {
        return Err("radial radius must be above 0".into());
    }
    Ok(MaskShape::Radial { center: [cx, cy], radius })
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files succeeded, `1` = one or more files failed.
pub fn run(args: CliArgs) -> ExitCode {
    let ctx = StudioContext::from_config(args.config.as_deref());
    logger::init(args.verbose, &ctx.settings.log_level);
    run_batch(&args, &ctx)
}

/// Everything after logging setup: resolve inputs and process each one.
pub fn run_batch(args: &CliArgs, ctx: &StudioContext) -> ExitCode {
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    // Multiple inputs require --output-dir, not --output
    if inputs.len() > 1 && args.output.is_some() {
        eprintln!(
            "error: {} input files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch processing.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    let job = match BatchJob::from_args(args, ctx) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut worker = FilterWorker::new();
    let mut failures = 0usize;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }

        let file_start = Instant::now();

        let output_path = match build_output_path(
            input_path,
            args.output.as_deref(),
            args.output_dir.as_deref(),
            job.format,
        ) {
            Some(p) => p,
            None => {
                eprintln!("  error: cannot determine output path for '{}'.", input_path.display());
                failures += 1;
                continue;
            }
        };

        match job.run_one(ctx, &mut worker, input_path, &output_path, args.verbose) {
            Ok(()) => {
                if args.verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output_path.display(),
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                tracing::error!(input = %input_path.display(), "{e}");
                eprintln!("  error: {e}");
                failures += 1;
            }
        }
    }

    tracing::info!(total, failures, "batch finished");
    if failures > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

// ============================================================================
// Per-file processing pipeline
// ============================================================================

/// Settings shared by every file in one invocation.
struct BatchJob {
    filters: Vec<Filter>,
    overlay: Option<(image::RgbaImage, BlendMode, f32)>,
    mask: Option<MaskShape>,
    format: SaveFormat,
    options: SaveOptions,
}

impl BatchJob {
    fn from_args(args: &CliArgs, ctx: &StudioContext) -> Result<Self> {
        let mut filters = match &args.recipe {
            Some(path) => Recipe::load(path)?.filters,
            None => Vec::new(),
        };
        filters.extend(args.filters.iter().cloned());

        if !(0.0..=1.0).contains(&args.opacity) {
            return Err(StudioError::invalid("opacity", format!("{} is outside 0..=1", args.opacity)));
        }
        let overlay = match &args.overlay {
            Some(path) => Some((crate::io::load_image(path)?.composite(), args.blend, args.opacity)),
            None => None,
        };

        let format = parse_format(args.format, args.output.as_deref());
        let options = SaveOptions {
            format,
            quality: args.quality.unwrap_or(ctx.settings.jpeg_quality),
            tiff_compression: args.tiff_compression.unwrap_or(ctx.settings.tiff_compression),
        };

        Ok(Self {
            filters,
            overlay,
            mask: args.region.map(MaskShape::Rect).or(args.gradient).or(args.radial),
            format,
            options,
        })
    }

    fn run_one(
        &self,
        ctx: &StudioContext,
        worker: &mut FilterWorker,
        input: &Path,
        output: &Path,
        verbose: bool,
    ) -> Result<()> {
        // -- Step 1: Load ----------------------------------------------------
        let mut doc = ctx.open_document(input)?;

        // -- Step 2: Overlay (optional) --------------------------------------
        if let Some((overlay, mode, opacity)) = &self.overlay {
            let (w, h) = (doc.canvas.width, doc.canvas.height);
            let pixels = if overlay.dimensions() == (w, h) {
                overlay.clone()
            } else {
                transform::resize(overlay, w, h, ctx.settings.default_interpolation)?
            };
            doc.canvas.add_layer(Layer::from_image("Overlay", pixels).with_blend(*mode, *opacity))?;
        }

        // -- Step 3: Filter chain on the worker ------------------------------
        if !self.filters.is_empty() {
            doc.canvas.flatten();
            let image = doc.canvas.composite();
            let mask = self.mask.map(|m| m.to_mask(image.width(), image.height()));
            let job = worker.submit(image, self.filters.clone(), mask)?;

            let mut shown = 0u32;
            let result = worker.wait(job, |fraction| {
                let pct = (fraction * 100.0) as u32;
                if verbose && pct >= shown + 10 {
                    shown = pct - pct % 10;
                    eprintln!("  {pct:>3}%");
                }
            })?;
            doc.canvas = CanvasState::from_image(result);
            doc.dirty = true;
        }

        // -- Step 4: Save ----------------------------------------------------
        doc.save_as(output, &self.options)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// Choose the [`SaveFormat`] from `--format` or infer it from the output
/// extension. Defaults to PNG when neither is known.
fn parse_format(format_arg: Option<SaveFormat>, output: Option<&Path>) -> SaveFormat {
    format_arg
        .or_else(|| output.and_then(SaveFormat::from_path))
        .unwrap_or_default()
}

/// Compute the output path for a single input file.
///
/// Priority:
/// 1. `--output` (explicit path, used for single-file input)
/// 2. `--output-dir` (batch directory, derives filename from input stem)
/// 3. Fallback: same directory as input, same stem, new extension
///    (appends `_out` to stem if it would collide with the input path)
fn build_output_path(input: &Path, output: Option<&Path>, output_dir: Option<&Path>, format: SaveFormat) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }

    let ext = format.extension();
    let stem = input.file_stem()?.to_string_lossy().into_owned();

    if let Some(dir) = output_dir {
        return Some(dir.join(format!("{}.{}", stem, ext)));
    }

    let parent = input.parent().unwrap_or(Path::new("."));
    let candidate = parent.join(format!("{}.{}", stem, ext));

    // Avoid silent overwrite of the input
    if candidate == input {
        Some(parent.join(format!("{}_out.{}", stem, ext)))
    } else {
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("knoux").chain(args.iter().copied())).unwrap()
    }

    fn write_png(path: &Path, pixel: [u8; 4]) {
        RgbaImage::from_pixel(8, 8, Rgba(pixel)).save(path).unwrap();
    }

    #[test]
    fn parses_filters_and_options() {
        let args = parse(&[
            "-i", "a.png", "-f", "brightness=20", "-f", "invert", "--blend", "screen",
            "--region", "0,0,0.5,1", "--format", "jpg", "-q", "70",
        ]);
        assert_eq!(args.filters, vec![Filter::Brightness { amount: 20.0 }, Filter::Invert]);
        assert_eq!(args.blend, BlendMode::Screen);
        assert_eq!(args.format, Some(SaveFormat::Jpeg));
        assert_eq!(args.quality, Some(70));
        assert!(args.region.is_some());
    }

    #[test]
    fn rejects_bad_arguments() {
        let bad = [
            vec!["-i", "a.png", "-f", "sparkle=3"],
            vec!["-i", "a.png", "--blend", "shimmer"],
            vec!["-i", "a.png", "--region", "0,0,1"],
            vec!["-i", "a.png", "--region", "0,0,1.5,1"],
            vec!["-i", "a.png", "--radial", "0.5,0.5,0"],
            vec!["-i", "a.png", "--gradient", "0,0,1"],
            vec!["-i", "a.png", "--region", "0,0,1,1", "--radial", "0.5,0.5,0.5"],
            vec!["-i", "a.png", "-q", "0"],
            vec!["-f", "invert"],
        ];
        for argv in bad {
            let full = std::iter::once("knoux").chain(argv.iter().copied());
            assert!(CliArgs::try_parse_from(full).is_err(), "{argv:?}");
        }
    }

    #[test]
    fn parses_gradient_and_radial_masks() {
        let args = parse(&["-i", "a.png", "--gradient", "0,0.5,1,0.5"]);
        assert_eq!(args.gradient, Some(MaskShape::Gradient { start: [0.0, 0.5], end: [1.0, 0.5] }));
        let args = parse(&["-i", "a.png", "--radial", "0.5,0.4,0.25"]);
        assert_eq!(args.radial, Some(MaskShape::Radial { center: [0.5, 0.4], radius: 0.25 }));
    }

    /// The left edge gets the full invert, the right edge none of it.
    #[test]
    fn gradient_mask_fades_the_chain() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("flat.png");
        let output = dir.path().join("faded.png");
        write_png(&input, [0, 0, 0, 255]);

        let in_s = input.to_string_lossy().into_owned();
        let out_s = output.to_string_lossy().into_owned();
        let args = parse(&["-i", in_s.as_str(), "-f", "invert", "--gradient", "0,0,1,0", "-o", out_s.as_str()]);
        assert_eq!(run_batch(&args, &StudioContext::default()), ExitCode::SUCCESS);

        let out = image::open(&output).unwrap().to_rgba8();
        assert_eq!(out.get_pixel(0, 3)[0], 239);
        assert_eq!(out.get_pixel(7, 3)[0], 16);
    }

    #[test]
    fn format_from_flag_then_extension() {
        assert_eq!(parse_format(Some(SaveFormat::Bmp), Some(Path::new("x.png"))), SaveFormat::Bmp);
        assert_eq!(parse_format(None, Some(Path::new("x.TIF"))), SaveFormat::Tiff);
        assert_eq!(parse_format(None, Some(Path::new("x.kxs"))), SaveFormat::Png);
        assert_eq!(parse_format(None, None), SaveFormat::Png);
    }

    #[test]
    fn output_path_rules() {
        let input = Path::new("shots/a.png");
        assert_eq!(
            build_output_path(input, Some(Path::new("o.jpg")), None, SaveFormat::Jpeg),
            Some(PathBuf::from("o.jpg"))
        );
        assert_eq!(
            build_output_path(input, None, Some(Path::new("out")), SaveFormat::Jpeg),
            Some(PathBuf::from("out/a.jpg"))
        );
        assert_eq!(
            build_output_path(input, None, None, SaveFormat::Png),
            Some(PathBuf::from("shots/a_out.png"))
        );
    }

    #[test]
    fn single_output_rejected_for_many_inputs() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("one.png"), [10, 10, 10, 255]);
        write_png(&dir.path().join("two.png"), [200, 200, 200, 255]);
        let single = dir.path().join("x.png");
        let out = dir.path().join("out");

        let pattern = dir.path().join("*.png").to_string_lossy().into_owned();
        let single_s = single.to_string_lossy().into_owned();
        let out_s = out.to_string_lossy().into_owned();
        let args = parse(&["-i", pattern.as_str(), "-o", single_s.as_str(), "--output-dir", out_s.as_str()]);
        assert_eq!(run_batch(&args, &StudioContext::default()), ExitCode::FAILURE);
        assert!(!single.exists());
        assert!(!out.exists());
    }

    #[test]
    fn batch_applies_chain_to_every_glob_match() {
        let dir = tempdir().unwrap();
        write_png(&dir.path().join("one.png"), [100, 100, 100, 255]);
        write_png(&dir.path().join("two.png"), [0, 50, 200, 255]);
        let out = dir.path().join("out");

        let pattern = dir.path().join("*.png").to_string_lossy().into_owned();
        let out_s = out.to_string_lossy().into_owned();
        let args = parse(&["-i", pattern.as_str(), "-f", "invert", "--output-dir", out_s.as_str(), "--format", "bmp"]);
        assert_eq!(run_batch(&args, &StudioContext::default()), ExitCode::SUCCESS);

        let one = image::open(out.join("one.bmp")).unwrap().to_rgba8();
        assert_eq!(one.get_pixel(3, 3).0, [155, 155, 155, 255]);
        let two = image::open(out.join("two.bmp")).unwrap().to_rgba8();
        assert_eq!(two.get_pixel(3, 3).0, [255, 205, 55, 255]);
    }

    #[test]
    fn overlay_is_blended_and_resized() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base.png");
        write_png(&base, [200, 100, 50, 255]);
        let overlay = dir.path().join("over.png");
        RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255])).save(&overlay).unwrap();
        let out = dir.path().join("mix.png");

        let args = parse(&[
            "-i", base.to_str().unwrap(),
            "--overlay", overlay.to_str().unwrap(),
            "--opacity", "0.5",
            "-o", out.to_str().unwrap(),
        ]);
        assert_eq!(run_batch(&args, &StudioContext::default()), ExitCode::SUCCESS);
        let img = image::open(&out).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (8, 8));
        assert_eq!(img.get_pixel(4, 4).0, [100, 50, 25, 255]);
    }

    /// One bad file fails the run, but the rest are still written.
    #[test]
    fn failures_give_nonzero_exit() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.png");
        write_png(&good, [10, 10, 10, 255]);
        let bad = dir.path().join("bad.png");
        std::fs::write(&bad, b"not an image").unwrap();
        let out = dir.path().join("out");

        let args = parse(&[
            "-i", good.to_str().unwrap(), bad.to_str().unwrap(),
            "--output-dir", out.to_str().unwrap(),
        ]);
        assert_eq!(run_batch(&args, &StudioContext::default()), ExitCode::FAILURE);
        assert!(out.join("good.png").exists());

        let none = parse(&["-i", dir.path().join("*.nothing").to_str().unwrap()]);
        assert_eq!(run_batch(&none, &StudioContext::default()), ExitCode::FAILURE);
    }

    #[test]
    fn recipe_runs_before_command_line_filters() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.png");
        write_png(&input, [100, 100, 100, 255]);
        let recipe = dir.path().join("r.json");
        std::fs::write(&recipe, r#"["brightness=50"]"#).unwrap();
        let out = dir.path().join("out.png");

        let args = parse(&[
            "-i", input.to_str().unwrap(),
            "--recipe", recipe.to_str().unwrap(),
            "-f", "invert",
            "-o", out.to_str().unwrap(),
        ]);
        assert_eq!(run_batch(&args, &StudioContext::default()), ExitCode::SUCCESS);
        // (100 + 50) inverted
        assert_eq!(image::open(&out).unwrap().to_rgba8().get_pixel(0, 0).0, [105, 105, 105, 255]);
    }
}
