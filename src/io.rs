use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::str::FromStr;

use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tga::TgaEncoder;
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::canvas::{BlendMode, CanvasState, Layer, MAX_CANVAS_DIM, MAX_LAYERS};
use crate::error::{Result, StudioError};

/// Extension of the layered project format.
pub const PROJECT_EXTENSION: &str = "kxs";

// ============================================================================
// SAVE FORMATS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SaveFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
    Bmp,
    Tga,
    Ico,
    Tiff,
}

/// Compression options for TIFF format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TiffCompression {
    #[default]
    None,
    Lzw,
    Deflate,
}

impl SaveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Png => "png",
            SaveFormat::Jpeg => "jpg",
            SaveFormat::Webp => "webp",
            SaveFormat::Bmp => "bmp",
            SaveFormat::Tga => "tga",
            SaveFormat::Ico => "ico",
            SaveFormat::Tiff => "tiff",
        }
    }

    pub fn supports_quality(&self) -> bool {
        matches!(self, SaveFormat::Jpeg)
    }

    pub fn all() -> &'static [SaveFormat] {
        &[
            SaveFormat::Png,
            SaveFormat::Jpeg,
            SaveFormat::Webp,
            SaveFormat::Bmp,
            SaveFormat::Tga,
            SaveFormat::Ico,
            SaveFormat::Tiff,
        ]
    }

    /// Guess the format from a file extension, if it is one we can write.
    pub fn from_path(path: &Path) -> Option<SaveFormat> {
        let ext = path.extension()?.to_str()?;
        ext.parse().ok()
    }
}

impl FromStr for SaveFormat {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(SaveFormat::Png),
            "jpg" | "jpeg" => Ok(SaveFormat::Jpeg),
            "webp" => Ok(SaveFormat::Webp),
            "bmp" => Ok(SaveFormat::Bmp),
            "tga" => Ok(SaveFormat::Tga),
            "ico" => Ok(SaveFormat::Ico),
            "tif" | "tiff" => Ok(SaveFormat::Tiff),
            other => Err(StudioError::invalid("format", format!("unsupported output format '{other}'"))),
        }
    }
}

impl fmt::Display for SaveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TiffCompression {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(TiffCompression::None),
            "lzw" => Ok(TiffCompression::Lzw),
            "deflate" | "zip" => Ok(TiffCompression::Deflate),
            other => Err(StudioError::invalid("tiff-compression", format!("unknown mode '{other}'"))),
        }
    }
}

/// Encoder settings for one save.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SaveOptions {
    pub format: SaveFormat,
    /// JPEG quality, 1..=100. Ignored by other formats.
    pub quality: u8,
    pub tiff_compression: TiffCompression,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            format: SaveFormat::Png,
            quality: 90,
            tiff_compression: TiffCompression::None,
        }
    }
}

impl SaveOptions {
    /// Defaults with the format picked from `path`'s extension (PNG otherwise).
    pub fn for_path(path: &Path) -> Self {
        Self {
            format: SaveFormat::from_path(path).unwrap_or_default(),
            ..Self::default()
        }
    }
}

// ============================================================================
// IMAGE LOAD / SAVE
// ============================================================================

fn is_project_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PROJECT_EXTENSION))
}

fn check_canvas_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(StudioError::Project("canvas dimensions cannot be zero".into()));
    }
    if width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
        return Err(StudioError::LimitExceeded {
            what: "canvas size",
            detail: format!("{width}x{height} is larger than {MAX_CANVAS_DIM}x{MAX_CANVAS_DIM}"),
        });
    }
    Ok(())
}

/// Load any supported file into a [`CanvasState`].
///
/// `.kxs` projects keep their layers; every other format the `image` crate
/// decodes becomes a single layer named after the file stem.
pub fn load_image(path: &Path) -> Result<CanvasState> {
    if is_project_path(path) {
        return load_project(path);
    }

    let img = image::open(path)?.to_rgba8();
    let (w, h) = img.dimensions();
    if w > MAX_CANVAS_DIM || h > MAX_CANVAS_DIM {
        return Err(StudioError::LimitExceeded {
            what: "image size",
            detail: format!("{w}x{h} is larger than {MAX_CANVAS_DIM}x{MAX_CANVAS_DIM}"),
        });
    }

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Background")
        .to_string();
    tracing::debug!(path = %path.display(), width = w, height = h, "image loaded");

    let mut state = CanvasState::new(w, h);
    state.add_layer(Layer::from_image(name, img))?;
    Ok(state)
}

/// Encode and write an image to a file.
/// Standalone so it can run on worker threads.
pub fn encode_and_write(image: &RgbaImage, path: &Path, options: &SaveOptions) -> Result<()> {
    if options.format == SaveFormat::Jpeg && !(1..=100).contains(&options.quality) {
        return Err(StudioError::invalid(
            "quality",
            format!("{} is outside 1..=100", options.quality),
        ));
    }

    // The WebP path goes through `DynamicImage`, which opens the file itself.
    if options.format == SaveFormat::Webp {
        DynamicImage::ImageRgba8(image.clone()).save_with_format(path, ImageFormat::WebP)?;
        return Ok(());
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    match options.format {
        SaveFormat::Png => {
            let encoder = PngEncoder::new(&mut writer);
            #[allow(deprecated)]
            encoder.encode(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ColorType::Rgba8,
            )?;
        }
        SaveFormat::Jpeg => {
            let rgb_image = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, options.quality);
            encoder.encode(
                rgb_image.as_raw(),
                rgb_image.width(),
                rgb_image.height(),
                image::ColorType::Rgb8,
            )?;
        }
        SaveFormat::Bmp => {
            let mut encoder = BmpEncoder::new(&mut writer);
            encoder.encode(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ColorType::Rgba8,
            )?;
        }
        SaveFormat::Tga => {
            let encoder = TgaEncoder::new(&mut writer);
            encoder.encode(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ColorType::Rgba8,
            )?;
        }
        SaveFormat::Ico => {
            // ICO entries limited to 256×256; scale down if needed
            let dyn_img = if image.width() > 256 || image.height() > 256 {
                let scale = 256.0 / image.width().max(image.height()) as f32;
                let new_w = ((image.width() as f32 * scale) as u32).max(1);
                let new_h = ((image.height() as f32 * scale) as u32).max(1);
                let resized = image::imageops::resize(
                    image,
                    new_w,
                    new_h,
                    image::imageops::FilterType::Lanczos3,
                );
                DynamicImage::ImageRgba8(resized)
            } else {
                DynamicImage::ImageRgba8(image.clone())
            };
            dyn_img.write_to(&mut writer, image::ImageOutputFormat::Ico)?;
        }
        SaveFormat::Tiff => write_tiff(image, &mut writer, options.tiff_compression)?,
        SaveFormat::Webp => unreachable!("handled above"),
    }

    tracing::debug!(path = %path.display(), format = %options.format, "image written");
    Ok(())
}

fn write_tiff<W: std::io::Write + std::io::Seek>(
    image: &RgbaImage,
    writer: &mut W,
    compression: TiffCompression,
) -> Result<()> {
    use tiff::encoder::{TiffEncoder, colortype::RGBA8, compression as tc};

    let mut enc = TiffEncoder::new(writer)?;
    let (w, h) = image.dimensions();
    match compression {
        TiffCompression::None => enc.write_image::<RGBA8>(w, h, image.as_raw())?,
        TiffCompression::Lzw => enc.write_image_with_compression::<RGBA8, _>(w, h, tc::Lzw, image.as_raw())?,
        TiffCompression::Deflate => {
            enc.write_image_with_compression::<RGBA8, _>(w, h, tc::Deflate::default(), image.as_raw())?
        }
    }
    Ok(())
}

/// Save a canvas: `.kxs` paths keep the layer stack, anything else writes
/// the flattened composite with `options`.
pub fn save_canvas(state: &CanvasState, path: &Path, options: &SaveOptions) -> Result<()> {
    if is_project_path(path) {
        return save_project(state, path);
    }
    encode_and_write(&state.composite(), path, options)
}

// ============================================================================
// KXS PROJECT FILE FORMAT
// ============================================================================

const KXS_MAGIC: &str = "KXS1";

#[derive(Serialize, Deserialize)]
struct ProjectFile {
    magic: String,
    width: u32,
    height: u32,
    active_layer_index: usize,
    layers: Vec<LayerData>,
}

/// One layer, pixels stored as flat row-major RGBA.
#[derive(Serialize, Deserialize)]
struct LayerData {
    name: String,
    visible: bool,
    opacity: f32,
    blend_mode: u8,
    pixels: Vec<u8>,
}

impl ProjectFile {
    fn from_canvas(state: &CanvasState) -> Self {
        Self {
            magic: KXS_MAGIC.to_string(),
            width: state.width,
            height: state.height,
            active_layer_index: state.active_layer_index,
            layers: state
                .layers
                .iter()
                .map(|l| LayerData {
                    name: l.name.clone(),
                    visible: l.visible,
                    opacity: l.opacity,
                    blend_mode: l.blend_mode.to_u8(),
                    pixels: l.pixels.as_raw().clone(),
                })
                .collect(),
        }
    }

    fn into_canvas(self) -> Result<CanvasState> {
        check_canvas_size(self.width, self.height)?;
        if self.layers.len() > MAX_LAYERS {
            return Err(StudioError::LimitExceeded {
                what: "layer count",
                detail: format!("{} layers, maximum is {MAX_LAYERS}", self.layers.len()),
            });
        }
        if self.layers.is_empty() {
            return Err(StudioError::Project("project contains no layers".into()));
        }

        let expected_bytes = self.width as usize * self.height as usize * 4;
        let mut state = CanvasState::new(self.width, self.height);
        for ld in self.layers {
            if ld.pixels.len() != expected_bytes {
                return Err(StudioError::Project(format!(
                    "layer '{}' has {} bytes of pixels, expected {expected_bytes}",
                    ld.name,
                    ld.pixels.len()
                )));
            }
            let pixels = RgbaImage::from_raw(self.width, self.height, ld.pixels)
                .ok_or_else(|| StudioError::Project(format!("failed to rebuild layer '{}'", ld.name)))?;
            let blend = BlendMode::from_u8(ld.blend_mode).map_err(|_| {
                StudioError::Project(format!("layer '{}' has unknown blend mode byte {}", ld.name, ld.blend_mode))
            })?;
            let mut layer = Layer::from_image(ld.name, pixels).with_blend(blend, ld.opacity);
            layer.visible = ld.visible;
            state.layers.push(layer);
        }
        state.active_layer_index = self.active_layer_index.min(state.layers.len() - 1);
        Ok(state)
    }
}

/// Save a canvas as a `.kxs` project file.
pub fn save_project(state: &CanvasState, path: &Path) -> Result<()> {
    if state.layers.len() > MAX_LAYERS {
        return Err(StudioError::LimitExceeded {
            what: "layer count",
            detail: format!("{} layers, maximum is {MAX_LAYERS}", state.layers.len()),
        });
    }
    let project = ProjectFile::from_canvas(state);
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, &project)?;
    tracing::info!(path = %path.display(), layers = state.layers.len(), "project saved");
    Ok(())
}

/// Load a `.kxs` project file.
pub fn load_project(path: &Path) -> Result<CanvasState> {
    let raw = std::fs::read(path)?;
    decode_project(&raw)
}

fn decode_project(raw: &[u8]) -> Result<CanvasState> {
    if raw.len() < 12 {
        return Err(StudioError::Project("file too small".into()));
    }

    // bincode writes a String as an 8-byte length followed by its bytes,
    // so a 4-char magic sits at 8..12.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != KXS_MAGIC {
        return Err(StudioError::Project(format!("unknown magic '{}'", magic.escape_debug())));
    }

    let project: ProjectFile = bincode::deserialize(raw)
        .map_err(|e| StudioError::Project(format!("corrupt or truncated data: {e}")))?;
    project.into_canvas()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use tempfile::tempdir;

    fn gradient(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 7) as u8, (y * 5) as u8, 128, 255]))
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("JPEG".parse::<SaveFormat>().unwrap(), SaveFormat::Jpeg);
        assert_eq!("tif".parse::<SaveFormat>().unwrap(), SaveFormat::Tiff);
        assert!("gif".parse::<SaveFormat>().is_err());
        assert_eq!(SaveFormat::from_path(Path::new("a/b.WEBP")), Some(SaveFormat::Webp));
        assert_eq!(SaveFormat::from_path(Path::new("noext")), None);
        assert_eq!("lzw".parse::<TiffCompression>().unwrap(), TiffCompression::Lzw);
        assert!("rle".parse::<TiffCompression>().is_err());
        for f in SaveFormat::all() {
            assert_eq!(f.extension().parse::<SaveFormat>().unwrap(), *f);
        }
    }

    #[test]
    fn png_round_trip_is_lossless() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grad.png");
        let img = gradient(20, 12);
        encode_and_write(&img, &path, &SaveOptions::default()).unwrap();

        let loaded = load_image(&path).unwrap();
        assert_eq!((loaded.width, loaded.height), (20, 12));
        assert_eq!(loaded.layers.len(), 1);
        assert_eq!(loaded.layers[0].name, "grad");
        assert_eq!(loaded.layers[0].pixels, img);
    }

    #[test]
    fn tiff_compression_modes_decode() {
        let dir = tempdir().unwrap();
        let img = gradient(16, 16);
        for mode in [TiffCompression::None, TiffCompression::Lzw, TiffCompression::Deflate] {
            let path = dir.path().join(format!("t-{mode:?}.tiff"));
            let opts = SaveOptions {
                format: SaveFormat::Tiff,
                tiff_compression: mode,
                ..SaveOptions::default()
            };
            encode_and_write(&img, &path, &opts).unwrap();
            assert_eq!(image::open(&path).unwrap().to_rgba8(), img, "{mode:?}");
        }
    }

    #[test]
    fn jpeg_quality_is_checked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.jpg");
        let mut opts = SaveOptions::for_path(&path);
        assert_eq!(opts.format, SaveFormat::Jpeg);

        opts.quality = 0;
        assert!(matches!(
            encode_and_write(&gradient(8, 8), &path, &opts),
            Err(StudioError::InvalidParam { .. })
        ));
        opts.quality = 80;
        encode_and_write(&gradient(8, 8), &path, &opts).unwrap();
        assert_eq!(image::open(&path).unwrap().width(), 8);
    }

    /// ICO entries cannot exceed 256 px, so larger images are scaled down.
    #[test]
    fn ico_is_downscaled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.ico");
        let opts = SaveOptions::for_path(&path);
        encode_and_write(&RgbaImage::new(512, 128), &path, &opts).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (256, 64));
    }

    #[test]
    fn project_round_trip_keeps_layers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.kxs");

        let mut state = CanvasState::from_image(gradient(10, 6));
        let mut top = Layer::new("Top", 10, 6, Rgba([255, 0, 0, 128])).with_blend(BlendMode::Multiply, 0.5);
        top.visible = false;
        state.add_layer(top).unwrap();
        state.active_layer_index = 0;

        save_canvas(&state, &path, &SaveOptions::default()).unwrap();
        let loaded = load_image(&path).unwrap();

        assert_eq!((loaded.width, loaded.height), (10, 6));
        assert_eq!(loaded.active_layer_index, 0);
        assert_eq!(loaded.layers.len(), 2);
        assert_eq!(loaded.layers[0].pixels, state.layers[0].pixels);
        let t = &loaded.layers[1];
        assert_eq!(t.name, "Top");
        assert!(!t.visible);
        assert_eq!(t.blend_mode, BlendMode::Multiply);
        assert_eq!(t.opacity, 0.5);
    }

    #[test]
    fn bad_magic_and_truncation_are_rejected() {
        assert!(matches!(decode_project(b"short"), Err(StudioError::Project(_))));

        let mut bogus = vec![4, 0, 0, 0, 0, 0, 0, 0];
        bogus.extend_from_slice(b"PNG!");
        bogus.extend_from_slice(&[0; 32]);
        assert!(matches!(decode_project(&bogus), Err(StudioError::Project(m)) if m.contains("magic")));

        let state = CanvasState::from_image(gradient(8, 8));
        let full = bincode::serialize(&ProjectFile::from_canvas(&state)).unwrap();
        let cut = &full[..full.len() - 10];
        assert!(matches!(decode_project(cut), Err(StudioError::Project(m)) if m.contains("truncated")));
        assert!(decode_project(&full).is_ok());
    }

    #[test]
    fn limits_are_enforced_on_load() {
        let layer = |n: usize| LayerData {
            name: format!("L{n}"),
            visible: true,
            opacity: 1.0,
            blend_mode: 0,
            pixels: vec![0; 4],
        };

        let too_many = ProjectFile {
            magic: KXS_MAGIC.into(),
            width: 1,
            height: 1,
            active_layer_index: 0,
            layers: (0..MAX_LAYERS + 1).map(layer).collect(),
        };
        let raw = bincode::serialize(&too_many).unwrap();
        assert!(matches!(decode_project(&raw), Err(StudioError::LimitExceeded { what: "layer count", .. })));

        let too_wide = ProjectFile {
            magic: KXS_MAGIC.into(),
            width: MAX_CANVAS_DIM + 1,
            height: 1,
            active_layer_index: 0,
            layers: vec![layer(0)],
        };
        let raw = bincode::serialize(&too_wide).unwrap();
        assert!(matches!(decode_project(&raw), Err(StudioError::LimitExceeded { .. })));

        let short_pixels = ProjectFile {
            magic: KXS_MAGIC.into(),
            width: 2,
            height: 2,
            active_layer_index: 9,
            layers: vec![layer(0)],
        };
        let raw = bincode::serialize(&short_pixels).unwrap();
        assert!(matches!(decode_project(&raw), Err(StudioError::Project(m)) if m.contains("bytes")));
    }

    #[test]
    fn unknown_blend_byte_is_a_project_error() {
        let mut project = ProjectFile::from_canvas(&CanvasState::from_image(gradient(2, 2)));
        project.layers[0].blend_mode = 200;
        let raw = bincode::serialize(&project).unwrap();
        assert!(matches!(decode_project(&raw), Err(StudioError::Project(m)) if m.contains("blend mode byte 200")));
    }

    #[test]
    fn active_index_is_clamped() {
        let mut project = ProjectFile::from_canvas(&CanvasState::from_image(gradient(2, 2)));
        project.active_layer_index = 40;
        let state = project.into_canvas().unwrap();
        assert_eq!(state.active_layer_index, 0);
    }
}
