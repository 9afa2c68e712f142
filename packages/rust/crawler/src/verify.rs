//! Two-stage heuristic verification of downloaded assets.
//!
//! Stage 1 rejects files below a per-kind byte floor. Stage 2 (images only)
//! decodes the file and rejects thumbnails, icons, and banner strips by pixel
//! size and aspect ratio. Accepted images wider than the configured maximum
//! are downscaled in place, keeping their encoding.
//!
//! Everything here is blocking; the engine runs it on `spawn_blocking`.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use recordflow_shared::{AssetKind, RecordFlowError, Result};

pub const MIN_DOCUMENT_BYTES: u64 = 5 * 1024;
pub const MIN_IMAGE_BYTES: u64 = 10 * 1024;
pub const MIN_IMAGE_SIDE: u32 = 200;
pub const MIN_ASPECT_RATIO: f64 = 0.33;
pub const MAX_ASPECT_RATIO: f64 = 3.0;
pub const JPEG_QUALITY: u8 = 85;

/// Why an asset was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    TooSmall { bytes: u64, min: u64 },
    Undecodable(String),
    Dimensions { width: u32, height: u32 },
    AspectRatio(f64),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall { bytes, min } => write!(f, "too small ({bytes} bytes < {min})"),
            Self::Undecodable(e) => write!(f, "not a decodable image: {e}"),
            Self::Dimensions { width, height } => {
                write!(f, "dimensions {width}x{height} below {MIN_IMAGE_SIDE}px")
            }
            Self::AspectRatio(ratio) => write!(f, "aspect ratio {ratio:.2} out of bounds"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssetVerdict {
    /// Kept at this path, which differs from the input only when a
    /// downscaled image had to change format.
    Accepted(PathBuf),
    Rejected(Rejection),
}

impl AssetVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Verify the asset at `path`; accepted images wider than `max_width` are
/// rewritten at `max_width` with their aspect ratio preserved.
///
/// Errors are I/O failures reading or rewriting the file, not rejections.
pub fn verify_asset(path: &Path, kind: AssetKind, max_width: u32) -> Result<AssetVerdict> {
    let bytes = std::fs::metadata(path)
        .map_err(|e| RecordFlowError::io(path, e))?
        .len();

    let min = match kind {
        AssetKind::Document => MIN_DOCUMENT_BYTES,
        AssetKind::Image => MIN_IMAGE_BYTES,
        AssetKind::Text => return Ok(AssetVerdict::Accepted(path.to_path_buf())),
    };
    if bytes < min {
        return Ok(AssetVerdict::Rejected(Rejection::TooSmall { bytes, min }));
    }

    if kind == AssetKind::Image {
        return verify_image(path, max_width);
    }
    Ok(AssetVerdict::Accepted(path.to_path_buf()))
}

fn verify_image(path: &Path, max_width: u32) -> Result<AssetVerdict> {
    let reader = ImageReader::open(path)
        .map_err(|e| RecordFlowError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| RecordFlowError::io(path, e))?;
    let format = reader.format();

    let img = match reader.decode() {
        Ok(img) => img,
        Err(e) => return Ok(AssetVerdict::Rejected(Rejection::Undecodable(e.to_string()))),
    };

    let (width, height) = scaled_dimensions(img.width(), img.height(), max_width);
    if let Some(rejection) = check_dimensions(width, height) {
        return Ok(AssetVerdict::Rejected(rejection));
    }

    if width < img.width() {
        tracing::debug!(
            path = %path.display(),
            from = %format!("{}x{}", img.width(), img.height()),
            to = %format!("{width}x{height}"),
            "downscaling image"
        );
        let stored = save_image(&fit_width(img, max_width), path, format)?;
        return Ok(AssetVerdict::Accepted(stored));
    }

    Ok(AssetVerdict::Accepted(path.to_path_buf()))
}

/// Shrink `img` to `max_width` if it is wider, preserving the aspect ratio.
pub fn fit_width(img: DynamicImage, max_width: u32) -> DynamicImage {
    let (width, height) = scaled_dimensions(img.width(), img.height(), max_width);
    if width == img.width() {
        return img;
    }
    img.resize_exact(width, height, FilterType::Lanczos3)
}

/// Decode `bytes`, fit them to `max_width`, and store a JPEG at `path`.
///
/// Returns the stored dimensions. Used for images that arrive from an API
/// rather than a crawl, so no size gate applies.
pub fn store_jpeg(bytes: &[u8], path: &Path, max_width: u32) -> Result<(u32, u32)> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| RecordFlowError::parse(format!("not a decodable image: {e}")))?;
    let rgb = DynamicImage::ImageRgb8(fit_width(img, max_width).to_rgb8());

    let file = File::create(path).map_err(|e| RecordFlowError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY))
        .map_err(|e| RecordFlowError::Storage(format!("encode {}: {e}", path.display())))?;
    writer.flush().map_err(|e| RecordFlowError::io(path, e))?;
    Ok((rgb.width(), rgb.height()))
}

/// Dimensions after capping the width at `max_width`.
pub fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if max_width == 0 || width <= max_width {
        return (width, height);
    }
    let scaled = (f64::from(height) * f64::from(max_width) / f64::from(width)).round() as u32;
    (max_width, scaled.max(1))
}

/// Pixel-size and aspect-ratio gate.
pub fn check_dimensions(width: u32, height: u32) -> Option<Rejection> {
    if width < MIN_IMAGE_SIDE || height < MIN_IMAGE_SIDE {
        return Some(Rejection::Dimensions { width, height });
    }
    let ratio = f64::from(width) / f64::from(height);
    if !(MIN_ASPECT_RATIO..=MAX_ASPECT_RATIO).contains(&ratio) {
        return Some(Rejection::AspectRatio(ratio));
    }
    None
}

/// Rewrite `img` over `path` in its source format. Formats without an
/// encoder are stored as PNG under a `.png` name; the old file is removed.
fn save_image(img: &DynamicImage, path: &Path, format: Option<ImageFormat>) -> Result<PathBuf> {
    let (target, format) = match format {
        Some(
            format @ (ImageFormat::Jpeg
            | ImageFormat::Png
            | ImageFormat::Bmp
            | ImageFormat::Gif
            | ImageFormat::WebP),
        ) => (path.to_path_buf(), format),
        _ => (path.with_extension("png"), ImageFormat::Png),
    };

    let result = match format {
        // JPEG has no alpha channel
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()).save_with_format(&target, format),
        ImageFormat::WebP => DynamicImage::ImageRgba8(img.to_rgba8()).save_with_format(&target, format),
        _ => img.save_with_format(&target, format),
    };
    result.map_err(|e| RecordFlowError::Storage(format!("rewrite {}: {e}", target.display())))?;

    if target != path {
        std::fs::remove_file(path).map_err(|e| RecordFlowError::io(path, e))?;
    }
    Ok(target)
}
