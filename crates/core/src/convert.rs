//! Artifact conversion: raw rendered bytes to a delivery format.
//!
//! [`convert`] decodes whatever the rendering server produced (normally
//! PNG), normalizes the pixel layout for the target format and re-encodes
//! it. It never touches the filesystem; persistence is the caller's job.

use std::path::PathBuf;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbImage};

use crate::error::ConvertError;
use crate::request::{OutputFormat, MAX_QUALITY, MIN_QUALITY};

/// Opaque background transparent pixels are composited onto for JPEG.
pub const JPEG_BACKGROUND: [u8; 3] = [255, 255, 255];

/// An encoded image ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedImage {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
    pub size_bytes: usize,
    /// Whether the encoded image carries an alpha channel.
    pub has_alpha: bool,
    /// Requested quality. Recorded even for formats written losslessly.
    pub quality: u8,
    /// Where the image was persisted, if it was.
    pub saved_path: Option<PathBuf>,
}

impl ConvertedImage {
    /// Size in MiB rounded to two decimals.
    pub fn size_mb(&self) -> f64 {
        (self.size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
    }

    pub fn with_saved_path(self, path: PathBuf) -> Self {
        Self {
            saved_path: Some(path),
            ..self
        }
    }
}

/// Decode `raw` and re-encode it as `format`.
///
/// JPEG has no alpha channel, so sources with transparency are composited
/// onto [`JPEG_BACKGROUND`] first. PNG quality maps onto zlib effort and
/// WebP is written lossless; both still record `quality` in the result.
pub fn convert(raw: &[u8], format: OutputFormat, quality: u8) -> Result<ConvertedImage, ConvertError> {
    if raw.is_empty() {
        return Err(ConvertError::Empty);
    }

    let decoded = image::load_from_memory(raw).map_err(ConvertError::Decode)?;
    let (width, height) = (decoded.width(), decoded.height());
    let quality = quality.clamp(MIN_QUALITY, MAX_QUALITY);
    let mut bytes = Vec::new();

    let has_alpha = match format {
        OutputFormat::Jpeg => {
            let rgb = flatten_onto(&decoded, JPEG_BACKGROUND);
            JpegEncoder::new_with_quality(&mut bytes, quality)
                .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
                .map_err(|source| ConvertError::Encode {
                    format: format.label(),
                    source,
                })?;
            false
        }
        OutputFormat::Png => {
            let encoder =
                PngEncoder::new_with_quality(&mut bytes, png_compression(quality), FilterType::Adaptive);
            write_keeping_alpha(encoder, &decoded, format)?
        }
        OutputFormat::Webp => {
            let encoder = WebPEncoder::new_lossless(&mut bytes);
            write_keeping_alpha(encoder, &decoded, format)?
        }
    };

    let size_bytes = bytes.len();
    Ok(ConvertedImage {
        bytes,
        format,
        mime_type: format.mime_type(),
        width,
        height,
        size_bytes,
        has_alpha,
        quality,
        saved_path: None,
    })
}

// ---- private helpers ----

/// Higher quality means less time spent compressing.
fn png_compression(quality: u8) -> CompressionType {
    match quality {
        80..=100 => CompressionType::Fast,
        30..=79 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

/// Alpha-composite every pixel onto an opaque background colour.
fn flatten_onto(image: &DynamicImage, background: [u8; 3]) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let px = rgba.get_pixel(x, y).0;
        let alpha = u16::from(px[3]);
        let blend = |fg: u8, bg: u8| {
            ((u16::from(fg) * alpha + u16::from(bg) * (255 - alpha) + 127) / 255) as u8
        };
        image::Rgb([
            blend(px[0], background[0]),
            blend(px[1], background[1]),
            blend(px[2], background[2]),
        ])
    })
}

/// Encode as RGBA when the source has alpha, RGB otherwise.
fn write_keeping_alpha<E: ImageEncoder>(
    encoder: E,
    image: &DynamicImage,
    format: OutputFormat,
) -> Result<bool, ConvertError> {
    let (width, height) = (image.width(), image.height());
    let has_alpha = image.color().has_alpha();
    let result = if has_alpha {
        let rgba = image.to_rgba8();
        encoder.write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
    } else {
        let rgb = image.to_rgb8();
        encoder.write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
    };
    result.map_err(|source| ConvertError::Encode {
        format: format.label(),
        source,
    })?;
    Ok(has_alpha)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;
    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;

    /// 64x48 PNG: left half opaque red, right half fully transparent.
    fn rgba_png() -> Vec<u8> {
        let img = RgbaImage::from_fn(64, 48, |x, _| {
            if x < 32 {
                Rgba([200, 20, 20, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn rgba_to_jpeg_drops_alpha_by_compositing() {
        let out = convert(&rgba_png(), OutputFormat::Jpeg, 95).unwrap();
        assert_eq!(out.mime_type, "image/jpeg");
        assert!(!out.has_alpha);
        assert_eq!((out.width, out.height), (64, 48));
        assert_eq!(out.size_bytes, out.bytes.len());

        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert!(!decoded.color().has_alpha());
        let rgb = decoded.to_rgb8();
        // Transparent area becomes the white background, not black.
        let px = rgb.get_pixel(60, 24).0;
        assert!(px.iter().all(|c| *c > 235), "expected near-white, got {px:?}");
        let px = rgb.get_pixel(4, 24).0;
        assert!(px[0] > 150 && px[1] < 80, "expected red, got {px:?}");
    }

    #[test]
    fn jpeg_conversion_is_deterministic() {
        let raw = rgba_png();
        let a = convert(&raw, OutputFormat::Jpeg, 80).unwrap();
        let b = convert(&raw, OutputFormat::Jpeg, 80).unwrap();
        assert_eq!(a.size_bytes, b.size_bytes);
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn png_keeps_alpha() {
        let out = convert(&rgba_png(), OutputFormat::Png, 95).unwrap();
        assert!(out.has_alpha);
        assert_eq!(out.mime_type, "image/png");
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert!(decoded.color().has_alpha());
        assert_eq!(decoded.to_rgba8().get_pixel(60, 0).0[3], 0);
    }

    #[test]
    fn webp_is_lossless_and_records_quality() {
        let out = convert(&rgba_png(), OutputFormat::Webp, 40).unwrap();
        assert_eq!(out.mime_type, "image/webp");
        assert_eq!(out.quality, 40);
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(decoded.to_rgba8().get_pixel(4, 4).0, [200, 20, 20, 255]);
    }

    #[test]
    fn lower_jpeg_quality_produces_smaller_output() {
        let img = RgbaImage::from_fn(128, 128, |x, y| {
            Rgba([(x * 2) as u8, (y * 2) as u8, ((x ^ y) * 3) as u8, 255])
        });
        let mut raw = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut raw), ImageFormat::Png)
            .unwrap();

        let high = convert(&raw, OutputFormat::Jpeg, 95).unwrap();
        let low = convert(&raw, OutputFormat::Jpeg, 10).unwrap();
        assert!(low.size_bytes < high.size_bytes);
    }

    #[test]
    fn corrupt_data_is_a_decode_error() {
        assert_matches!(
            convert(b"definitely not an image", OutputFormat::Jpeg, 90),
            Err(ConvertError::Decode(_))
        );
    }

    #[test]
    fn empty_data_is_rejected() {
        assert_matches!(convert(&[], OutputFormat::Png, 90), Err(ConvertError::Empty));
    }

    #[test]
    fn saved_path_is_attached_without_touching_bytes() {
        let out = convert(&rgba_png(), OutputFormat::Png, 90).unwrap();
        let bytes = out.bytes.clone();
        let saved = out.with_saved_path(PathBuf::from("/tmp/a.png"));
        assert_eq!(saved.saved_path.as_deref(), Some(std::path::Path::new("/tmp/a.png")));
        assert_eq!(saved.bytes, bytes);
    }
}
