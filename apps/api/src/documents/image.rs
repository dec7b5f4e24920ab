//! Validation and downscaling of image attachments.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::debug;

use super::{NormalizationError, NormalizerLimits, SourceFormat};

const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub format: SourceFormat,
    pub data: Bytes,
}

fn image_format(format: SourceFormat) -> Option<ImageFormat> {
    match format {
        SourceFormat::Png => Some(ImageFormat::Png),
        SourceFormat::Jpeg => Some(ImageFormat::Jpeg),
        SourceFormat::Gif => Some(ImageFormat::Gif),
        SourceFormat::Webp => Some(ImageFormat::WebP),
        _ => None,
    }
}

/// Decodes the image to prove it is what it claims to be. Images over the byte
/// threshold or the dimension limit are shrunk to fit and re-encoded as JPEG;
/// everything else passes through untouched.
pub fn prepare_image(
    bytes: &[u8],
    format: SourceFormat,
    limits: &NormalizerLimits,
) -> Result<PreparedImage, NormalizationError> {
    let failed = |reason: String| NormalizationError::ExtractionFailed {
        format: format.label().to_string(),
        reason,
    };

    let decoder_format =
        image_format(format).ok_or_else(|| failed("not an image format".to_string()))?;
    let decoded = image::load_from_memory_with_format(bytes, decoder_format)
        .map_err(|e| failed(format!("invalid image data: {e}")))?;

    let (width, height) = decoded.dimensions();
    let max_side = width.max(height);
    let oversized_bytes = bytes.len() > limits.image_downscale_bytes;
    let oversized_side = max_side > limits.image_max_dimension;

    if !oversized_bytes && !oversized_side {
        return Ok(PreparedImage {
            format,
            data: Bytes::copy_from_slice(bytes),
        });
    }

    let resized = if oversized_side {
        decoded.resize(
            limits.image_max_dimension,
            limits.image_max_dimension,
            FilterType::Triangle,
        )
    } else {
        decoded
    };

    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY))
        .map_err(|e| failed(format!("could not re-encode image: {e}")))?;
    let data = buffer.into_inner();

    debug!(
        "Downscaled image {width}x{height} ({} bytes) to {}x{} ({} bytes)",
        bytes.len(),
        rgb.width(),
        rgb.height(),
        data.len()
    );

    Ok(PreparedImage {
        format: SourceFormat::Jpeg,
        data: Bytes::from(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn limits(downscale_bytes: usize, max_dimension: u32) -> NormalizerLimits {
        NormalizerLimits {
            max_bytes: 10 * 1024 * 1024,
            max_chars: 1000,
            image_downscale_bytes: downscale_bytes,
            image_max_dimension: max_dimension,
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 30, 30, 255]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_small_image_passes_through() {
        let bytes = png(16, 16);
        let prepared = prepare_image(&bytes, SourceFormat::Png, &limits(1024 * 1024, 256)).unwrap();
        assert_eq!(prepared.format, SourceFormat::Png);
        assert_eq!(prepared.data.as_ref(), bytes.as_slice());
    }

    #[test]
    fn test_large_dimensions_are_downscaled_to_jpeg() {
        let bytes = png(400, 200);
        let prepared = prepare_image(&bytes, SourceFormat::Png, &limits(1024 * 1024, 100)).unwrap();
        assert_eq!(prepared.format, SourceFormat::Jpeg);

        let decoded = image::load_from_memory_with_format(&prepared.data, ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (100, 50));
    }

    #[test]
    fn test_byte_threshold_triggers_reencode() {
        let bytes = png(32, 32);
        let prepared = prepare_image(&bytes, SourceFormat::Png, &limits(1, 1568)).unwrap();
        assert_eq!(prepared.format, SourceFormat::Jpeg);
    }

    #[test]
    fn test_mislabelled_image_is_rejected() {
        let bytes = png(8, 8);
        let err = prepare_image(&bytes, SourceFormat::Jpeg, &limits(1024, 256)).unwrap_err();
        assert!(matches!(err, NormalizationError::ExtractionFailed { .. }));
    }
}
