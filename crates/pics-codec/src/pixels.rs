//! Pixel preparation applied before encoding: downscale and colour
//! normalisation.

use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer};

use pics_common::{Error, Result, Settings};

use crate::webp::RawImage;

/// Apply the request's resize and sRGB options.
pub fn prepare(img: DynamicImage, settings: &Settings) -> DynamicImage {
    let img = match settings
        .resize
        .target_dimensions(img.width(), img.height())
    {
        Some((w, h)) => {
            tracing::debug!(from_w = img.width(), from_h = img.height(), w, h, "resizing");
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
        None => img,
    };
    if settings.convert_to_srgb {
        to_srgb8(img)
    } else {
        img
    }
}

/// Collapse high-bit-depth and float buffers to 8-bit sRGB-encoded samples.
pub fn to_srgb8(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageLuma16(_) => DynamicImage::ImageLuma8(img.to_luma8()),
        DynamicImage::ImageLumaA16(_) => DynamicImage::ImageLumaA8(img.to_luma_alpha8()),
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgb32F(_) => {
            DynamicImage::ImageRgb8(img.to_rgb8())
        }
        DynamicImage::ImageRgba16(_) | DynamicImage::ImageRgba32F(_) => {
            DynamicImage::ImageRgba8(img.to_rgba8())
        }
        other => other,
    }
}

/// True when `prepare` would change the image.
pub fn needs_preparation(img: &DynamicImage, settings: &Settings) -> bool {
    let resize = settings
        .resize
        .target_dimensions(img.width(), img.height())
        .is_some();
    let deep = settings.convert_to_srgb
        && !matches!(
            img,
            DynamicImage::ImageLuma8(_)
                | DynamicImage::ImageLumaA8(_)
                | DynamicImage::ImageRgb8(_)
                | DynamicImage::ImageRgba8(_)
        );
    resize || deep
}

/// Wrap decoded RGBA from the embedded codec as a [`DynamicImage`].
pub fn from_raw(raw: RawImage) -> Result<DynamicImage> {
    let (w, h) = (raw.width, raw.height);
    ImageBuffer::from_raw(w, h, raw.pixels)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| Error::processing("decode", format!("short pixel buffer for {w}x{h}")))
}
