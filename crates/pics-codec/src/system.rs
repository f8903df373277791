//! In-process codecs provided by the `image` crate.
//!
//! These play the role of the platform codec: always linked, no external
//! process, but with fewer knobs than the specialised encoders.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageEncoder, ImageReader};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::{Compression, TiffEncoder};
use tiff::tags::{Predictor, Tag};

use pics_common::{Error, ImageFormat, Result, Settings};

pub use crate::metadata::Metadata;

/// Upright pixels plus the metadata read alongside them.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub image: DynamicImage,
    pub metadata: Metadata,
}

/// Whether the system codec can re-encode `format` honouring the request.
///
/// GIF is excluded because re-encoding through a single frame drops
/// animation; WebP because the built-in writer is lossless-only and would
/// ignore the requested quality.
pub fn can_encode(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Tiff)
}

fn image_format(format: ImageFormat) -> Option<image::ImageFormat> {
    match format {
        ImageFormat::Jpeg => Some(image::ImageFormat::Jpeg),
        ImageFormat::Png => Some(image::ImageFormat::Png),
        ImageFormat::Gif => Some(image::ImageFormat::Gif),
        ImageFormat::WebP => Some(image::ImageFormat::WebP),
        ImageFormat::Tiff => Some(image::ImageFormat::Tiff),
        ImageFormat::Heif | ImageFormat::Avif | ImageFormat::Unsupported => None,
    }
}

fn decode_error(e: image::ImageError) -> Error {
    Error::processing("decode", e.to_string())
}

/// Decode `bytes` known to be `format`, upright.
pub fn decode(format: ImageFormat, bytes: &[u8]) -> Result<DynamicImage> {
    decode_with_metadata(format, bytes).map(|d| d.image)
}

/// Decode `bytes` and keep the ICC profile and EXIF block.
///
/// The EXIF orientation is applied to the pixels, so the returned image is
/// always upright and the returned EXIF says so.
pub fn decode_with_metadata(format: ImageFormat, bytes: &[u8]) -> Result<Decoded> {
    let fmt = image_format(format)
        .ok_or_else(|| Error::processing("decode", format!("no system decoder for {format}")))?;
    let mut decoder = ImageReader::with_format(Cursor::new(bytes), fmt)
        .into_decoder()
        .map_err(decode_error)?;

    let icc_profile = decoder.icc_profile().unwrap_or_else(|e| {
        tracing::debug!(%format, "unreadable ICC profile: {e}");
        None
    });
    let exif = decoder.exif_metadata().unwrap_or_else(|e| {
        tracing::debug!(%format, "unreadable EXIF block: {e}");
        None
    });
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);

    let mut image = DynamicImage::from_decoder(decoder).map_err(decode_error)?;
    image.apply_orientation(orientation);

    let mut metadata = Metadata { icc_profile, exif };
    metadata.clear_orientation();
    Ok(Decoded { image, metadata })
}

/// Attach whatever metadata the encoder can carry.
fn attach<E: ImageEncoder>(encoder: &mut E, metadata: &Metadata, format: ImageFormat) {
    if let Some(icc) = &metadata.icc_profile {
        if encoder.set_icc_profile(icc.clone()).is_err() {
            tracing::debug!(%format, "encoder cannot embed an ICC profile");
        }
    }
    if let Some(exif) = &metadata.exif {
        if encoder.set_exif_metadata(exif.clone()).is_err() {
            tracing::debug!(%format, "encoder cannot embed EXIF");
        }
    }
}

/// Encode `img` as `format` using the preset's knobs, embedding `metadata`.
pub fn encode(
    format: ImageFormat,
    img: &DynamicImage,
    metadata: &Metadata,
    settings: &Settings,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let written = match format {
        ImageFormat::Jpeg => {
            let quality = settings.jpeg_quality_percent().clamp(1, 100);
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            attach(&mut encoder, metadata, format);
            DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)
        }
        ImageFormat::Png => {
            let mut encoder = PngEncoder::new_with_quality(
                &mut buf,
                CompressionType::Best,
                FilterType::Adaptive,
            );
            attach(&mut encoder, metadata, format);
            img.write_with_encoder(encoder)
        }
        ImageFormat::Tiff => {
            encode_tiff(&mut buf, img, metadata)?;
            Ok(())
        }
        other => {
            return Err(Error::processing(
                "encode",
                format!("no system encoder for {other}"),
            ))
        }
    };
    written.map_err(|e| Error::processing("encode", e.to_string()))?;
    Ok(buf)
}

/// LZW-compressed TIFF with horizontal differencing.
///
/// Float and 32-bit buffers are written as 16-bit samples since the
/// predictor only applies to integer data.
fn encode_tiff(buf: &mut Vec<u8>, img: &DynamicImage, metadata: &Metadata) -> Result<()> {
    let (w, h) = (img.width(), img.height());
    let icc = metadata.icc_profile.as_deref();
    match img {
        DynamicImage::ImageLuma8(g) => write_tiff::<colortype::Gray8>(buf, w, h, g.as_raw(), icc),
        DynamicImage::ImageLuma16(g) => {
            write_tiff::<colortype::Gray16>(buf, w, h, g.as_raw(), icc)
        }
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgb32F(_) => {
            write_tiff::<colortype::RGB16>(buf, w, h, img.to_rgb16().as_raw(), icc)
        }
        DynamicImage::ImageRgba16(_) | DynamicImage::ImageRgba32F(_) | DynamicImage::ImageLumaA16(_) => {
            write_tiff::<colortype::RGBA16>(buf, w, h, img.to_rgba16().as_raw(), icc)
        }
        other if other.color().has_alpha() => {
            write_tiff::<colortype::RGBA8>(buf, w, h, other.to_rgba8().as_raw(), icc)
        }
        other => write_tiff::<colortype::RGB8>(buf, w, h, other.to_rgb8().as_raw(), icc),
    }
}

fn write_tiff<C: ColorType>(
    buf: &mut Vec<u8>,
    width: u32,
    height: u32,
    samples: &[C::Inner],
    icc: Option<&[u8]>,
) -> Result<()>
where
    [C::Inner]: tiff::encoder::TiffValue,
{
    let tiff_error = |e: tiff::TiffError| Error::processing("encode", e.to_string());
    let mut encoder = TiffEncoder::new(Cursor::new(buf))
        .map_err(tiff_error)?
        .with_compression(Compression::Lzw)
        .with_predictor(Predictor::Horizontal);
    let mut frame = encoder.new_image::<C>(width, height).map_err(tiff_error)?;
    if let Some(icc) = icc {
        frame
            .encoder()
            .write_tag(Tag::IccProfile, icc)
            .map_err(tiff_error)?;
    }
    frame.write_data(samples).map_err(tiff_error)
}

/// Lossless PNG, used for intermediates handed to external tools.
pub fn encode_png_lossless(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut buf, CompressionType::Fast, FilterType::Adaptive);
    img.write_with_encoder(encoder)
        .map_err(|e| Error::processing("encode", e.to_string()))?;
    Ok(buf)
}
