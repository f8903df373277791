//! Tiered access to in-process codecs.
//!
//! For each format the bridge answers which in-process path can re-encode
//! it: the system codec if it supports the format as a destination, else
//! the embedded libwebp if it is linked and passes its self-test, else
//! nothing.
//!
//! Both paths bake the EXIF orientation into the pixels. The ICC profile
//! and EXIF block are carried over only when the request preserves
//! metadata.

use image::DynamicImage;
use serde::Serialize;

use pics_common::{Error, ImageFormat, Result, Settings};

use crate::metadata::Metadata;
use crate::{pixels, system, webp};

fn kept(metadata: Metadata, settings: &Settings) -> Metadata {
    if settings.preserve_metadata {
        metadata
    } else {
        Metadata::default()
    }
}

/// Which in-process codec can handle a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CodecAvailability {
    SystemCodec,
    Embedded,
    Unavailable,
}

/// Entry point for in-process decode/encode.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecBridge {
    embedded_disabled: bool,
}

impl CodecBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bridge that reports the embedded library as absent.
    pub fn without_embedded() -> Self {
        Self {
            embedded_disabled: true,
        }
    }

    pub fn availability(&self, format: ImageFormat) -> CodecAvailability {
        if system::can_encode(format) {
            CodecAvailability::SystemCodec
        } else if format == ImageFormat::WebP && self.embedded_functional() {
            CodecAvailability::Embedded
        } else {
            CodecAvailability::Unavailable
        }
    }

    fn embedded_functional(&self) -> bool {
        !self.embedded_disabled && webp::self_test()
    }

    /// Decode, prepare and re-encode with the system codec.
    pub fn recompress_system(
        &self,
        format: ImageFormat,
        bytes: &[u8],
        settings: &Settings,
    ) -> Result<Vec<u8>> {
        let decoded = system::decode_with_metadata(format, bytes)?;
        let metadata = kept(decoded.metadata, settings);
        let img = pixels::prepare(decoded.image, settings);
        system::encode(format, &img, &metadata, settings)
    }

    /// Decode, prepare and re-encode WebP with the embedded library.
    pub fn recompress_embedded(
        &self,
        format: ImageFormat,
        bytes: &[u8],
        settings: &Settings,
    ) -> Result<Vec<u8>> {
        if format != ImageFormat::WebP || !self.embedded_functional() {
            return Err(Error::processing(
                "encode",
                format!("embedded codec cannot encode {format}"),
            ));
        }
        let (img, metadata) = self.decode_webp(bytes)?;
        let rgba = pixels::prepare(img, settings).to_rgba8();
        let encoded = webp::encode_rgba(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            f32::from(settings.webp_quality()),
        )?;
        webp::attach_metadata(&encoded, &kept(metadata, settings))
    }

    /// Upright WebP pixels plus the container's metadata.
    fn decode_webp(&self, bytes: &[u8]) -> Result<(DynamicImage, Metadata)> {
        let mut metadata = webp::read_metadata(bytes);
        let mut img = pixels::from_raw(webp::decode_rgba(bytes)?)?;
        img.apply_orientation(metadata.orientation());
        metadata.clear_orientation();
        Ok((img, metadata))
    }

    /// Decode any supported format for pixel preparation.
    pub fn decode(&self, format: ImageFormat, bytes: &[u8]) -> Result<DynamicImage> {
        if format == ImageFormat::WebP && self.embedded_functional() {
            return self.decode_webp(bytes).map(|(img, _)| img);
        }
        system::decode(format, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fixtures::{exif_with_orientation, fake_icc};
    use image::codecs::png::PngEncoder;
    use image::{ImageEncoder, Rgba, RgbaImage};
    use pics_common::{Preset, ResizeCondition, ResizeSpec};

    fn noisy_rgba(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            let v = (x.wrapping_mul(7919) ^ y.wrapping_mul(104729)) as u8;
            Rgba([v, v.wrapping_mul(3), v.wrapping_add(90), 255])
        })
    }

    #[test]
    fn availability_tiers() {
        let bridge = CodecBridge::new();
        assert_eq!(bridge.availability(ImageFormat::Jpeg), CodecAvailability::SystemCodec);
        assert_eq!(bridge.availability(ImageFormat::WebP), CodecAvailability::Embedded);
        assert_eq!(bridge.availability(ImageFormat::Gif), CodecAvailability::Unavailable);
        assert_eq!(bridge.availability(ImageFormat::Heif), CodecAvailability::Unavailable);

        let bare = CodecBridge::without_embedded();
        assert_eq!(bare.availability(ImageFormat::WebP), CodecAvailability::Unavailable);
        assert_eq!(bare.availability(ImageFormat::Png), CodecAvailability::SystemCodec);
    }

    #[test]
    fn embedded_recompress_honours_resize() {
        let img = noisy_rgba(64, 32);
        let original = webp::encode_rgba(img.as_raw(), 64, 32, 100.0).unwrap();
        let settings = Settings {
            preset: Preset::Saving,
            resize: ResizeSpec {
                enabled: true,
                target_pixels: 32,
                condition: ResizeCondition::Width,
            },
            ..Settings::default()
        };
        let out = CodecBridge::new()
            .recompress_embedded(ImageFormat::WebP, &original, &settings)
            .unwrap();
        assert_eq!(webp::info(&out), Some((32, 16)));
    }

    #[test]
    fn embedded_refuses_other_formats() {
        let err = CodecBridge::new()
            .recompress_embedded(ImageFormat::Png, b"\x89PNG", &Settings::default())
            .unwrap_err();
        assert!(matches!(err, Error::Processing { .. }));
    }

    #[test]
    fn system_recompress_png() {
        let img = DynamicImage::ImageRgba8(noisy_rgba(16, 16));
        let bytes = system::encode_png_lossless(&img).unwrap();
        let out = CodecBridge::new()
            .recompress_system(ImageFormat::Png, &bytes, &Settings::default())
            .unwrap();
        assert_eq!(ImageFormat::sniff(&out), ImageFormat::Png);
    }

    #[test]
    fn decode_webp_through_bridge() {
        let img = noisy_rgba(10, 6);
        let bytes = webp::encode_lossless_rgba(img.as_raw(), 10, 6).unwrap();
        let decoded = CodecBridge::new().decode(ImageFormat::WebP, &bytes).unwrap();
        assert_eq!(decoded.to_rgba8(), img);
    }

    fn png_with_icc(img: &RgbaImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut encoder = PngEncoder::new(&mut bytes);
        encoder.set_icc_profile(fake_icc()).unwrap();
        DynamicImage::ImageRgba8(img.clone())
            .write_with_encoder(encoder)
            .unwrap();
        bytes
    }

    #[test]
    fn system_recompress_keeps_icc_when_preserving() {
        let source = png_with_icc(&noisy_rgba(24, 24));
        let out = CodecBridge::new()
            .recompress_system(ImageFormat::Png, &source, &Settings::default())
            .unwrap();
        let decoded = system::decode_with_metadata(ImageFormat::Png, &out).unwrap();
        assert_eq!(decoded.metadata.icc_profile, Some(fake_icc()));
    }

    #[test]
    fn system_recompress_strips_when_not_preserving() {
        let source = png_with_icc(&noisy_rgba(24, 24));
        let settings = Settings {
            preserve_metadata: false,
            ..Settings::default()
        };
        let out = CodecBridge::new()
            .recompress_system(ImageFormat::Png, &source, &settings)
            .unwrap();
        let decoded = system::decode_with_metadata(ImageFormat::Png, &out).unwrap();
        assert!(decoded.metadata.is_empty());
    }

    fn tagged_webp(w: u32, h: u32, metadata: &Metadata) -> Vec<u8> {
        let img = noisy_rgba(w, h);
        let plain = webp::encode_rgba(img.as_raw(), w, h, 100.0).unwrap();
        webp::attach_metadata(&plain, metadata).unwrap()
    }

    #[test]
    fn embedded_recompress_honours_preserve_flag() {
        let metadata = Metadata {
            icc_profile: Some(fake_icc()),
            exif: Some(exif_with_orientation(1)),
        };
        let source = tagged_webp(32, 32, &metadata);
        let bridge = CodecBridge::new();

        let preserved = bridge
            .recompress_embedded(ImageFormat::WebP, &source, &Settings::default())
            .unwrap();
        assert_eq!(webp::read_metadata(&preserved), metadata);

        let strip = Settings {
            preserve_metadata: false,
            ..Settings::default()
        };
        let stripped = bridge
            .recompress_embedded(ImageFormat::WebP, &source, &strip)
            .unwrap();
        assert!(webp::read_metadata(&stripped).is_empty());
    }

    #[test]
    fn embedded_recompress_applies_orientation() {
        let metadata = Metadata {
            icc_profile: None,
            exif: Some(exif_with_orientation(6)),
        };
        let source = tagged_webp(8, 4, &metadata);
        let out = CodecBridge::new()
            .recompress_embedded(ImageFormat::WebP, &source, &Settings::default())
            .unwrap();
        assert_eq!(webp::info(&out), Some((4, 8)));
        assert_eq!(
            webp::read_metadata(&out).orientation(),
            image::metadata::Orientation::NoTransforms
        );
    }
}
