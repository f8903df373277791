//! Container format detection by content sniffing.
//!
//! The extension of a file is never trusted: the leading bytes decide the
//! format, and anything unrecognised is [`ImageFormat::Unsupported`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Number of leading bytes needed to recognise every supported container.
pub const SNIFF_LEN: usize = 32;

/// Canonical image container types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Heif,
    Tiff,
    Avif,
    Unsupported,
}

impl ImageFormat {
    /// Detect the container from a file header.
    pub fn sniff(header: &[u8]) -> Self {
        if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return ImageFormat::Jpeg;
        }
        if header.starts_with(b"\x89PNG\r\n\x1a\n") {
            return ImageFormat::Png;
        }
        if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
            return ImageFormat::Gif;
        }
        if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
            return ImageFormat::WebP;
        }
        if header.starts_with(b"II*\0") || header.starts_with(b"MM\0*") {
            return ImageFormat::Tiff;
        }
        if header.len() >= 12 && &header[4..8] == b"ftyp" {
            return Self::from_brand(&header[8..12]);
        }
        ImageFormat::Unsupported
    }

    /// Read the head of `path` and sniff it.
    pub fn detect(path: &Path) -> std::io::Result<Self> {
        let mut header = Vec::with_capacity(SNIFF_LEN);
        std::fs::File::open(path)?
            .take(SNIFF_LEN as u64)
            .read_to_end(&mut header)?;
        Ok(Self::sniff(&header))
    }

    fn from_brand(brand: &[u8]) -> Self {
        match brand {
            b"avif" | b"avis" => ImageFormat::Avif,
            b"heic" | b"heix" | b"heim" | b"heis" | b"hevc" | b"hevx" | b"mif1" | b"msf1" => {
                ImageFormat::Heif
            }
            _ => ImageFormat::Unsupported,
        }
    }

    /// Short lowercase name used in logs and outcome records.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::WebP => "webp",
            ImageFormat::Heif => "heif",
            ImageFormat::Tiff => "tiff",
            ImageFormat::Avif => "avif",
            ImageFormat::Unsupported => "unsupported",
        }
    }

    /// Canonical file extension for output naming.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ImageFormat::Jpeg => Some("jpg"),
            ImageFormat::Png => Some("png"),
            ImageFormat::Gif => Some("gif"),
            ImageFormat::WebP => Some("webp"),
            ImageFormat::Heif => Some("heic"),
            ImageFormat::Tiff => Some("tiff"),
            ImageFormat::Avif => Some("avif"),
            ImageFormat::Unsupported => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
