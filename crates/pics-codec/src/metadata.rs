//! Colour profile and EXIF carried from a source image to its output.

use image::metadata::Orientation;

/// ICC profile and EXIF block read alongside the pixels.
///
/// The EXIF block is raw TIFF-structured data without the `Exif\0\0`
/// prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub icc_profile: Option<Vec<u8>>,
    pub exif: Option<Vec<u8>>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.icc_profile.is_none() && self.exif.is_none()
    }

    /// Rotation/flip recorded in the EXIF block.
    pub fn orientation(&self) -> Orientation {
        self.exif
            .as_deref()
            .and_then(Orientation::from_exif_chunk)
            .unwrap_or(Orientation::NoTransforms)
    }

    /// Mark the EXIF orientation as already applied to the pixels.
    pub fn clear_orientation(&mut self) {
        if let Some(exif) = self.exif.as_mut() {
            let _ = Orientation::remove_from_exif_chunk(exif);
        }
    }
}

/// Drop the APP1-style `Exif\0\0` marker some writers leave in place.
pub(crate) fn strip_exif_prefix(mut exif: Vec<u8>) -> Vec<u8> {
    if exif.starts_with(b"Exif\0\0") {
        exif.drain(..6);
    }
    exif
}
