//! Embedded libwebp encoder/decoder.
//!
//! Thin safe wrappers over the libwebp simple and mux APIs. Each call
//! copies the native result into a `Vec<u8>` and frees the native memory
//! before returning.

use std::os::raw::c_int;
use std::sync::OnceLock;

use pics_common::{Error, Result};

use crate::metadata::{strip_exif_prefix, Metadata};
use crate::native::{MuxHandle, NativeBuffer};

/// Largest width or height libwebp accepts.
pub const MAX_DIMENSION: u32 = 16383;

/// Decoded pixels in caller-owned memory. Always tightly packed RGBA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row (`width * 4`).
    pub stride: usize,
}

/// libwebp encoder version as `(major, minor, revision)`.
pub fn encoder_version() -> (u8, u8, u8) {
    // SAFETY: no arguments, returns a packed integer.
    let v = unsafe { libwebp_sys::WebPGetEncoderVersion() };
    (((v >> 16) & 0xff) as u8, ((v >> 8) & 0xff) as u8, (v & 0xff) as u8)
}

/// True if the linked library round-trips a tiny image. Computed once.
pub fn self_test() -> bool {
    static RESULT: OnceLock<bool> = OnceLock::new();
    *RESULT.get_or_init(|| {
        let pixels = [
            255, 0, 0, 255, 0, 255, 0, 255, //
            0, 0, 255, 255, 255, 255, 255, 255,
        ];
        let ok = encode_rgba(&pixels, 2, 2, 90.0)
            .and_then(|bytes| decode_rgba(&bytes))
            .map(|img| img.width == 2 && img.height == 2)
            .unwrap_or(false);
        if !ok {
            tracing::warn!("embedded libwebp failed its self-test");
        }
        ok
    })
}

fn checked_dims(pixels: &[u8], width: u32, height: u32) -> Result<(c_int, c_int, c_int)> {
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(Error::processing(
            "encode",
            format!("webp cannot encode {width}x{height}"),
        ));
    }
    let stride = width as usize * 4;
    if pixels.len() < stride * height as usize {
        return Err(Error::processing(
            "encode",
            format!(
                "pixel buffer holds {} bytes, {width}x{height} RGBA needs {}",
                pixels.len(),
                stride * height as usize
            ),
        ));
    }
    // Bounded by MAX_DIMENSION, so these fit in c_int.
    Ok((width as c_int, height as c_int, stride as c_int))
}

/// Lossy-encode tightly packed RGBA at `quality` (0-100).
pub fn encode_rgba(pixels: &[u8], width: u32, height: u32, quality: f32) -> Result<Vec<u8>> {
    let (w, h, stride) = checked_dims(pixels, width, height)?;
    let quality = quality.clamp(0.0, 100.0);
    let mut out: *mut u8 = std::ptr::null_mut();
    // SAFETY: `pixels` covers `stride * h` bytes (checked above) and `out`
    // is a valid out-pointer.
    let len = unsafe { libwebp_sys::WebPEncodeRGBA(pixels.as_ptr(), w, h, stride, quality, &mut out) };
    // SAFETY: `out` is null or a libwebp allocation of `len` bytes.
    let buffer = unsafe { NativeBuffer::from_raw(out, len) };
    match buffer {
        Some(buf) if buf.len() > 0 => Ok(buf.to_vec()),
        _ => Err(Error::processing("encode", "libwebp returned no data")),
    }
}

/// Lossless-encode tightly packed RGBA.
pub fn encode_lossless_rgba(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let (w, h, stride) = checked_dims(pixels, width, height)?;
    let mut out: *mut u8 = std::ptr::null_mut();
    // SAFETY: as in `encode_rgba`.
    let len =
        unsafe { libwebp_sys::WebPEncodeLosslessRGBA(pixels.as_ptr(), w, h, stride, &mut out) };
    // SAFETY: `out` is null or a libwebp allocation of `len` bytes.
    let buffer = unsafe { NativeBuffer::from_raw(out, len) };
    match buffer {
        Some(buf) if buf.len() > 0 => Ok(buf.to_vec()),
        _ => Err(Error::processing("encode", "libwebp returned no data")),
    }
}

/// Read the canvas size from a WebP header without decoding.
pub fn info(bytes: &[u8]) -> Option<(u32, u32)> {
    let (mut w, mut h): (c_int, c_int) = (0, 0);
    // SAFETY: `bytes` is a valid slice; `w`/`h` are valid out-pointers.
    let ok = unsafe { libwebp_sys::WebPGetInfo(bytes.as_ptr(), bytes.len(), &mut w, &mut h) };
    (ok != 0 && w > 0 && h > 0).then(|| (w as u32, h as u32))
}

/// Decode a still WebP image to RGBA.
pub fn decode_rgba(bytes: &[u8]) -> Result<RawImage> {
    let (width, height) = info(bytes)
        .ok_or_else(|| Error::processing("decode", "not a decodable webp bitstream"))?;
    let (mut w, mut h): (c_int, c_int) = (0, 0);
    // SAFETY: `bytes` is a valid slice; `w`/`h` are valid out-pointers.
    let ptr = unsafe { libwebp_sys::WebPDecodeRGBA(bytes.as_ptr(), bytes.len(), &mut w, &mut h) };
    let len = width as usize * height as usize * 4;
    // SAFETY: on success libwebp returns `w * h * 4` bytes; `info` already
    // told us the dimensions and they are re-checked below before use.
    let buffer = unsafe { NativeBuffer::from_raw(ptr, len) }
        .ok_or_else(|| Error::processing("decode", "libwebp failed to decode"))?;
    if w as u32 != width || h as u32 != height {
        return Err(Error::processing(
            "decode",
            format!("header said {width}x{height}, decoder produced {w}x{h}"),
        ));
    }
    Ok(RawImage {
        pixels: buffer.to_vec(),
        width,
        height,
        stride: width as usize * 4,
    })
}

/// ICC profile and EXIF chunks of a WebP container. Empty for a simple
/// (VP8/VP8L only) file or one libwebp cannot parse.
pub fn read_metadata(bytes: &[u8]) -> Metadata {
    match MuxHandle::parse(bytes) {
        Some(mux) => Metadata {
            icc_profile: mux.chunk(b"ICCP"),
            exif: mux.chunk(b"EXIF").map(strip_exif_prefix),
        },
        None => Metadata::default(),
    }
}

/// Re-wrap an encoded bitstream with `metadata`'s ICC and EXIF chunks.
pub fn attach_metadata(bitstream: &[u8], metadata: &Metadata) -> Result<Vec<u8>> {
    if metadata.is_empty() {
        return Ok(bitstream.to_vec());
    }
    let mut mux = MuxHandle::parse(bitstream)
        .ok_or_else(|| Error::processing("encode", "libwebp mux rejected the bitstream"))?;
    let chunks = [(b"ICCP", &metadata.icc_profile), (b"EXIF", &metadata.exif)];
    for (fourcc, payload) in chunks {
        if let Some(payload) = payload {
            if !mux.set_chunk(fourcc, payload) {
                return Err(Error::processing(
                    "encode",
                    format!("libwebp mux refused the {} chunk", String::from_utf8_lossy(fourcc)),
                ));
            }
        }
    }
    mux.assemble()
        .map(|buf| buf.to_vec())
        .ok_or_else(|| Error::processing("encode", "libwebp mux failed to assemble"))
}
