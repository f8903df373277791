//! # pics-codec
//!
//! In-process image codecs for the pics engine.
//!
//! - **Bridge** ([`CodecBridge`]) -- per-format availability
//!   ([`CodecAvailability`]) and decode/prepare/encode entry points.
//! - **Embedded libwebp** ([`webp`]) -- safe wrappers whose native buffers
//!   are released on every exit path.
//! - **System codecs** ([`system`]) -- JPEG, PNG and TIFF through `image`
//!   and `tiff`.
//! - **Metadata** ([`Metadata`]) -- ICC profile and EXIF carried to the
//!   output, with the EXIF orientation baked into the pixels.
//! - **Pixel preparation** ([`pixels`]) -- downscale and sRGB normalisation.

pub mod bridge;
mod metadata;
mod native;
pub mod pixels;
pub mod system;
pub mod webp;

pub use bridge::{CodecAvailability, CodecBridge};
pub use metadata::Metadata;
pub use native::live_native_buffers;
pub use webp::RawImage;
