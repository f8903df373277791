//! Ownership of memory allocated by libwebp.
//!
//! Every pointer libwebp hands back is wrapped in a [`NativeBuffer`] or a
//! [`MuxHandle`] before anything else happens, so it is released on every
//! exit path, early returns and panics included.

use std::cell::Cell;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr::NonNull;

use libwebp_sys::{WebPData, WebPMux, WebPMuxError};

thread_local! {
    static LIVE: Cell<isize> = const { Cell::new(0) };
}

/// Number of native buffers and mux objects currently alive on this thread.
///
/// Codec calls are synchronous, so a caller that brackets a call with two
/// reads sees whether the call leaked.
pub fn live_native_buffers() -> isize {
    LIVE.with(Cell::get)
}

/// A libwebp-owned byte buffer, released with `WebPFree` on drop.
pub(crate) struct NativeBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl NativeBuffer {
    /// Take ownership of `ptr`. Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been allocated by libwebp, and be valid
    /// for reads of `len` bytes until freed.
    pub(crate) unsafe fn from_raw(ptr: *mut u8, len: usize) -> Option<Self> {
        let ptr = NonNull::new(ptr)?;
        LIVE.with(|c| c.set(c.get() + 1));
        Some(Self { ptr, len })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: `from_raw` requires `ptr` to be valid for `len` bytes and
        // the buffer is only freed in `drop`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Copy into caller-owned memory.
    pub(crate) fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        // SAFETY: the pointer came from libwebp and is freed exactly once.
        unsafe { libwebp_sys::WebPFree(self.ptr.as_ptr().cast::<c_void>()) };
        LIVE.with(|c| c.set(c.get() - 1));
    }
}

fn empty_data() -> WebPData {
    WebPData {
        bytes: std::ptr::null(),
        size: 0,
    }
}

fn borrowed_data(bytes: &[u8]) -> WebPData {
    WebPData {
        bytes: bytes.as_ptr(),
        size: bytes.len(),
    }
}

fn fourcc_ptr(fourcc: &[u8; 4]) -> *const c_char {
    fourcc.as_ptr().cast::<c_char>()
}

/// A parsed WebP container, deleted with `WebPMuxDelete` on drop.
///
/// The mux always holds its own copies of the data handed to it.
pub(crate) struct MuxHandle {
    ptr: NonNull<WebPMux>,
}

impl MuxHandle {
    /// Parse a WebP file. Returns `None` if libwebp rejects it.
    pub(crate) fn parse(bytes: &[u8]) -> Option<Self> {
        let data = borrowed_data(bytes);
        // SAFETY: `data` describes `bytes` for the duration of the call and
        // `copy_data = 1` stops the mux from referencing it afterwards.
        let raw = unsafe {
            libwebp_sys::WebPMuxCreateInternal(
                &data,
                1,
                libwebp_sys::WEBP_MUX_ABI_VERSION as c_int,
            )
        };
        let ptr = NonNull::new(raw)?;
        LIVE.with(|c| c.set(c.get() + 1));
        Some(Self { ptr })
    }

    /// Payload of the chunk tagged `fourcc`, if present.
    pub(crate) fn chunk(&self, fourcc: &[u8; 4]) -> Option<Vec<u8>> {
        let mut data = empty_data();
        // SAFETY: the mux is live, `fourcc` is four readable bytes and
        // `data` is a valid out-pointer.
        let status =
            unsafe { libwebp_sys::WebPMuxGetChunk(self.ptr.as_ptr(), fourcc_ptr(fourcc), &mut data) };
        if status != WebPMuxError::WEBP_MUX_OK || data.bytes.is_null() {
            return None;
        }
        // SAFETY: on success `data` points into mux-owned memory that stays
        // valid until the mux is modified or deleted; it is copied here.
        Some(unsafe { std::slice::from_raw_parts(data.bytes, data.size) }.to_vec())
    }

    /// Add or replace the chunk tagged `fourcc`.
    pub(crate) fn set_chunk(&mut self, fourcc: &[u8; 4], payload: &[u8]) -> bool {
        let data = borrowed_data(payload);
        // SAFETY: the mux is live and `copy_data = 1` makes it copy
        // `payload` before returning.
        let status = unsafe {
            libwebp_sys::WebPMuxSetChunk(self.ptr.as_ptr(), fourcc_ptr(fourcc), &data, 1)
        };
        status == WebPMuxError::WEBP_MUX_OK
    }

    /// Serialise the container into a libwebp-owned buffer.
    pub(crate) fn assemble(&mut self) -> Option<NativeBuffer> {
        let mut out = empty_data();
        // SAFETY: the mux is live and `out` is a valid out-pointer.
        let status = unsafe { libwebp_sys::WebPMuxAssemble(self.ptr.as_ptr(), &mut out) };
        // SAFETY: `out` is either cleared or a libwebp allocation of
        // `out.size` bytes; wrapping it first frees it on every path.
        let buffer = unsafe { NativeBuffer::from_raw(out.bytes.cast_mut(), out.size) };
        if status != WebPMuxError::WEBP_MUX_OK {
            return None;
        }
        buffer
    }
}

impl Drop for MuxHandle {
    fn drop(&mut self) {
        // SAFETY: the mux came from `WebPMuxCreateInternal` and is deleted
        // exactly once.
        unsafe { libwebp_sys::WebPMuxDelete(self.ptr.as_ptr()) };
        LIVE.with(|c| c.set(c.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_not_wrapped() {
        let before = live_native_buffers();
        // SAFETY: null is always accepted.
        assert!(unsafe { NativeBuffer::from_raw(std::ptr::null_mut(), 0) }.is_none());
        assert_eq!(live_native_buffers(), before);
    }

    #[test]
    fn garbage_is_not_a_mux() {
        let before = live_native_buffers();
        assert!(MuxHandle::parse(b"RIFF\0\0\0\0WEBPnope").is_none());
        assert!(MuxHandle::parse(&[]).is_none());
        assert_eq!(live_native_buffers(), before);
    }
}
