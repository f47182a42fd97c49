//! Command payload buffers.
//!
//! A [`Buffer`] is the data region a command transfers to or from the device.
//! Fields inside it are addressed the way NVMe data structures are documented:
//! by an inclusive byte range `[byte_hi:byte_lo]`, decoded little-endian.
//!
//! # Example
//!
//! ```
//! use nvme_io::Buffer;
//!
//! let mut buf = Buffer::allocate(512)?;
//! buf.as_mut_slice()[..4].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
//!
//! assert_eq!(buf.data(3, 0)?, 0x1234_5678);
//! assert_eq!(buf.data(1, 0)?, 0x5678);
//! # Ok::<(), nvme_io::Error>(())
//! ```
//!
//! # Lifetime
//!
//! A command borrows its buffer mutably for as long as its
//! [`CommandHandle`](crate::nvme::CommandHandle) lives, so a buffer cannot be
//! released or touched while the device may still be writing into it:
//!
//! ```compile_fail
//! use nvme_io::Buffer;
//! use nvme_io::nvme::{Controller, ControllerOpts};
//! use nvme_io::sim::SimDevice;
//!
//! let ctrlr = Controller::new(SimDevice::new(), ControllerOpts::default()).unwrap();
//! let mut buf = Buffer::new().unwrap();
//! let mut handle = ctrlr.identify(&mut buf).unwrap();
//! drop(buf); // error[E0505]: cannot move out of `buf` because it is borrowed
//! handle.waitdone().unwrap();
//! ```

use std::alloc::{self, Layout};
use std::fmt::Write;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Default buffer size, one identify data structure.
pub const DEFAULT_SIZE: usize = 4096;

/// Largest buffer that may be allocated.
pub const MAX_SIZE: usize = 64 * 1024 * 1024;

/// Buffer alignment. Page aligned, as DMA memory is.
pub const ALIGN: usize = 4096;

/// Widest field `data` / `set_data` can address.
const MAX_FIELD_BYTES: usize = 8;

/// Initial fill of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pattern {
    /// All bytes 0x00
    #[default]
    Zeroes,
    /// All bytes 0xff
    Ones,
    /// A dword repeated across the region, little-endian
    Dword(u32),
}

/// Fixed-size, zero-initialized payload region owned by the caller.
///
/// # Thread Safety
///
/// `Buffer` is `Send` but not `Sync`: it can be moved to another thread,
/// mutation goes through `&mut self`.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain bytes with a single owner
unsafe impl Send for Buffer {}

impl Buffer {
    /// Allocate a zeroed buffer of [`DEFAULT_SIZE`] bytes.
    pub fn new() -> Result<Self> {
        Self::allocate(DEFAULT_SIZE)
    }

    /// Allocate a zeroed buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if `size` is zero, larger than
    /// [`MAX_SIZE`], or the allocator fails.
    pub fn allocate(size: usize) -> Result<Self> {
        let fail = Error::Allocation {
            size,
            max: MAX_SIZE,
        };
        if size == 0 || size > MAX_SIZE {
            return Err(fail);
        }

        let layout = Layout::from_size_align(size, ALIGN).map_err(|_| Error::Allocation {
            size,
            max: MAX_SIZE,
        })?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(ptr)
            .map(|ptr| Self { ptr, len: size })
            .ok_or(fail)
    }

    /// Allocate a buffer filled with `pattern`.
    pub fn with_pattern(size: usize, pattern: Pattern) -> Result<Self> {
        let mut buf = Self::allocate(size)?;
        buf.fill(pattern);
        Ok(buf)
    }

    /// Overwrite the whole region with `pattern`.
    pub fn fill(&mut self, pattern: Pattern) {
        let slice = self.as_mut_slice();
        match pattern {
            Pattern::Zeroes => slice.fill(0),
            Pattern::Ones => slice.fill(0xff),
            Pattern::Dword(value) => {
                let bytes = value.to_le_bytes();
                for (i, b) in slice.iter_mut().enumerate() {
                    *b = bytes[i % 4];
                }
            }
        }
    }

    /// Get the buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false, zero-length buffers cannot be allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Decode the little-endian unsigned integer stored in bytes
    /// `byte_lo..=byte_hi`.
    ///
    /// # Errors
    ///
    /// [`Error::Range`] if `byte_lo > byte_hi`, `byte_hi >= len()`, or the
    /// span is wider than 8 bytes.
    pub fn data(&self, byte_hi: usize, byte_lo: usize) -> Result<u64> {
        self.check_field(byte_hi, byte_lo)?;
        let value = self.as_slice()[byte_lo..=byte_hi]
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64);
        Ok(value)
    }

    /// Store `value` little-endian into bytes `byte_lo..=byte_hi`.
    ///
    /// Bits of `value` that do not fit in the span are dropped.
    pub fn set_data(&mut self, byte_hi: usize, byte_lo: usize, value: u64) -> Result<()> {
        self.check_field(byte_hi, byte_lo)?;
        let bytes = value.to_le_bytes();
        let field = &mut self.as_mut_slice()[byte_lo..=byte_hi];
        field.copy_from_slice(&bytes[..field.len()]);
        Ok(())
    }

    fn check_field(&self, byte_hi: usize, byte_lo: usize) -> Result<()> {
        if byte_lo > byte_hi || byte_hi >= self.len || byte_hi - byte_lo >= MAX_FIELD_BYTES {
            return Err(Error::Range {
                hi: byte_hi,
                lo: byte_lo,
                len: self.len,
            });
        }
        Ok(())
    }

    /// Render the whole buffer as a hex + ASCII listing.
    pub fn dump(&self) -> String {
        self.dump_len(self.len)
    }

    /// Render the first `len` bytes (clamped to the buffer size).
    ///
    /// ```
    /// # use nvme_io::Buffer;
    /// let mut buf = Buffer::allocate(16)?;
    /// buf.as_mut_slice()[..2].copy_from_slice(b"OK");
    /// let text = buf.dump();
    /// assert!(text.starts_with("buffer, 16 bytes\n00000000  4f 4b 00"));
    /// assert!(text.trim_end().ends_with("|OK..............|"));
    /// # Ok::<(), nvme_io::Error>(())
    /// ```
    pub fn dump_len(&self, len: usize) -> String {
        let bytes = &self.as_slice()[..len.min(self.len)];
        let mut out = String::with_capacity(32 + bytes.len() * 4);
        let _ = writeln!(out, "buffer, {} bytes", bytes.len());

        for (row, chunk) in bytes.chunks(16).enumerate() {
            let _ = write!(out, "{:08x} ", row * 16);
            for i in 0..16 {
                if i == 8 {
                    out.push(' ');
                }
                match chunk.get(i) {
                    Some(b) => {
                        let _ = write!(out, " {:02x}", b);
                    }
                    None => out.push_str("   "),
                }
            }
            out.push_str("  |");
            for &b in chunk {
                out.push(if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                });
            }
            out.push_str("|\n");
        }
        out
    }

    fn layout(&self) -> Layout {
        // Validated in `allocate`
        unsafe { Layout::from_size_align_unchecked(self.len, ALIGN) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            alloc::dealloc(self.ptr.as_ptr(), self.layout());
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for Buffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}
