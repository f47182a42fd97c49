//! Device transport boundary.
//!
//! The controller never talks to hardware directly. It hands commands and
//! payload regions to a [`DeviceTransport`] and later collects
//! [`RawCompletion`]s from it. Register access, doorbells, PRP lists and the
//! like live behind this trait.

use std::ptr::NonNull;

use crate::buffer::Buffer;
use crate::error::Result;

use super::command::{Command, SeqId, Status};

/// Payload region lent to the device for the duration of one command.
///
/// Points into a region the controller owns while the command is
/// outstanding. Carries no lifetime: validity is guaranteed through the
/// [`DeviceTransport`] contract.
#[derive(Debug)]
pub struct Payload {
    ptr: NonNull<u8>,
    len: usize,
}

// Exclusively lent to the transport while the command is outstanding
unsafe impl Send for Payload {}

impl Payload {
    /// Lend the first `len` bytes of `buf`. Caller checks `len <= buf.len()`.
    pub(crate) fn from_buffer(buf: &mut Buffer, len: usize) -> Self {
        debug_assert!(len <= buf.len());
        Self {
            // Buffer pointers are never null
            ptr: NonNull::new(buf.as_mut_ptr()).unwrap_or(NonNull::dangling()),
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the region as a byte slice.
    ///
    /// # Safety
    ///
    /// Only valid while the owning command is outstanding (see
    /// [`DeviceTransport`]), and no other slice over the region may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Completion as posted by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCompletion {
    pub seq: SeqId,
    /// Raw 16-bit status word, see [`Status::from_raw`]
    pub status: u16,
    pub cdw0: u32,
}

impl RawCompletion {
    pub fn success(seq: SeqId, cdw0: u32) -> Self {
        Self {
            seq,
            status: 0,
            cdw0,
        }
    }

    pub fn with_status(seq: SeqId, status: Status) -> Self {
        Self {
            seq,
            status: status.to_raw(),
            cdw0: 0,
        }
    }

    pub fn status(&self) -> Status {
        Status::from_raw(self.status)
    }
}

/// Submission/completion capability of one device connection.
///
/// # Safety
///
/// Implementations may read and write a [`Payload`] only between the
/// `submit_raw` call that received it and whichever comes first of:
/// - returning the command's completion from `poll_completions`,
/// - returning from `abort` for the command's id,
/// - `submit_raw` returning an error.
///
/// The controller owns the backing [`Buffer`] for at least that window,
/// independent of anything the caller does with its own buffer or handle, so
/// an implementation that honors it can never touch freed memory.
pub unsafe trait DeviceTransport: Send + Sync {
    /// Maximum number of commands the device accepts outstanding.
    fn queue_depth(&self) -> usize;

    /// Hand a command to the device. Must not block on its completion.
    ///
    /// # Safety
    ///
    /// `payload`, if any, must stay valid and unaliased until the command's
    /// completion is polled or it is aborted.
    unsafe fn submit_raw(&self, seq: SeqId, cmd: &Command, payload: Option<Payload>)
    -> Result<()>;

    /// Collect up to `max` posted completions, in whatever order the device
    /// finished them.
    fn poll_completions(&self, max: usize) -> Vec<RawCompletion>;

    /// Stop tracking `seq`. After this returns the device no longer touches
    /// the command's payload and never reports it.
    fn abort(&self, seq: SeqId);
}
