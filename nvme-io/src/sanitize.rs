//! Sanitize status log decoding.
//!
//! The sanitize status log page (LID 0x81) is a fixed layout defined by the
//! device firmware. Offsets are kept in a [`SanitizeLogLayout`] value so a
//! device with a different layout only needs a different constant.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::nvme::{Controller, DeviceTransport};

/// Inclusive byte range `[hi:lo]` of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub hi: usize,
    pub lo: usize,
}

impl Field {
    pub const fn new(hi: usize, lo: usize) -> Self {
        Self { hi, lo }
    }

    pub fn read(self, buf: &Buffer) -> Result<u64> {
        buf.data(self.hi, self.lo)
    }
}

/// Where the sanitize status fields live in the log page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeLogLayout {
    /// SPROG, progress numerator out of [`PROGRESS_MAX`]
    pub progress: Field,
    /// SSTAT
    pub status: Field,
    /// Bits of SSTAT holding the state code
    pub state_mask: u64,
    /// Bytes to request with Get Log Page
    pub transfer_size: usize,
}

/// Layout of the NVMe sanitize status log page.
pub const SANITIZE_LOG: SanitizeLogLayout = SanitizeLogLayout {
    progress: Field::new(1, 0),
    status: Field::new(3, 2),
    state_mask: 0x7,
    transfer_size: 20,
};

/// Sanitize Capabilities (SANICAP) in the identify controller data.
///
/// Zero is taken to mean sanitize is not supported. That conflates "no
/// sanitize operation bits set" with the whole dword being zero; check the
/// operation bits against the device documentation before relying on it.
pub const SANICAP: Field = Field::new(331, 328);

/// Denominator of the progress field.
pub const PROGRESS_MAX: u16 = 0xffff;

/// Most recent sanitize operation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeState {
    NeverSanitized,
    Completed,
    InProgress,
    Failed,
}

impl SanitizeState {
    /// Decode an SSTAT state code. Code 4 (completed without deallocation)
    /// counts as completed.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(SanitizeState::NeverSanitized),
            1 | 4 => Ok(SanitizeState::Completed),
            2 => Ok(SanitizeState::InProgress),
            3 => Ok(SanitizeState::Failed),
            other => Err(Error::Decode(format!("reserved sanitize state {}", other))),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            SanitizeState::NeverSanitized => 0,
            SanitizeState::Completed => 1,
            SanitizeState::InProgress => 2,
            SanitizeState::Failed => 3,
        }
    }
}

/// Decoded view of a sanitize status log page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeStatus {
    pub state: SanitizeState,
    /// Raw SPROG value
    pub progress: u16,
}

impl SanitizeStatus {
    pub fn new(state: SanitizeState, progress: u16) -> Self {
        Self { state, progress }
    }

    /// Build from a progress fraction in `0.0..=1.0`.
    pub fn from_fraction(state: SanitizeState, fraction: f64) -> Self {
        let progress = (fraction.clamp(0.0, 1.0) * PROGRESS_MAX as f64).round() as u16;
        Self { state, progress }
    }

    /// Decode with the standard [`SANITIZE_LOG`] layout.
    pub fn decode(buf: &Buffer) -> Result<Self> {
        Self::decode_with(buf, &SANITIZE_LOG)
    }

    /// # Errors
    ///
    /// [`Error::Range`] if the layout does not fit the buffer,
    /// [`Error::Decode`] for a reserved state code.
    pub fn decode_with(buf: &Buffer, layout: &SanitizeLogLayout) -> Result<Self> {
        let progress = layout.progress.read(buf)?;
        let progress = u16::try_from(progress)
            .map_err(|_| Error::Decode(format!("progress {:#x} wider than 16 bits", progress)))?;
        let code = layout.status.read(buf)? & layout.state_mask;
        let code = u8::try_from(code)
            .map_err(|_| Error::Decode(format!("sanitize state {:#x} wider than 8 bits", code)))?;
        let state = SanitizeState::from_code(code)?;
        Ok(Self { state, progress })
    }

    /// Write this status into `buf` at the standard layout.
    pub fn encode(&self, buf: &mut Buffer) -> Result<()> {
        let layout = &SANITIZE_LOG;
        buf.set_data(layout.progress.hi, layout.progress.lo, self.progress as u64)?;
        buf.set_data(layout.status.hi, layout.status.lo, self.state.code() as u64)
    }

    pub fn fraction(&self) -> f64 {
        self.progress as f64 / PROGRESS_MAX as f64
    }

    /// Progress rounded to whole percent.
    pub fn percent(&self) -> u32 {
        (self.progress as u32 * 100 + PROGRESS_MAX as u32 / 2) / PROGRESS_MAX as u32
    }

    /// The operation is no longer running.
    pub fn is_terminal(&self) -> bool {
        self.state != SanitizeState::InProgress
    }
}

/// Identify the controller into `buf` and report whether SANICAP is non-zero.
pub fn sanitize_supported<T: DeviceTransport>(
    ctrlr: &Controller<T>,
    buf: &mut Buffer,
) -> Result<bool> {
    ctrlr.identify(buf)?.waitdone()?;
    let sanicap = SANICAP.read(buf)?;
    tracing::info!(sanicap, "sanitize capabilities");
    Ok(sanicap != 0)
}

/// Like [`sanitize_supported`], but an unsupported device is an error.
///
/// # Errors
///
/// [`Error::NotSupported`] when SANICAP is zero.
pub fn ensure_sanitize_supported<T: DeviceTransport>(
    ctrlr: &Controller<T>,
    buf: &mut Buffer,
) -> Result<()> {
    if sanitize_supported(ctrlr, buf)? {
        Ok(())
    } else {
        Err(Error::NotSupported("sanitize"))
    }
}
