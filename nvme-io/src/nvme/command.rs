//! Admin command and completion model.

use std::fmt;
use std::time::Duration;

/// Identifier assigned to a command at submission, unique per controller.
///
/// Monotonically increasing; never reused while the controller lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqId(pub u64);

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Admin command opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    GetLogPage,
    Identify,
    Abort,
    FirmwareCommit,
    FirmwareDownload,
    FormatNvm,
    Sanitize,
    Other(u8),
}

impl Opcode {
    pub fn raw(self) -> u8 {
        match self {
            Opcode::GetLogPage => 0x02,
            Opcode::Identify => 0x06,
            Opcode::Abort => 0x08,
            Opcode::FirmwareCommit => 0x10,
            Opcode::FirmwareDownload => 0x11,
            Opcode::FormatNvm => 0x80,
            Opcode::Sanitize => 0x84,
            Opcode::Other(opc) => opc,
        }
    }

    pub fn from_raw(opc: u8) -> Self {
        match opc {
            0x02 => Opcode::GetLogPage,
            0x06 => Opcode::Identify,
            0x08 => Opcode::Abort,
            0x10 => Opcode::FirmwareCommit,
            0x11 => Opcode::FirmwareDownload,
            0x80 => Opcode::FormatNvm,
            0x84 => Opcode::Sanitize,
            other => Opcode::Other(other),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(cmd_name(self.raw()))
    }
}

/// Human-readable name of an admin opcode.
pub fn cmd_name(opc: u8) -> &'static str {
    match opc {
        0x00 => "Delete I/O Submission Queue",
        0x01 => "Create I/O Submission Queue",
        0x02 => "Get Log Page",
        0x04 => "Delete I/O Completion Queue",
        0x05 => "Create I/O Completion Queue",
        0x06 => "Identify",
        0x08 => "Abort",
        0x09 => "Set Features",
        0x0a => "Get Features",
        0x0c => "Asynchronous Event Request",
        0x0d => "Namespace Management",
        0x10 => "Firmware Commit",
        0x11 => "Firmware Image Download",
        0x14 => "Device Self-test",
        0x15 => "Namespace Attachment",
        0x18 => "Keep Alive",
        0x80 => "Format NVM",
        0x81 => "Security Send",
        0x82 => "Security Receive",
        0x84 => "Sanitize",
        _ => "Unknown",
    }
}

/// Sanitize action (CDW10 SANACT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SanitizeAction {
    ExitFailureMode = 1,
    BlockErase = 2,
    Overwrite = 3,
    CryptoErase = 4,
}

/// Log page identifier of the sanitize status log.
pub const LID_SANITIZE_STATUS: u8 = 0x81;

/// Logical admin submission entry.
///
/// Data pointers are not part of it; the payload buffer is attached at
/// submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub nsid: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl Command {
    /// Bare command with all dwords zero.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            nsid: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub fn nsid(mut self, nsid: u32) -> Self {
        self.nsid = nsid;
        self
    }

    /// Identify Controller (CNS 1).
    pub fn identify_controller() -> Self {
        let mut cmd = Self::new(Opcode::Identify);
        cmd.cdw10 = 1;
        cmd
    }

    /// Get Log Page for `lid`, transferring `len` bytes (dword multiple).
    pub fn get_log_page(lid: u8, len: usize) -> Self {
        let numd = (len / 4).saturating_sub(1) as u32;
        let mut cmd = Self::new(Opcode::GetLogPage).nsid(0xffff_ffff);
        cmd.cdw10 = lid as u32 | ((numd & 0xffff) << 16);
        cmd.cdw11 = numd >> 16;
        cmd
    }

    /// Format NVM with LBA format `lbaf` and secure erase setting `ses`.
    pub fn format(nsid: u32, lbaf: u8, ses: u8) -> Self {
        let mut cmd = Self::new(Opcode::FormatNvm).nsid(nsid);
        cmd.cdw10 = (lbaf as u32 & 0xf) | ((ses as u32 & 0x7) << 9);
        cmd
    }

    /// Sanitize with `action`; `pattern` is the overwrite pattern (CDW11).
    pub fn sanitize(action: SanitizeAction, pattern: u32) -> Self {
        let mut cmd = Self::new(Opcode::Sanitize);
        cmd.cdw10 = action as u32;
        cmd.cdw11 = pattern;
        cmd
    }

    /// Firmware Image Download of `len` bytes at byte `offset` of the image.
    pub fn firmware_download(offset: usize, len: usize) -> Self {
        let mut cmd = Self::new(Opcode::FirmwareDownload);
        cmd.cdw10 = (len / 4).saturating_sub(1) as u32;
        cmd.cdw11 = (offset / 4) as u32;
        cmd
    }

    /// Firmware Commit of the downloaded image into `slot` with commit `action`.
    pub fn firmware_commit(slot: u8, action: u8) -> Self {
        let mut cmd = Self::new(Opcode::FirmwareCommit);
        cmd.cdw10 = (slot as u32 & 0x7) | ((action as u32 & 0x7) << 3);
        cmd
    }
}

/// Completion status field.
///
/// Packed as in the completion queue entry: bit 0 is the phase tag,
/// SC is bits 8:1, SCT bits 11:9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    pub sct: u8,
    pub sc: u8,
}

impl Status {
    pub const SUCCESS: Status = Status { sct: 0, sc: 0 };

    pub const fn new(sct: u8, sc: u8) -> Self {
        Self { sct, sc }
    }

    /// Decode from the raw 16-bit status word (phase tag ignored).
    pub fn from_raw(status_raw: u16) -> Self {
        Self {
            sct: ((status_raw >> 9) & 0x7) as u8,
            sc: ((status_raw >> 1) & 0xff) as u8,
        }
    }

    pub fn to_raw(self) -> u16 {
        ((self.sct as u16 & 0x7) << 9) | ((self.sc as u16) << 1)
    }

    pub fn is_error(self) -> bool {
        self.sct != 0 || self.sc != 0
    }

    /// Generic "abort requested" or "aborted due to SQ deletion".
    pub fn is_abort(self) -> bool {
        self.sct == 0 && (self.sc == 0x07 || self.sc == 0x08)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sct={:#x} sc={:#04x}", self.sct, self.sc)
    }
}

/// What `waitdone` hands back for a successful command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionInfo {
    pub seq: SeqId,
    pub opcode: Opcode,
    pub status: Status,
    /// Command specific result (completion dword 0)
    pub cdw0: u32,
    pub latency: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_raw_layout() {
        let status = Status::from_raw((0x1 << 9) | (0x0b << 1) | 1);
        assert_eq!(status, Status::new(1, 0x0b));
        assert!(status.is_error());
        assert_eq!(Status::from_raw(status.to_raw()), status);
        assert!(!Status::from_raw(1).is_error());
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(Opcode::from_raw(0x84), Opcode::Sanitize);
        assert_eq!(Opcode::Other(0x99).raw(), 0x99);
        assert_eq!(Opcode::Sanitize.to_string(), "Sanitize");
        assert_eq!(cmd_name(0x11), "Firmware Image Download");
        assert_eq!(cmd_name(0xfe), "Unknown");
    }

    #[test]
    fn test_command_dwords() {
        let cmd = Command::get_log_page(LID_SANITIZE_STATUS, 20);
        assert_eq!(cmd.cdw10, 0x81 | (4 << 16));
        assert_eq!(cmd.nsid, 0xffff_ffff);

        let cmd = Command::firmware_download(8192, 4096);
        assert_eq!(cmd.cdw10, 1023);
        assert_eq!(cmd.cdw11, 2048);

        let cmd = Command::firmware_commit(2, 1);
        assert_eq!(cmd.cdw10, 2 | (1 << 3));

        let cmd = Command::format(1, 0, 1);
        assert_eq!(cmd.nsid, 1);
        assert_eq!(cmd.cdw10, 1 << 9);

        assert_eq!(Command::sanitize(SanitizeAction::BlockErase, 0).cdw10, 2);
    }
}
