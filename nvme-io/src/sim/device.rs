//! Simulated controller state machine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::nvme::{
    Command, DeviceTransport, IDENTIFY_SIZE, LID_SANITIZE_STATUS, Opcode, Payload, RawCompletion,
    SeqId, Status,
};
use crate::sanitize::{SANICAP, SANITIZE_LOG, SanitizeState, SanitizeStatus};

/// Admin queue depth reported by default.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Block erase supported.
pub const DEFAULT_SANICAP: u32 = 0x2;

// Generic command status codes
const SC_INVALID_OPCODE: u8 = 0x01;
const SC_INVALID_FIELD: u8 = 0x02;
const SC_SANITIZE_IN_PROGRESS: u8 = 0x1d;

const SANITIZE_LOG_SIZE: usize = 20;

struct SimState {
    identify: Vec<u8>,
    sanitize_script: Vec<SanitizeStatus>,
    sanitize_pending: VecDeque<SanitizeStatus>,
    sanitize_status: SanitizeStatus,
    firmware: Vec<u8>,
    committed: Option<(u8, Vec<u8>)>,
    formatted: Vec<u32>,
    hold: bool,
    held: Vec<RawCompletion>,
    posted: VecDeque<RawCompletion>,
    swallow: HashSet<u8>,
    forced: HashMap<u8, Status>,
    submitted: Vec<(SeqId, Command)>,
    aborted: Vec<SeqId>,
}

/// In-memory NVMe controller.
///
/// Configure it with the `with_*` methods before handing it to a
/// [`Controller`](crate::nvme::Controller); reach it afterwards through
/// [`Controller::transport`](crate::nvme::Controller::transport) to steer
/// completion delivery.
pub struct SimDevice {
    queue_depth: usize,
    state: Mutex<SimState>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    /// Device with sanitize support and a four step sanitize run.
    pub fn new() -> Self {
        let mut identify = vec![0u8; IDENTIFY_SIZE];
        identify[0..2].copy_from_slice(&0x1b36u16.to_le_bytes());
        write_ascii(&mut identify[4..24], "SIM0001");
        write_ascii(&mut identify[24..64], "nvme-io simulated controller");
        write_ascii(&mut identify[64..72], "1.0");
        identify[SANICAP.lo..=SANICAP.hi].copy_from_slice(&DEFAULT_SANICAP.to_le_bytes());

        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            state: Mutex::new(SimState {
                identify,
                sanitize_script: vec![
                    SanitizeStatus::from_fraction(SanitizeState::InProgress, 0.25),
                    SanitizeStatus::from_fraction(SanitizeState::InProgress, 0.50),
                    SanitizeStatus::from_fraction(SanitizeState::InProgress, 0.75),
                    SanitizeStatus::from_fraction(SanitizeState::Completed, 1.0),
                ],
                sanitize_pending: VecDeque::new(),
                sanitize_status: SanitizeStatus::new(SanitizeState::NeverSanitized, 0xffff),
                firmware: Vec::new(),
                committed: None,
                formatted: Vec::new(),
                hold: false,
                held: Vec::new(),
                posted: VecDeque::new(),
                swallow: HashSet::new(),
                forced: HashMap::new(),
                submitted: Vec::new(),
                aborted: Vec::new(),
            }),
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the identify SANICAP dword. Zero reports sanitize as unsupported.
    pub fn with_sanicap(self, sanicap: u32) -> Self {
        self.lock().identify[SANICAP.lo..=SANICAP.hi].copy_from_slice(&sanicap.to_le_bytes());
        self
    }

    /// Statuses returned by successive sanitize log reads after a Sanitize
    /// command. The last one sticks.
    pub fn with_sanitize_script(self, script: Vec<SanitizeStatus>) -> Self {
        self.lock().sanitize_script = script;
        self
    }

    /// Status the log reports before any sanitize was issued.
    pub fn with_sanitize_status(self, status: SanitizeStatus) -> Self {
        self.lock().sanitize_status = status;
        self
    }

    /// Keep new completions back until [`release`](Self::release)d.
    pub fn hold_completions(&self, hold: bool) {
        self.lock().hold = hold;
    }

    /// Ids of completions currently held back, in submission order.
    pub fn held(&self) -> Vec<SeqId> {
        self.lock().held.iter().map(|c| c.seq).collect()
    }

    /// Post held completions in exactly the given order. Unknown ids are
    /// ignored.
    pub fn release(&self, order: &[SeqId]) {
        let mut state = self.lock();
        for seq in order {
            if let Some(pos) = state.held.iter().position(|c| c.seq == *seq) {
                let cpl = state.held.remove(pos);
                state.posted.push_back(cpl);
            }
        }
    }

    /// Post every held completion in submission order.
    pub fn release_all(&self) {
        let mut state = self.lock();
        let held: Vec<_> = state.held.drain(..).collect();
        state.posted.extend(held);
    }

    /// Never post completions for `opcode`.
    pub fn swallow(&self, opcode: Opcode) {
        self.lock().swallow.insert(opcode.raw());
    }

    /// Complete every `opcode` command with `status` without executing it.
    pub fn force_status(&self, opcode: Opcode, status: Status) {
        self.lock().forced.insert(opcode.raw(), status);
    }

    /// Post an arbitrary completion, matching command or not.
    pub fn post_raw(&self, cpl: RawCompletion) {
        self.lock().posted.push_back(cpl);
    }

    /// Every command accepted so far.
    pub fn submitted(&self) -> Vec<(SeqId, Command)> {
        self.lock().submitted.clone()
    }

    /// Every id aborted by the controller.
    pub fn aborted(&self) -> Vec<SeqId> {
        self.lock().aborted.clone()
    }

    /// Namespaces formatted, in order.
    pub fn formatted(&self) -> Vec<u32> {
        self.lock().formatted.clone()
    }

    /// Slot and image of the last Firmware Commit.
    pub fn committed_firmware(&self) -> Option<(u8, Vec<u8>)> {
        self.lock().committed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SimState {
    /// Run `cmd` against the device state; returns status and cdw0.
    fn execute(&mut self, cmd: &Command, data: Option<&mut [u8]>) -> (Status, u32) {
        let invalid_field = (Status::new(0, SC_INVALID_FIELD), 0);
        let sanitizing = self.sanitize_status.state == SanitizeState::InProgress;

        match cmd.opcode {
            Opcode::Identify => {
                let Some(data) = data else {
                    return invalid_field;
                };
                let n = data.len().min(self.identify.len());
                data[..n].copy_from_slice(&self.identify[..n]);
                (Status::SUCCESS, 0)
            }
            Opcode::GetLogPage => {
                let Some(data) = data else {
                    return invalid_field;
                };
                data.fill(0);
                if (cmd.cdw10 & 0xff) as u8 == LID_SANITIZE_STATUS {
                    if let Some(next) = self.sanitize_pending.pop_front() {
                        self.sanitize_status = next;
                    }
                    let page = sanitize_log(&self.sanitize_status);
                    let n = data.len().min(page.len());
                    data[..n].copy_from_slice(&page[..n]);
                }
                (Status::SUCCESS, 0)
            }
            Opcode::Sanitize => {
                if sanitizing {
                    return (Status::new(0, SC_SANITIZE_IN_PROGRESS), 0);
                }
                if !(1..=4).contains(&(cmd.cdw10 & 0x7)) {
                    return invalid_field;
                }
                self.sanitize_pending = self.sanitize_script.iter().copied().collect();
                self.sanitize_status = SanitizeStatus::new(SanitizeState::InProgress, 0);
                (Status::SUCCESS, 0)
            }
            Opcode::FormatNvm => {
                if sanitizing {
                    return (Status::new(0, SC_SANITIZE_IN_PROGRESS), 0);
                }
                self.formatted.push(cmd.nsid);
                (Status::SUCCESS, 0)
            }
            Opcode::FirmwareDownload => {
                let Some(data) = data else {
                    return invalid_field;
                };
                let offset = cmd.cdw11 as usize * 4;
                let len = (cmd.cdw10 as usize + 1) * 4;
                if len > data.len() {
                    return invalid_field;
                }
                if self.firmware.len() < offset + len {
                    self.firmware.resize(offset + len, 0);
                }
                self.firmware[offset..offset + len].copy_from_slice(&data[..len]);
                (Status::SUCCESS, 0)
            }
            Opcode::FirmwareCommit => {
                if self.firmware.is_empty() {
                    // Invalid Firmware Image
                    return (Status::new(1, 0x07), 0);
                }
                let slot = (cmd.cdw10 & 0x7) as u8;
                self.committed = Some((slot, std::mem::take(&mut self.firmware)));
                (Status::SUCCESS, 0)
            }
            Opcode::Abort | Opcode::Other(_) => (Status::new(0, SC_INVALID_OPCODE), 0),
        }
    }
}

fn sanitize_log(status: &SanitizeStatus) -> [u8; SANITIZE_LOG_SIZE] {
    let mut page = [0u8; SANITIZE_LOG_SIZE];
    let layout = &SANITIZE_LOG;
    page[layout.progress.lo..=layout.progress.hi].copy_from_slice(&status.progress.to_le_bytes());
    page[layout.status.lo..=layout.status.hi]
        .copy_from_slice(&(status.state.code() as u16).to_le_bytes());
    page
}

fn write_ascii(field: &mut [u8], text: &str) {
    field.fill(b' ');
    let n = field.len().min(text.len());
    field[..n].copy_from_slice(&text.as_bytes()[..n]);
}

// Payloads are only touched inside `submit_raw`, never after it returns.
unsafe impl DeviceTransport for SimDevice {
    fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    unsafe fn submit_raw(
        &self,
        seq: SeqId,
        cmd: &Command,
        payload: Option<Payload>,
    ) -> Result<()> {
        let mut state = self.lock();

        if state.submitted.iter().any(|(s, _)| *s == seq) {
            return Err(Error::InvalidArgument(format!("{} submitted twice", seq)));
        }
        state.submitted.push((seq, *cmd));

        let opc = cmd.opcode.raw();
        let forced = state.forced.get(&opc).copied();
        let (status, cdw0) = match forced {
            Some(status) => (status, 0),
            None => {
                let data = payload.as_ref().map(|p| unsafe { p.as_mut_slice() });
                state.execute(cmd, data)
            }
        };

        if state.swallow.contains(&opc) {
            return Ok(());
        }

        let cpl = RawCompletion {
            seq,
            status: status.to_raw(),
            cdw0,
        };
        if state.hold {
            state.held.push(cpl);
        } else {
            state.posted.push_back(cpl);
        }
        Ok(())
    }

    fn poll_completions(&self, max: usize) -> Vec<RawCompletion> {
        let mut state = self.lock();
        let n = max.min(state.posted.len());
        state.posted.drain(..n).collect()
    }

    fn abort(&self, seq: SeqId) {
        let mut state = self.lock();
        state.held.retain(|c| c.seq != seq);
        state.posted.retain(|c| c.seq != seq);
        state.aborted.push(seq);
    }
}
