//! Recent command history for diagnostics.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::DeviceError;

use super::command::{Command, SeqId};
use super::queue::Resolution;

/// One submitted command and, once known, how it ended.
#[derive(Debug, Clone)]
pub struct CmdLogEntry {
    pub seq: SeqId,
    pub command: Command,
    pub submitted: Instant,
    /// `None` while outstanding
    pub outcome: Option<std::result::Result<u32, DeviceError>>,
    pub latency: Option<Duration>,
}

impl fmt::Display for CmdLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} nsid={:#x} cdw10={:#010x} cdw11={:#010x}",
            self.seq, self.command.opcode, self.command.nsid, self.command.cdw10, self.command.cdw11
        )?;
        match (&self.outcome, self.latency) {
            (Some(Ok(cdw0)), Some(lat)) => write!(f, " -> ok cdw0={:#x} in {:?}", cdw0, lat),
            (Some(Err(err)), Some(lat)) => write!(f, " -> {} in {:?}", err, lat),
            _ => write!(f, " -> pending"),
        }
    }
}

/// Bounded ring of the most recent commands.
pub(crate) struct CmdLog {
    entries: VecDeque<CmdLogEntry>,
    depth: usize,
}

impl CmdLog {
    pub fn new(depth: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(depth),
            depth,
        }
    }

    pub fn submitted(&mut self, seq: SeqId, command: Command, now: Instant) {
        if self.depth == 0 {
            return;
        }
        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(CmdLogEntry {
            seq,
            command,
            submitted: now,
            outcome: None,
            latency: None,
        });
    }

    pub fn resolved(&mut self, res: &Resolution) {
        // Recent commands sit at the back
        if let Some(entry) = self.entries.iter_mut().rev().find(|e| e.seq == res.seq) {
            entry.outcome = Some(res.result.clone());
            entry.latency = Some(res.latency);
        }
    }

    /// Up to `count` entries, newest first.
    pub fn recent(&self, count: usize) -> Vec<CmdLogEntry> {
        self.entries.iter().rev().take(count).cloned().collect()
    }
}
