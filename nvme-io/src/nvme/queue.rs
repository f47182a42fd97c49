//! Outstanding command table and completion matching.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::buffer::Buffer;
use crate::complete::{CompletionReceiver, CompletionSender, completion};
use crate::error::{DeviceError, Error, Result};

use super::command::{CompletionInfo, Opcode, SeqId};
use super::transport::RawCompletion;

/// Expired ids remembered for discarding late completions.
const EXPIRED_MEMORY: usize = 256;

struct Outstanding {
    opcode: Opcode,
    submitted: Instant,
    /// `None` never expires
    deadline: Option<Instant>,
    /// Device-visible copy of the caller's payload
    bounce: Option<Buffer>,
    tx: CompletionSender<Completed>,
}

/// What a waiter receives for a successful command: the completion and the
/// payload region the device transferred into.
pub(crate) struct Completed {
    pub info: CompletionInfo,
    pub data: Option<Buffer>,
}

/// How a command left the outstanding table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub seq: SeqId,
    /// `cdw0` on success
    pub result: std::result::Result<u32, DeviceError>,
    pub latency: Duration,
}

/// Commands in flight, keyed by sequence id.
///
/// Completions are matched by id only, never by position, so the device
/// may finish commands in any order. Each entry owns the payload region the
/// device works on, so the region lives exactly as long as the command.
pub(crate) struct CompletionQueue {
    outstanding: HashMap<SeqId, Outstanding>,
    expired: VecDeque<SeqId>,
    next_seq: u64,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self {
            outstanding: HashMap::new(),
            expired: VecDeque::new(),
            next_seq: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    #[cfg(test)]
    pub fn contains(&self, seq: SeqId) -> bool {
        self.outstanding.contains_key(&seq)
    }

    /// Allocate the next id and park a completion slot and payload for it.
    ///
    /// A timeout too large to represent as an instant never expires.
    pub fn register(
        &mut self,
        opcode: Opcode,
        timeout: Duration,
        now: Instant,
        bounce: Option<Buffer>,
    ) -> (SeqId, CompletionReceiver<Completed>) {
        let seq = SeqId(self.next_seq);
        self.next_seq += 1;

        let (tx, rx) = completion();
        self.outstanding.insert(
            seq,
            Outstanding {
                opcode,
                submitted: now,
                deadline: now.checked_add(timeout),
                bounce,
                tx,
            },
        );
        (seq, rx)
    }

    /// Forget a command the device never accepted. Its receiver resolves
    /// to `Aborted` once the slot is dropped.
    pub fn unregister(&mut self, seq: SeqId) {
        self.outstanding.remove(&seq);
    }

    /// Match a device completion to its command and resolve the waiter.
    ///
    /// Returns `Ok(None)` for a late completion of an already expired
    /// command.
    pub fn complete(&mut self, raw: RawCompletion, now: Instant) -> Result<Option<Resolution>> {
        let Some(cmd) = self.outstanding.remove(&raw.seq) else {
            if let Some(pos) = self.expired.iter().position(|&s| s == raw.seq) {
                self.expired.remove(pos);
                return Ok(None);
            }
            return Err(Error::UnknownCompletion(raw.seq));
        };

        let status = raw.status();
        let latency = now.saturating_duration_since(cmd.submitted);
        let result = match DeviceError::from_status(status) {
            None => {
                cmd.tx.success(Completed {
                    info: CompletionInfo {
                        seq: raw.seq,
                        opcode: cmd.opcode,
                        status,
                        cdw0: raw.cdw0,
                        latency,
                    },
                    data: cmd.bounce,
                });
                Ok(raw.cdw0)
            }
            Some(err) => {
                cmd.tx.error(err.clone().into());
                Err(err)
            }
        };

        Ok(Some(Resolution {
            seq: raw.seq,
            result,
            latency,
        }))
    }

    /// Fail every command past its deadline with [`DeviceError::Timeout`].
    ///
    /// `abort` is called for each one before its payload is released.
    pub fn expire(&mut self, now: Instant, mut abort: impl FnMut(SeqId)) -> Vec<Resolution> {
        let overdue: Vec<SeqId> = self
            .outstanding
            .iter()
            .filter(|(_, cmd)| cmd.deadline.is_some_and(|d| d <= now))
            .map(|(&seq, _)| seq)
            .collect();

        overdue
            .into_iter()
            .filter_map(|seq| {
                let cmd = self.outstanding.remove(&seq)?;
                abort(seq);
                cmd.tx.error(DeviceError::Timeout.into());

                if self.expired.len() == EXPIRED_MEMORY {
                    self.expired.pop_front();
                }
                self.expired.push_back(seq);

                Some(Resolution {
                    seq,
                    result: Err(DeviceError::Timeout),
                    latency: now.saturating_duration_since(cmd.submitted),
                })
            })
            .collect()
    }

    /// Fail every outstanding command with [`DeviceError::Aborted`], calling
    /// `abort` for each before its payload is released.
    pub fn abort_all(&mut self, now: Instant, mut abort: impl FnMut(SeqId)) -> Vec<Resolution> {
        self.outstanding
            .drain()
            .map(|(seq, cmd)| {
                abort(seq);
                cmd.tx.error(DeviceError::Aborted.into());
                Resolution {
                    seq,
                    result: Err(DeviceError::Aborted),
                    latency: now.saturating_duration_since(cmd.submitted),
                }
            })
            .collect()
    }
}
