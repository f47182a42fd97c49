//! Controller options.

use std::time::Duration;

/// Default per-command timeout.
pub const DEFAULT_TIMEOUT_MS: u32 = 10_000;
/// Default park time of an idle waiter between drains.
pub const DEFAULT_POLL_INTERVAL_US: u32 = 100;
/// Default number of entries kept in the command log.
pub const DEFAULT_CMDLOG_DEPTH: usize = 128;
/// Default firmware download transfer size.
pub const DEFAULT_FW_CHUNK_SIZE: usize = 32 * 1024;

/// Controller options.
///
/// Configure controller behavior at creation. Unset fields take defaults.
#[derive(Debug, Default, Clone)]
pub struct ControllerOpts {
    /// Outstanding command limit (defaults to the transport's queue depth)
    pub queue_depth: Option<usize>,
    /// Per-command timeout in ms
    pub timeout_ms: Option<u32>,
    /// How long a waiter parks before draining again, in µs
    pub poll_interval_us: Option<u32>,
    /// Command log entries kept
    pub cmdlog_depth: Option<usize>,
    /// Firmware download chunk size in bytes (non-zero multiple of 4)
    pub fw_chunk_size: Option<usize>,
}

/// Options with every default applied.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOpts {
    pub queue_depth: usize,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub cmdlog_depth: usize,
    pub fw_chunk_size: usize,
}

impl ControllerOpts {
    pub(crate) fn resolve(&self, transport_depth: usize) -> ResolvedOpts {
        ResolvedOpts {
            queue_depth: self.queue_depth.unwrap_or(transport_depth),
            timeout: Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS) as u64),
            poll_interval: Duration::from_micros(
                self.poll_interval_us.unwrap_or(DEFAULT_POLL_INTERVAL_US) as u64,
            ),
            cmdlog_depth: self.cmdlog_depth.unwrap_or(DEFAULT_CMDLOG_DEPTH),
            fw_chunk_size: self.fw_chunk_size.unwrap_or(DEFAULT_FW_CHUNK_SIZE),
        }
    }
}
