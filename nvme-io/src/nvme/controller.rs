//! NVMe controller.
//!
//! Command submission, completion draining and the blocking `waitdone`
//! bridge.

use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::buffer::Buffer;
use crate::complete::{CompletionReceiver, block_on};
use crate::error::{Error, Result};

use super::cmdlog::{CmdLog, CmdLogEntry};
use super::command::{Command, CompletionInfo, Opcode, SanitizeAction, SeqId};
use super::opts::{ControllerOpts, ResolvedOpts};
use super::queue::{Completed, CompletionQueue, Resolution};
use super::transport::{DeviceTransport, Payload};

/// Identify data structure size.
pub const IDENTIFY_SIZE: usize = 4096;

struct State {
    queue: CompletionQueue,
    cmdlog: CmdLog,
    /// Completions posted for ids nothing was waiting on
    unknown: u64,
}

/// NVMe controller handle.
///
/// Owns one device connection and the table of commands in flight on it.
/// Created with [`new()`](Self::new); dropping it aborts whatever is still
/// outstanding.
///
/// # Thread Safety
///
/// `Sync` - share it by reference (or `Arc`) and submit from any thread.
/// Submission and draining are short critical sections; a thread blocked in
/// [`CommandHandle::waitdone`] parks without holding them.
///
/// # Example
///
/// ```
/// use nvme_io::Buffer;
/// use nvme_io::nvme::{Controller, ControllerOpts};
/// use nvme_io::sim::SimDevice;
///
/// # fn example() -> nvme_io::Result<()> {
/// let ctrlr = Controller::new(SimDevice::new(), ControllerOpts::default())?;
///
/// let mut buf = Buffer::new()?;
/// ctrlr.identify(&mut buf)?.waitdone()?;
/// println!("{}", buf.dump_len(64));
///
/// ctrlr.format(1)?.waitdone()?;
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub struct Controller<T: DeviceTransport> {
    transport: T,
    opts: ResolvedOpts,
    state: Mutex<State>,
    cond: Condvar,
}

impl<T: DeviceTransport> Controller<T> {
    /// Wrap a device connection.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if the resolved queue depth is zero or the
    /// firmware chunk size is not a non-zero multiple of 4.
    pub fn new(transport: T, opts: ControllerOpts) -> Result<Self> {
        let opts = opts.resolve(transport.queue_depth());

        if opts.queue_depth == 0 {
            return Err(Error::InvalidArgument("queue depth must be > 0".to_string()));
        }
        if opts.fw_chunk_size == 0 || opts.fw_chunk_size % 4 != 0 {
            return Err(Error::InvalidArgument(format!(
                "firmware chunk size {} is not a dword multiple",
                opts.fw_chunk_size
            )));
        }

        tracing::debug!(
            queue_depth = opts.queue_depth,
            timeout_ms = opts.timeout.as_millis() as u64,
            "controller created"
        );

        Ok(Self {
            transport,
            state: Mutex::new(State {
                queue: CompletionQueue::new(),
                cmdlog: CmdLog::new(opts.cmdlog_depth),
                unknown: 0,
            }),
            opts,
            cond: Condvar::new(),
        })
    }

    /// The underlying device connection.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Default per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.opts.timeout
    }

    /// Outstanding command limit.
    pub fn queue_depth(&self) -> usize {
        self.opts.queue_depth
    }

    /// Number of commands submitted and not yet resolved.
    pub fn outstanding(&self) -> usize {
        self.lock().queue.len()
    }

    /// Completions the device posted for ids with no outstanding command,
    /// counted on every drain path (waiters, pollers, `process_completions`).
    ///
    /// Any non-zero value is a protocol error on the device side.
    pub fn unknown_completions(&self) -> u64 {
        self.lock().unknown
    }

    /// Up to `count` most recent commands, newest first.
    pub fn cmdlog(&self, count: usize) -> Vec<CmdLogEntry> {
        self.lock().cmdlog.recent(count)
    }

    /// Submit a command with the default timeout.
    ///
    /// The device works on a copy of `buf` owned by the controller; the
    /// result is copied back into `buf` when the command is waited on.
    /// `buf` stays borrowed until the handle is dropped. Returns as soon as
    /// the device accepted the command.
    ///
    /// # Errors
    ///
    /// [`Error::QueueFull`] when the queue depth is reached, or whatever the
    /// transport reports for a rejected submission.
    pub fn submit<'a>(
        &'a self,
        cmd: Command,
        buf: Option<&'a mut Buffer>,
    ) -> Result<CommandHandle<'a, T>> {
        self.submit_with_timeout(cmd, buf, self.opts.timeout)
    }

    /// Submit a command that fails with
    /// [`DeviceError::Timeout`](crate::DeviceError::Timeout) if not completed
    /// within `timeout`.
    pub fn submit_with_timeout<'a>(
        &'a self,
        cmd: Command,
        buf: Option<&'a mut Buffer>,
        timeout: Duration,
    ) -> Result<CommandHandle<'a, T>> {
        let len = buf.as_ref().map_or(0, |b| b.len());
        self.submit_inner(cmd, buf, len, timeout)
    }

    fn submit_inner<'a>(
        &'a self,
        cmd: Command,
        buf: Option<&'a mut Buffer>,
        len: usize,
        timeout: Duration,
    ) -> Result<CommandHandle<'a, T>> {
        let mut bounce = match &buf {
            Some(buf) if len > buf.len() => {
                return Err(Error::InvalidArgument(format!(
                    "transfer of {} bytes exceeds buffer of {} bytes",
                    len,
                    buf.len()
                )));
            }
            Some(buf) if len > 0 => {
                let mut bounce = Buffer::allocate(len)?;
                bounce.as_mut_slice().copy_from_slice(&buf.as_slice()[..len]);
                Some(bounce)
            }
            _ => None,
        };
        let payload = bounce.as_mut().map(|b| Payload::from_buffer(b, len));

        let now = Instant::now();
        let mut state = self.lock();

        if state.queue.len() >= self.opts.queue_depth {
            return Err(Error::QueueFull {
                depth: self.opts.queue_depth,
            });
        }

        // The bounce region moves into the outstanding entry and is only
        // released after the transport is done with it.
        let (seq, rx) = state.queue.register(cmd.opcode, timeout, now, bounce);

        if let Err(err) = unsafe { self.transport.submit_raw(seq, &cmd, payload) } {
            state.queue.unregister(seq);
            tracing::warn!(%seq, opcode = %cmd.opcode, error = %err, "submission rejected");
            return Err(err);
        }
        state.cmdlog.submitted(seq, cmd, now);
        drop(state);

        tracing::debug!(%seq, opcode = %cmd.opcode, nsid = cmd.nsid, len, "submitted");

        Ok(CommandHandle {
            ctrlr: self,
            seq,
            opcode: cmd.opcode,
            rx,
            done: false,
            buf,
            len,
        })
    }

    /// Identify Controller into `buf` (at least [`IDENTIFY_SIZE`] bytes).
    pub fn identify<'a>(&'a self, buf: &'a mut Buffer) -> Result<CommandHandle<'a, T>> {
        if buf.len() < IDENTIFY_SIZE {
            return Err(Error::InvalidArgument(format!(
                "identify needs {} bytes, buffer has {}",
                IDENTIFY_SIZE,
                buf.len()
            )));
        }
        self.submit_inner(
            Command::identify_controller(),
            Some(buf),
            IDENTIFY_SIZE,
            self.opts.timeout,
        )
    }

    /// Read `transfer_size` bytes of log page `log_id` into the front of `buf`.
    pub fn getlogpage<'a>(
        &'a self,
        log_id: u8,
        buf: &'a mut Buffer,
        transfer_size: usize,
    ) -> Result<CommandHandle<'a, T>> {
        if transfer_size == 0 || transfer_size % 4 != 0 {
            return Err(Error::InvalidArgument(format!(
                "log page transfer size {} is not a dword multiple",
                transfer_size
            )));
        }
        self.submit_inner(
            Command::get_log_page(log_id, transfer_size),
            Some(buf),
            transfer_size,
            self.opts.timeout,
        )
    }

    /// Format namespace `ns_id` with LBA format 0, no secure erase.
    pub fn format(&self, ns_id: u32) -> Result<CommandHandle<'_, T>> {
        self.format_with(ns_id, 0, 0)
    }

    pub fn format_with(&self, ns_id: u32, lbaf: u8, ses: u8) -> Result<CommandHandle<'_, T>> {
        self.submit(Command::format(ns_id, lbaf, ses), None)
    }

    /// Start a block-erase sanitize.
    ///
    /// Completion only means the device accepted the operation; progress is
    /// reported through the sanitize status log, see
    /// [`ProgressMonitor`](crate::progress::ProgressMonitor).
    pub fn sanitize(&self) -> Result<CommandHandle<'_, T>> {
        self.sanitize_with(SanitizeAction::BlockErase, 0)
    }

    pub fn sanitize_with(
        &self,
        action: SanitizeAction,
        pattern: u32,
    ) -> Result<CommandHandle<'_, T>> {
        self.submit(Command::sanitize(action, pattern), None)
    }

    /// Download the firmware image at `path` and commit it to slot 0 with
    /// commit action 1 (replace, activate on next reset).
    pub fn downfw(&self, path: impl AsRef<Path>) -> Result<CommandHandle<'_, T>> {
        let path = path.as_ref();
        let image = std::fs::read(path)?;
        tracing::info!(path = %path.display(), size = image.len(), "firmware image loaded");
        self.downfw_image(&image, 0, 1)
    }

    /// Download `image` in chunks of the configured size, waiting for each,
    /// then submit the Firmware Commit and return its handle.
    ///
    /// The final chunk is zero padded to a dword boundary.
    pub fn downfw_image(
        &self,
        image: &[u8],
        slot: u8,
        action: u8,
    ) -> Result<CommandHandle<'_, T>> {
        if image.is_empty() {
            return Err(Error::InvalidArgument("empty firmware image".to_string()));
        }

        let chunk_size = self.opts.fw_chunk_size;
        let chunks = image.len().div_ceil(chunk_size);

        for (i, chunk) in image.chunks(chunk_size).enumerate() {
            let offset = i * chunk_size;
            let len = chunk.len().next_multiple_of(4);

            let mut buf = Buffer::allocate(len)?;
            buf.as_mut_slice()[..chunk.len()].copy_from_slice(chunk);

            self.submit_inner(
                Command::firmware_download(offset, len),
                Some(&mut buf),
                len,
                self.opts.timeout,
            )?
            .waitdone()?;

            tracing::debug!(chunk = i + 1, chunks, offset, len, "firmware chunk downloaded");
        }

        tracing::info!(size = image.len(), chunks, slot, action, "firmware downloaded, committing");
        self.submit(Command::firmware_commit(slot, action), None)
    }

    /// Drain posted completions and expire overdue commands.
    ///
    /// Returns the number of commands resolved. Waiters drain on their own,
    /// so calling this is only needed to make progress without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownCompletion`] if the device posted a completion no
    /// outstanding command matches. All other completions in the same batch
    /// are still delivered.
    pub fn process_completions(&self) -> Result<usize> {
        let mut state = self.lock();
        let (resolved, unknown) = self.drain_locked(&mut state);
        match unknown {
            Some(seq) => Err(Error::UnknownCompletion(seq)),
            None => Ok(resolved),
        }
    }

    /// Abort every outstanding command. Their waiters get
    /// [`DeviceError::Aborted`](crate::DeviceError::Aborted).
    pub fn shutdown(&self) {
        let mut state = self.lock();
        let transport = &self.transport;
        let aborted = state.queue.abort_all(Instant::now(), |seq| transport.abort(seq));
        for res in &aborted {
            state.cmdlog.resolved(res);
        }
        drop(state);

        if !aborted.is_empty() {
            tracing::info!(count = aborted.len(), "aborted outstanding commands");
            self.cond.notify_all();
        }
    }

    /// One waiter step: drain, and park briefly if nothing resolved.
    fn service(&self) {
        let mut state = self.lock();
        let (resolved, _) = self.drain_locked(&mut state);
        if resolved == 0 {
            let _ = self
                .cond
                .wait_timeout(state, self.opts.poll_interval)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn drain_locked(&self, state: &mut State) -> (usize, Option<SeqId>) {
        let posted = self.transport.poll_completions(self.opts.queue_depth);
        let now = Instant::now();
        let mut resolved = 0;
        let mut unknown = None;

        for raw in posted {
            match state.queue.complete(raw, now) {
                Ok(Some(res)) => {
                    log_resolution(&res);
                    state.cmdlog.resolved(&res);
                    resolved += 1;
                }
                Ok(None) => {
                    tracing::debug!(seq = %raw.seq, "discarded completion of expired command");
                }
                Err(_) => {
                    tracing::warn!(
                        seq = %raw.seq,
                        status = %raw.status(),
                        "completion for unknown command"
                    );
                    state.unknown += 1;
                    unknown.get_or_insert(raw.seq);
                }
            }
        }

        let transport = &self.transport;
        for res in state.queue.expire(now, |seq| transport.abort(seq)) {
            tracing::warn!(seq = %res.seq, after = ?res.latency, "command timed out");
            state.cmdlog.resolved(&res);
            resolved += 1;
        }

        if resolved > 0 {
            self.cond.notify_all();
        }
        (resolved, unknown)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_resolution(res: &Resolution) {
    match &res.result {
        Ok(cdw0) => tracing::debug!(seq = %res.seq, cdw0, latency = ?res.latency, "completed"),
        Err(err) => tracing::warn!(seq = %res.seq, error = %err, "command failed"),
    }
}

impl<T: DeviceTransport> Drop for Controller<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A submitted command.
///
/// Borrows the controller and, if one was attached, the payload buffer. The
/// device only ever sees a controller-owned copy of the buffer, which lives
/// until the transport is done with it; the result lands in the caller's
/// buffer when the handle observes the completion. Dropping a handle that
/// was never waited on blocks until the command resolves.
#[must_use = "dropping a CommandHandle blocks until the command resolves"]
pub struct CommandHandle<'a, T: DeviceTransport> {
    ctrlr: &'a Controller<T>,
    seq: SeqId,
    opcode: Opcode,
    rx: CompletionReceiver<Completed>,
    done: bool,
    buf: Option<&'a mut Buffer>,
    /// Bytes of `buf` the command transfers
    len: usize,
}

impl<'a, T: DeviceTransport> CommandHandle<'a, T> {
    pub fn seq(&self) -> SeqId {
        self.seq
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Block until this command's completion is observed.
    ///
    /// While waiting the calling thread drains the device itself, so no
    /// background poller is required. Device failures, including timeouts,
    /// come back as [`Error::Device`].
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyCompleted`] on any call after the first.
    pub fn waitdone(&mut self) -> Result<CompletionInfo> {
        if self.done {
            return Err(Error::AlreadyCompleted(self.seq));
        }
        let ctrlr = self.ctrlr;
        let result = block_on(&mut self.rx, || ctrlr.service());
        self.done = true;
        Ok(self.collect(result?))
    }

    /// Non-blocking variant of [`waitdone`](Self::waitdone): drain once and
    /// return `None` if the command is still outstanding.
    pub fn try_waitdone(&mut self) -> Option<Result<CompletionInfo>> {
        if self.done {
            return Some(Err(Error::AlreadyCompleted(self.seq)));
        }
        if let Err(err) = self.ctrlr.process_completions() {
            // Still counted in `unknown_completions`
            tracing::debug!(seq = %self.seq, error = %err, "drain reported");
        }
        let result = self.rx.try_take()?;
        self.done = true;
        Some(result.map(|completed| self.collect(completed)))
    }

    /// Copy the transferred payload back into the caller's buffer.
    fn collect(&mut self, completed: Completed) -> CompletionInfo {
        if let (Some(buf), Some(data)) = (self.buf.as_deref_mut(), completed.data) {
            buf.as_mut_slice()[..self.len].copy_from_slice(&data.as_slice()[..self.len]);
        }
        completed.info
    }
}

impl<T: DeviceTransport> Drop for CommandHandle<'_, T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::debug!(seq = %self.seq, "handle dropped before waitdone, waiting");
        let ctrlr = self.ctrlr;
        if let Ok(completed) = block_on(&mut self.rx, || ctrlr.service()) {
            self.collect(completed);
        }
    }
}

impl<T: DeviceTransport> std::fmt::Debug for CommandHandle<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("seq", &self.seq)
            .field("opcode", &self.opcode)
            .field("done", &self.done)
            .finish()
    }
}
