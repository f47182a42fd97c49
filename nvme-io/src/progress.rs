//! Long-running operation monitoring.
//!
//! Some admin commands (sanitize being the main one) complete as soon as the
//! device accepts them; the operation itself keeps running and reports its
//! progress through a log page. [`ProgressMonitor`] polls such a status
//! source until it reaches a terminal state.
//!
//! ```text
//!  Started ──► Polling ──┬──► Done
//!     │          ▲  │    └──► Failed
//!     │          └──┘
//!     └──► NotSupported
//! ```
//!
//! How the monitor waits between polls is a [`Pacer`]; where progress goes
//! is a [`ProgressSink`]. Both are plain traits so a caller can drive the
//! loop from a timer, a UI, or a test script.
//!
//! # Example
//!
//! ```
//! use nvme_io::Buffer;
//! use nvme_io::nvme::{Controller, ControllerOpts};
//! use nvme_io::progress::{Outcome, PollPolicy, run_sanitize};
//! use nvme_io::sim::SimDevice;
//! use std::time::Duration;
//!
//! let ctrlr = Controller::new(SimDevice::new(), ControllerOpts::default()).unwrap();
//! let mut buf = Buffer::new().unwrap();
//!
//! let policy = PollPolicy::default().interval(Duration::from_millis(1));
//! let outcome = run_sanitize(&ctrlr, &mut buf, policy, |current: u32, total: u32| {
//!     println!("sanitize {}/{}", current, total);
//! });
//! assert!(matches!(outcome, Outcome::Done { .. }));
//! ```

use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::Buffer;
use crate::error::{DeviceError, Error, Result};
use crate::nvme::{Controller, DeviceTransport, LID_SANITIZE_STATUS};
use crate::sanitize::{self, SANITIZE_LOG, SanitizeLogLayout, SanitizeState, SanitizeStatus};

/// Default time between status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Receives progress once per polling iteration.
pub trait ProgressSink {
    fn report(&mut self, current: u32, total: u32);
}

impl<F: FnMut(u32, u32)> ProgressSink for F {
    fn report(&mut self, current: u32, total: u32) {
        self(current, total)
    }
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&mut self, _current: u32, _total: u32) {}
}

/// Waits between two polling iterations.
pub trait Pacer {
    fn pause(&mut self, interval: Duration);
}

/// Blocks the calling thread for the interval.
#[derive(Debug, Default, Clone, Copy)]
pub struct SleepPacer;

impl Pacer for SleepPacer {
    fn pause(&mut self, interval: Duration) {
        thread::sleep(interval);
    }
}

impl<F: FnMut(Duration)> Pacer for F {
    fn pause(&mut self, interval: Duration) {
        self(interval)
    }
}

/// Polling schedule.
#[derive(Debug, Clone)]
pub struct PollPolicy<P = SleepPacer> {
    pub interval: Duration,
    /// Give up (as a timeout) once this much time has passed since start
    pub deadline: Option<Duration>,
    pub pacer: P,
}

impl Default for PollPolicy<SleepPacer> {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
            pacer: SleepPacer,
        }
    }
}

impl<P: Pacer> PollPolicy<P> {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Swap the waiting strategy.
    pub fn pacer<Q: Pacer>(self, pacer: Q) -> PollPolicy<Q> {
        PollPolicy {
            interval: self.interval,
            deadline: self.deadline,
            pacer,
        }
    }
}

/// Source of decoded status, queried once per iteration.
pub trait StatusQuery {
    fn query(&mut self) -> Result<SanitizeStatus>;
}

impl<F: FnMut() -> Result<SanitizeStatus>> StatusQuery for F {
    fn query(&mut self) -> Result<SanitizeStatus> {
        self()
    }
}

/// Reads the sanitize status log from a controller into a shared buffer.
pub struct ControllerStatusQuery<'a, T: DeviceTransport> {
    ctrlr: &'a Controller<T>,
    buf: &'a mut Buffer,
    layout: SanitizeLogLayout,
}

impl<'a, T: DeviceTransport> ControllerStatusQuery<'a, T> {
    pub fn new(ctrlr: &'a Controller<T>, buf: &'a mut Buffer) -> Self {
        Self::with_layout(ctrlr, buf, SANITIZE_LOG)
    }

    pub fn with_layout(
        ctrlr: &'a Controller<T>,
        buf: &'a mut Buffer,
        layout: SanitizeLogLayout,
    ) -> Self {
        Self { ctrlr, buf, layout }
    }
}

impl<T: DeviceTransport> StatusQuery for ControllerStatusQuery<'_, T> {
    fn query(&mut self) -> Result<SanitizeStatus> {
        self.ctrlr
            .getlogpage(LID_SANITIZE_STATUS, self.buf, self.layout.transfer_size)?
            .waitdone()?;
        SanitizeStatus::decode_with(self.buf, &self.layout)
    }
}

/// Monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Started,
    Polling,
    Done,
    Failed,
    NotSupported,
}

/// Why a monitored operation failed.
#[derive(Debug)]
pub enum FailReason {
    /// The device reported the operation itself failed
    Operation(SanitizeStatus),
    /// Querying or decoding the status failed
    Error(Error),
}

/// Result of a monitor run.
#[derive(Debug)]
pub enum Outcome {
    Done { polls: u32 },
    NotSupported,
    Failed(FailReason),
}

/// Polls a status source until the operation leaves the in-progress state.
pub struct ProgressMonitor<S, P = SleepPacer> {
    policy: PollPolicy<P>,
    sink: S,
    state: MonitorState,
    polls: u32,
}

impl<S: ProgressSink, P: Pacer> ProgressMonitor<S, P> {
    pub fn new(policy: PollPolicy<P>, sink: S) -> Self {
        Self {
            policy,
            sink,
            state: MonitorState::Started,
            polls: 0,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Status queries issued by the last run.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Poll `query` to completion.
    ///
    /// A first status of [`SanitizeState::NeverSanitized`] ends the run as
    /// [`Outcome::NotSupported`] without reporting progress. Every other
    /// status, including the terminal one, is reported to the sink. Query
    /// and decode errors end the run as [`Outcome::Failed`]; nothing is
    /// retried.
    pub fn run(&mut self, query: &mut impl StatusQuery) -> Outcome {
        self.state = MonitorState::Started;
        self.polls = 0;
        let start = Instant::now();

        loop {
            let status = match query.query() {
                Ok(status) => status,
                Err(err) => return self.fail(FailReason::Error(err)),
            };
            self.polls += 1;

            if self.polls == 1 && status.state == SanitizeState::NeverSanitized {
                tracing::info!("no sanitize operation reported, not supported");
                self.state = MonitorState::NotSupported;
                return Outcome::NotSupported;
            }

            self.state = MonitorState::Polling;
            self.sink.report(status.percent(), 100);
            tracing::trace!(
                poll = self.polls,
                state = ?status.state,
                percent = status.percent(),
                "progress"
            );

            if status.is_terminal() {
                return match status.state {
                    SanitizeState::Completed => {
                        tracing::info!(
                            polls = self.polls,
                            elapsed = ?start.elapsed(),
                            "operation completed"
                        );
                        self.state = MonitorState::Done;
                        Outcome::Done { polls: self.polls }
                    }
                    _ => self.fail(FailReason::Operation(status)),
                };
            }

            if let Some(deadline) = self.policy.deadline
                && start.elapsed() >= deadline
            {
                return self.fail(FailReason::Error(DeviceError::Timeout.into()));
            }

            self.policy.pacer.pause(self.policy.interval);
        }
    }

    fn fail(&mut self, reason: FailReason) -> Outcome {
        tracing::warn!(polls = self.polls, ?reason, "operation failed");
        self.state = MonitorState::Failed;
        Outcome::Failed(reason)
    }
}

/// Full sanitize flow against a controller.
///
/// Checks the sanitize capability via identify, starts a block-erase
/// sanitize, then monitors the sanitize status log in `buf` until done.
pub fn run_sanitize<T, P, S>(
    ctrlr: &Controller<T>,
    buf: &mut Buffer,
    policy: PollPolicy<P>,
    sink: S,
) -> Outcome
where
    T: DeviceTransport,
    P: Pacer,
    S: ProgressSink,
{
    let mut monitor = ProgressMonitor::new(policy, sink);

    match sanitize::ensure_sanitize_supported(ctrlr, buf) {
        Ok(()) => {}
        Err(Error::NotSupported(what)) => {
            tracing::warn!(what, "operation is not supported");
            monitor.state = MonitorState::NotSupported;
            return Outcome::NotSupported;
        }
        Err(err) => return monitor.fail(FailReason::Error(err)),
    }

    let started = ctrlr.sanitize().and_then(|mut handle| handle.waitdone());
    if let Err(err) = started {
        return monitor.fail(FailReason::Error(err));
    }
    tracing::info!("sanitize started");

    monitor.run(&mut ControllerStatusQuery::new(ctrlr, buf))
}
