//! NVMe admin command submission and completion tracking.
//!
//! This crate submits admin commands to an NVMe device through a pluggable
//! [`DeviceTransport`](nvme::DeviceTransport), matches completions that
//! arrive in any order back to their commands, and lets callers block on
//! individual commands with per-command timeouts. On top of that it
//! monitors long-running operations such as sanitize by polling the
//! device's status log.
//!
//! # Quick Start
//!
//! ```
//! use nvme_io::{Buffer, Result};
//! use nvme_io::nvme::{Controller, ControllerOpts};
//! use nvme_io::progress::{Outcome, PollPolicy, run_sanitize};
//! use nvme_io::sim::SimDevice;
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let ctrlr = Controller::new(SimDevice::new(), ControllerOpts::default())?;
//!
//!     let mut buf = Buffer::new()?;
//!     ctrlr.identify(&mut buf)?.waitdone()?;
//!     println!("vendor {:#06x}", buf.data(1, 0)?);
//!
//!     let policy = PollPolicy::default().interval(Duration::from_millis(1));
//!     let outcome = run_sanitize(&ctrlr, &mut buf, policy, |cur: u32, total: u32| {
//!         println!("sanitize {}/{}", cur, total);
//!     });
//!     assert!(matches!(outcome, Outcome::Done { .. }));
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`buffer`] - Aligned command payload buffers
//! - [`complete`] - Completion-to-future utilities
//! - [`error`] - Error types
//! - [`nvme`] - Controller, commands and the device transport seam
//! - [`poller`] - Optional background completion poller
//! - [`progress`] - Polling monitor for long-running operations
//! - [`sanitize`] - Sanitize status log decoding
//! - [`sim`] - In-memory simulated controller for testing

pub mod buffer;
pub mod complete;
pub mod error;
pub mod nvme;
pub mod poller;
pub mod progress;
pub mod sanitize;
pub mod sim;

// Re-exports
pub use buffer::{Buffer, Pattern};
pub use complete::{CompletionReceiver, CompletionSender, block_on, completion};
pub use error::{DeviceError, Error, Result};
pub use nvme::{CommandHandle, Controller, ControllerOpts, DeviceTransport};
pub use poller::Poller;
pub use progress::{Outcome, PollPolicy, ProgressMonitor, run_sanitize};
pub use sanitize::{SanitizeState, SanitizeStatus, ensure_sanitize_supported, sanitize_supported};
