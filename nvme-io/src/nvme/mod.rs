//! NVMe admin command engine.
//!
//! Submit admin commands against a device connection, match completions
//! that arrive in any order, and block on individual commands.
//!
//! # Architecture
//!
//! ```text
//!  caller threads          Controller<T>                     T: DeviceTransport
//! ┌──────────────┐ submit ┌──────────────────────┐ submit_raw ┌──────────────┐
//! │ Buffer       ├───────►│ CompletionQueue      ├───────────►│ device /     │
//! │ CommandHandle│        │  (outstanding by id) │            │ driver layer │
//! │   waitdone() │◄───────┤ CmdLog               │◄───────────┤              │
//! └──────────────┘ resolve└──────────────────────┘ poll_      └──────────────┘
//!                                                  completions
//! ```
//!
//! # Example
//!
//! ```
//! use nvme_io::Buffer;
//! use nvme_io::nvme::{Controller, ControllerOpts, LID_SANITIZE_STATUS};
//! use nvme_io::sim::SimDevice;
//!
//! let ctrlr = Controller::new(SimDevice::new(), ControllerOpts::default()).unwrap();
//! let mut buf = Buffer::new().unwrap();
//!
//! let info = ctrlr
//!     .getlogpage(LID_SANITIZE_STATUS, &mut buf, 20)
//!     .unwrap()
//!     .waitdone()
//!     .unwrap();
//! assert!(!info.status.is_error());
//! ```

mod cmdlog;
mod command;
mod controller;
mod opts;
mod queue;
mod transport;

pub use cmdlog::CmdLogEntry;
pub use command::{
    Command, CompletionInfo, LID_SANITIZE_STATUS, Opcode, SanitizeAction, SeqId, Status, cmd_name,
};
pub use controller::{CommandHandle, Controller, IDENTIFY_SIZE};
pub use opts::{
    ControllerOpts, DEFAULT_CMDLOG_DEPTH, DEFAULT_FW_CHUNK_SIZE, DEFAULT_POLL_INTERVAL_US,
    DEFAULT_TIMEOUT_MS,
};
pub use transport::{DeviceTransport, Payload, RawCompletion};
