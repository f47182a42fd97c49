//! In-process simulated controller.
//!
//! [`SimDevice`] implements [`DeviceTransport`](crate::nvme::DeviceTransport)
//! entirely in memory, so the command engine can be exercised without
//! hardware: identify data, the sanitize status log, format, sanitize and
//! firmware download/commit are answered, and completions can be held back
//! and released in any order to reproduce out-of-order devices.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐  submit_raw   ┌──────────────────────────┐
//! │  Controller<SimDevice>├──────────────►│  SimDevice               │
//! │                      │               │   execute against state  │
//! │                      │               │   (identify, logs, fw)   │
//! │                      │               │          ▼               │
//! │                      │ poll_         │   posted ◄── held ◄──┐   │
//! │                      │◄──────────────┤          release()   │   │
//! └──────────────────────┘ completions   │   swallowed (never) ─┘   │
//!                                        └──────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use nvme_io::Buffer;
//! use nvme_io::nvme::{Controller, ControllerOpts};
//! use nvme_io::sim::SimDevice;
//!
//! let ctrlr = Controller::new(SimDevice::new(), ControllerOpts::default()).unwrap();
//! ctrlr.transport().hold_completions(true);
//!
//! let mut a = ctrlr.format(1).unwrap();
//! let mut b = ctrlr.format(2).unwrap();
//!
//! // Device finishes the second command first
//! ctrlr.transport().release(&[b.seq(), a.seq()]);
//! assert_eq!(b.waitdone().unwrap().seq, b.seq());
//! assert_eq!(a.waitdone().unwrap().seq, a.seq());
//! ```

mod device;

pub use device::{DEFAULT_QUEUE_DEPTH, DEFAULT_SANICAP, SimDevice};
