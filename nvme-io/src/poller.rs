//! Background completion poller.
//!
//! Waiters drain the device themselves, so a poller is optional. Run one
//! when completions should be observed promptly even with nobody blocked in
//! [`waitdone`](crate::nvme::CommandHandle::waitdone), for example to keep
//! timeouts firing for handles that are only checked with `try_waitdone`.
//!
//! ```text
//! ┌──────────────────┐   process_completions()   ┌──────────────────┐
//! │ poller thread     ├─────────────────────────►│ Controller<T>    │
//! │  loop until stop  │   sleep(interval)         │  wakes waiters   │
//! └──────────────────┘                            └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use nvme_io::nvme::{Controller, ControllerOpts};
//! use nvme_io::poller::Poller;
//! use nvme_io::sim::SimDevice;
//!
//! let ctrlr = Arc::new(Controller::new(SimDevice::new(), ControllerOpts::default()).unwrap());
//! let poller = Poller::spawn(ctrlr.clone(), Duration::from_millis(1)).unwrap();
//!
//! ctrlr.format(1).unwrap().waitdone().unwrap();
//! poller.join().unwrap();
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::nvme::{Controller, DeviceTransport};

/// Handle to a running poller thread. Dropping it stops the thread.
pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<u64>>,
}

impl Poller {
    /// Start draining `ctrlr` every `interval` on a new thread.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the OS thread cannot be created.
    pub fn spawn<T>(ctrlr: Arc<Controller<T>>, interval: Duration) -> Result<Self>
    where
        T: DeviceTransport + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = thread::Builder::new()
            .name("nvme-poller".to_string())
            .spawn(move || {
                let mut resolved = 0u64;
                while !flag.load(Ordering::Acquire) {
                    match ctrlr.process_completions() {
                        Ok(0) => thread::sleep(interval),
                        Ok(n) => resolved += n as u64,
                        // Already logged and counted in `unknown_completions`
                        Err(_) => {}
                    }
                }
                tracing::debug!(resolved, "poller stopped");
                resolved
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit after its current pass.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Stop the thread and wait for it. Returns how many commands it resolved.
    ///
    /// # Errors
    ///
    /// [`Error::PollerPanic`] if the thread panicked.
    pub fn join(mut self) -> Result<u64> {
        self.stop();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| Error::PollerPanic),
            None => Ok(0),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
