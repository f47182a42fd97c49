//! Integration tests for command submission and completion matching.
//!
//! All tests run against the in-memory `SimDevice`.

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use nvme_io::nvme::{
    Command, Controller, ControllerOpts, DeviceTransport, Opcode, Payload, RawCompletion, SeqId,
    Status,
};
use nvme_io::sim::SimDevice;
use nvme_io::{Buffer, DeviceError, Error};

fn controller() -> Controller<SimDevice> {
    Controller::new(SimDevice::new(), ControllerOpts::default()).unwrap()
}

fn controller_with(dev: SimDevice, opts: ControllerOpts) -> Controller<SimDevice> {
    Controller::new(dev, opts).unwrap()
}

// ============================================================================
// Completion matching
// ============================================================================

#[test]
fn test_out_of_order_completions() {
    let orders: [[usize; 3]; 4] = [[0, 1, 2], [2, 1, 0], [1, 2, 0], [2, 0, 1]];

    for order in orders {
        let ctrlr = controller();
        ctrlr.transport().hold_completions(true);

        let handles: Vec<_> = (1..=3).map(|ns| ctrlr.format(ns).unwrap()).collect();
        let seqs: Vec<SeqId> = handles.iter().map(|h| h.seq()).collect();
        assert_eq!(ctrlr.outstanding(), 3);

        thread::scope(|s| {
            let waiters: Vec<_> = handles
                .into_iter()
                .map(|mut h| s.spawn(move || (h.seq(), h.waitdone())))
                .collect();

            let release: Vec<SeqId> = order.iter().map(|&i| seqs[i]).collect();
            ctrlr.transport().release(&release);

            for waiter in waiters {
                let (seq, result) = waiter.join().unwrap();
                let info = result.unwrap();
                assert_eq!(info.seq, seq);
                assert_eq!(info.opcode, Opcode::FormatNvm);
            }
        });

        assert_eq!(ctrlr.outstanding(), 0);
        assert_eq!(ctrlr.transport().formatted(), vec![1, 2, 3]);
    }
}

/// Deterministic permutation of `items` for a given seed.
fn shuffle<T>(items: &mut [T], seed: u64) {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    for i in (1..items.len()).rev() {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        items.swap(i, j);
    }
}

#[test]
fn test_concurrent_submitters() {
    const THREADS: u32 = 8;

    for seed in 0..6 {
        let ctrlr = controller();
        ctrlr.transport().hold_completions(true);

        let seqs: Vec<SeqId> = thread::scope(|s| {
            let ctrlr = &ctrlr;
            let submitters: Vec<_> = (1..=THREADS)
                .map(|ns| {
                    s.spawn(move || {
                        let mut h = ctrlr.format(ns).unwrap();
                        let seq = h.seq();
                        let info = h.waitdone().unwrap();
                        assert_eq!(info.seq, seq);
                        seq
                    })
                })
                .collect();

            s.spawn(move || {
                let mut spins = 0;
                while ctrlr.transport().held().len() < THREADS as usize {
                    thread::sleep(Duration::from_millis(1));
                    spins += 1;
                    assert!(spins < 5000, "submitters never got their commands in");
                }
                assert_eq!(ctrlr.outstanding(), THREADS as usize);

                let mut order = ctrlr.transport().held();
                shuffle(&mut order, seed);
                // Release in two batches so some waiters resolve while
                // others are still parked
                let (first, rest) = order.split_at(order.len() / 2);
                ctrlr.transport().release(first);
                thread::sleep(Duration::from_millis(2));
                ctrlr.transport().release(rest);
            });

            submitters.into_iter().map(|t| t.join().unwrap()).collect()
        });

        let unique: HashSet<SeqId> = seqs.iter().copied().collect();
        assert_eq!(unique.len(), THREADS as usize);
        assert_eq!(ctrlr.outstanding(), 0);
        assert_eq!(ctrlr.unknown_completions(), 0);

        let mut formatted = ctrlr.transport().formatted();
        formatted.sort();
        assert_eq!(formatted, (1..=THREADS).collect::<Vec<_>>());
    }
}

#[test]
fn test_sequence_ids_unique() {
    let ctrlr = controller();
    let mut seen = Vec::new();
    for _ in 0..10 {
        let mut h = ctrlr.format(1).unwrap();
        seen.push(h.seq());
        h.waitdone().unwrap();
    }
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "ids not increasing: {:?}", seen);
}

#[test]
fn test_waitdone_twice() {
    let ctrlr = controller();
    let mut h = ctrlr.format(1).unwrap();
    assert!(h.waitdone().is_ok());

    let seq = h.seq();
    match h.waitdone() {
        Err(Error::AlreadyCompleted(s)) => assert_eq!(s, seq),
        other => panic!("expected AlreadyCompleted, got {:?}", other),
    }
}

#[test]
fn test_try_waitdone() {
    let ctrlr = controller();
    ctrlr.transport().hold_completions(true);

    let mut h = ctrlr.format(1).unwrap();
    assert!(h.try_waitdone().is_none());

    ctrlr.transport().release_all();
    assert!(matches!(h.try_waitdone(), Some(Ok(_))));
    assert!(matches!(h.try_waitdone(), Some(Err(Error::AlreadyCompleted(_)))));
}

#[test]
fn test_unknown_completion() {
    let ctrlr = controller();
    ctrlr.transport().post_raw(RawCompletion::success(SeqId(999), 0));

    match ctrlr.process_completions() {
        Err(Error::UnknownCompletion(seq)) => assert_eq!(seq, SeqId(999)),
        other => panic!("expected UnknownCompletion, got {:?}", other),
    }

    // Nothing was corrupted
    ctrlr.format(1).unwrap().waitdone().unwrap();
    assert_eq!(ctrlr.unknown_completions(), 1);
}

#[test]
fn test_unknown_completion_counted_by_waiters() {
    let ctrlr = controller();
    ctrlr.transport().post_raw(RawCompletion::success(SeqId(999), 0));

    // Drained while waiting on an unrelated command
    ctrlr.format(1).unwrap().waitdone().unwrap();
    assert_eq!(ctrlr.unknown_completions(), 1);

    ctrlr.transport().post_raw(RawCompletion::success(SeqId(1000), 0));
    let mut h = ctrlr.format(2).unwrap();
    while h.try_waitdone().is_none() {}
    assert_eq!(ctrlr.unknown_completions(), 2);
}

// ============================================================================
// Timeouts and aborts
// ============================================================================

#[test]
fn test_timeout() {
    let dev = SimDevice::new();
    dev.swallow(Opcode::Sanitize);
    let ctrlr = controller_with(
        dev,
        ControllerOpts {
            timeout_ms: Some(20),
            ..Default::default()
        },
    );

    let mut h = ctrlr.sanitize().unwrap();
    let seq = h.seq();
    let err = h.waitdone().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(ctrlr.outstanding(), 0);
    assert_eq!(ctrlr.transport().aborted(), vec![seq]);

    // A completion arriving after expiry is dropped, not reported as unknown
    ctrlr.transport().post_raw(RawCompletion::success(seq, 0));
    assert_eq!(ctrlr.process_completions().unwrap(), 0);
}

#[test]
fn test_per_command_timeout() {
    let ctrlr = controller();
    ctrlr.transport().swallow(Opcode::FormatNvm);

    let mut h = ctrlr
        .submit_with_timeout(
            Command::format(1, 0, 0),
            None,
            Duration::from_millis(10),
        )
        .unwrap();
    assert!(matches!(h.waitdone(), Err(Error::Device(DeviceError::Timeout))));
}

#[test]
fn test_unbounded_timeout() {
    let ctrlr = controller();
    ctrlr.transport().hold_completions(true);

    let mut h = ctrlr
        .submit_with_timeout(Command::format(1, 0, 0), None, Duration::MAX)
        .unwrap();
    assert_eq!(ctrlr.process_completions().unwrap(), 0);
    assert_eq!(ctrlr.outstanding(), 1);

    ctrlr.transport().release_all();
    assert!(h.waitdone().is_ok());
}

#[test]
fn test_shutdown_aborts_outstanding() {
    let ctrlr = controller();
    ctrlr.transport().hold_completions(true);

    let mut h = ctrlr.format(1).unwrap();
    ctrlr.shutdown();

    assert!(matches!(h.waitdone(), Err(Error::Device(DeviceError::Aborted))));
    assert_eq!(ctrlr.transport().aborted(), vec![h.seq()]);
    assert!(ctrlr.transport().held().is_empty());
}

#[test]
fn test_drop_handle_waits_for_completion() {
    let ctrlr = controller();
    ctrlr.transport().hold_completions(true);

    let mut buf = Buffer::new().unwrap();
    let h = ctrlr.identify(&mut buf).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            ctrlr.transport().release_all();
        });
        drop(h);
    });

    assert_eq!(ctrlr.outstanding(), 0);
    assert_eq!(buf.data(1, 0).unwrap(), 0x1b36);
}

// ============================================================================
// Status mapping and submission errors
// ============================================================================

#[test]
fn test_error_status() {
    let ctrlr = controller();
    let status = Status::new(0, 0x0a);
    ctrlr.transport().force_status(Opcode::FormatNvm, status);

    match ctrlr.format(1).unwrap().waitdone() {
        Err(Error::Device(DeviceError::StatusCode(s))) => assert_eq!(s, status),
        other => panic!("expected status error, got {:?}", other),
    }
}

#[test]
fn test_abort_status() {
    let ctrlr = controller();
    ctrlr
        .transport()
        .force_status(Opcode::FormatNvm, Status::new(0, 0x07));

    assert!(matches!(
        ctrlr.format(1).unwrap().waitdone(),
        Err(Error::Device(DeviceError::Aborted))
    ));
}

#[test]
fn test_queue_full() {
    let ctrlr = controller_with(SimDevice::new().with_queue_depth(2), ControllerOpts::default());
    ctrlr.transport().hold_completions(true);

    let mut a = ctrlr.format(1).unwrap();
    let mut b = ctrlr.format(2).unwrap();
    assert!(matches!(ctrlr.format(3), Err(Error::QueueFull { depth: 2 })));

    ctrlr.transport().release_all();
    a.waitdone().unwrap();
    b.waitdone().unwrap();

    ctrlr.format(3).unwrap().waitdone().unwrap();
}

#[test]
fn test_zero_queue_depth() {
    let result = Controller::new(SimDevice::new().with_queue_depth(0), ControllerOpts::default());
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_identify_short_buffer() {
    let ctrlr = controller();
    let mut buf = Buffer::allocate(512).unwrap();
    assert!(matches!(
        ctrlr.identify(&mut buf),
        Err(Error::InvalidArgument(_))
    ));
    assert!(ctrlr.transport().submitted().is_empty());
}

#[test]
fn test_getlogpage_transfer_size() {
    let ctrlr = controller();
    let mut buf = Buffer::new().unwrap();
    assert!(ctrlr.getlogpage(0x81, &mut buf, 0).is_err());
    assert!(ctrlr.getlogpage(0x81, &mut buf, 6).is_err());
    assert!(ctrlr.getlogpage(0x81, &mut buf, 8192).is_err());

    ctrlr.getlogpage(0x81, &mut buf, 20).unwrap().waitdone().unwrap();
    let (_, cmd) = ctrlr.transport().submitted()[0];
    assert_eq!(cmd.opcode, Opcode::GetLogPage);
    assert_eq!(cmd.cdw10 & 0xff, 0x81);
}

// ============================================================================
// Command log
// ============================================================================

#[test]
fn test_cmdlog() {
    let ctrlr = controller();
    let mut buf = Buffer::new().unwrap();

    ctrlr.format(7).unwrap().waitdone().unwrap();
    ctrlr.identify(&mut buf).unwrap().waitdone().unwrap();

    let log = ctrlr.cmdlog(10);
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].command.opcode, Opcode::Identify);
    assert_eq!(log[1].command.nsid, 7);
    assert!(matches!(log[0].outcome, Some(Ok(0))));
    assert!(log[1].to_string().contains("Format NVM"));
}

#[test]
fn test_cmdlog_disabled() {
    let ctrlr = controller_with(
        SimDevice::new(),
        ControllerOpts {
            cmdlog_depth: Some(0),
            ..Default::default()
        },
    );
    ctrlr.format(1).unwrap().waitdone().unwrap();
    assert!(ctrlr.cmdlog(10).is_empty());
}

// ============================================================================
// Payload ownership
// ============================================================================

/// Transport that only touches payloads when completions are polled, the
/// way a DMA engine finishing later would.
struct DeferredDevice {
    pending: Mutex<Vec<(SeqId, Option<Payload>)>>,
}

impl DeferredDevice {
    fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }
}

unsafe impl DeviceTransport for DeferredDevice {
    fn queue_depth(&self) -> usize {
        16
    }

    unsafe fn submit_raw(
        &self,
        seq: SeqId,
        _cmd: &Command,
        payload: Option<Payload>,
    ) -> nvme_io::Result<()> {
        self.pending.lock().unwrap().push((seq, payload));
        Ok(())
    }

    fn poll_completions(&self, max: usize) -> Vec<RawCompletion> {
        let mut pending = self.pending.lock().unwrap();
        let n = max.min(pending.len());
        pending
            .drain(..n)
            .map(|(seq, payload)| {
                if let Some(payload) = payload {
                    unsafe { payload.as_mut_slice().fill(0xa5) };
                }
                RawCompletion::success(seq, 0)
            })
            .collect()
    }

    fn abort(&self, seq: SeqId) {
        self.pending.lock().unwrap().retain(|(s, _)| *s != seq);
    }
}

#[test]
fn test_result_copied_into_buffer() {
    let ctrlr = Controller::new(DeferredDevice::new(), ControllerOpts::default()).unwrap();
    let mut buf = Buffer::new().unwrap();

    ctrlr
        .submit(Command::identify_controller(), Some(&mut buf))
        .unwrap()
        .waitdone()
        .unwrap();
    assert!(buf.as_slice().iter().all(|b| *b == 0xa5));
}

#[test]
fn test_forgotten_handle_keeps_payload_alive() {
    let ctrlr = Controller::new(DeferredDevice::new(), ControllerOpts::default()).unwrap();

    let mut buf = Buffer::new().unwrap();
    let h = ctrlr.submit(Command::identify_controller(), Some(&mut buf)).unwrap();
    std::mem::forget(h);
    drop(buf);
    assert_eq!(ctrlr.outstanding(), 1);

    // Likely to land where the released buffer was
    let fresh = Buffer::new().unwrap();

    // The device writes now, into memory the controller still owns
    assert_eq!(ctrlr.process_completions().unwrap(), 1);
    assert_eq!(ctrlr.outstanding(), 0);
    assert!(fresh.as_slice().iter().all(|b| *b == 0));
}

#[test]
fn test_forgotten_handle_payload_released_after_abort() {
    let ctrlr = Controller::new(DeferredDevice::new(), ControllerOpts::default()).unwrap();

    let mut buf = Buffer::new().unwrap();
    std::mem::forget(ctrlr.submit(Command::identify_controller(), Some(&mut buf)).unwrap());
    drop(buf);

    ctrlr.shutdown();
    assert_eq!(ctrlr.outstanding(), 0);
    assert!(ctrlr.transport().pending.lock().unwrap().is_empty());
}
