//! Background worker that owns the bulk data endpoint.
//!
//! The worker loops on 510-byte reads (the largest whole-record multiple
//! under the 512-byte send window) and hands every non-empty buffer to the
//! data callback. Timeouts are part of normal operation: they bound each
//! blocking read so the worker can observe the stop flag and the deferred
//! drain request between transfers.

use crate::timetagger::DeviceCore;
use crate::transport::{DATA_ENDPOINT, REPLY_ENDPOINT, UsbTransport};
use log::{debug, error, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receives each buffer drained from the data endpoint, in production order.
pub type DataCallback = Box<dyn FnMut(&[u8]) + Send>;

const READ_LENGTH: usize = 510;
const DATA_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_READ_LENGTH: usize = 512;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
const DRAIN_SETTLE: Duration = Duration::from_millis(10);
const FAILURE_BUDGET: u32 = 1000;

pub(crate) struct ReadoutHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ReadoutHandle {
    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.thread.join();
    }
}

pub(crate) fn spawn<T: UsbTransport + 'static>(
    core: Arc<DeviceCore<T>>,
    callback: DataCallback,
) -> ReadoutHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let thread = thread::Builder::new()
        .name("timetag-readout".into())
        .spawn(move || run(&core, &stop_flag, callback))
        .expect("failed to spawn readout thread");

    ReadoutHandle { stop, thread }
}

fn run<T: UsbTransport>(core: &DeviceCore<T>, stop: &AtomicBool, mut callback: DataCallback) {
    request_realtime_priority();

    let mut buffer = [0; READ_LENGTH];
    let mut failures = 0;
    while !stop.load(Ordering::Relaxed) {
        if core.needs_flush.load(Ordering::Acquire) {
            drain_endpoints(core);
            core.needs_flush.store(false, Ordering::Release);
        }

        // Hold the device mutex only for the transfer itself so register
        // commands can interleave between reads.
        let result = {
            let inner = core.device.lock().unwrap();
            inner.transport.bulk_in(DATA_ENDPOINT, &mut buffer, DATA_TIMEOUT)
        };

        match result {
            Ok(0) => {}
            Ok(actual) => {
                if actual % timetag_record::RECORD_LENGTH != 0 {
                    warn!("received partial record ({actual} bytes)");
                }
                callback(&buffer[..actual]);
            }
            Err(rusb::Error::Timeout) => {}
            Err(rusb::Error::Overflow) => {
                // libusb reports overflow without a byte count; the request
                // was buffer-sized, so deliver the whole buffer.
                warn!("overflow on data endpoint");
                callback(&buffer[..]);
            }
            Err(e) => {
                failures += 1;
                warn!("data transfer failed: {e}");
                if failures > FAILURE_BUDGET {
                    error!("data endpoint failure budget exhausted, stopping readout");
                    break;
                }
            }
        }
    }
}

/// Discards everything buffered on the data endpoint, then any stale command
/// replies, sleeping between attempts so the firmware can finish refilling
/// its FIFOs. Done when a pass returns no bytes.
fn drain_endpoints<T: UsbTransport>(core: &DeviceCore<T>) {
    debug!("draining data and reply endpoints");
    let mut buffer = [0; DRAIN_READ_LENGTH];
    for endpoint in [DATA_ENDPOINT, REPLY_ENDPOINT] {
        loop {
            thread::sleep(DRAIN_SETTLE);
            let result = {
                let inner = core.device.lock().unwrap();
                inner.transport.bulk_in(endpoint, &mut buffer, DRAIN_TIMEOUT)
            };
            match result {
                Ok(actual) if actual > 0 => {}
                _ => break,
            }
        }
    }
}

/// Best-effort request for real-time FIFO scheduling on the readout thread.
fn request_realtime_priority() {
    let param = libc::sched_param { sched_priority: 1 };
    // SAFETY: param is a valid sched_param and pid 0 targets the calling thread
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        debug!("real-time scheduling unavailable, readout stays at normal priority");
    }
}
