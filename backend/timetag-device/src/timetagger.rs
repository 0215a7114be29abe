use crate::readout::{self, DataCallback, ReadoutHandle};
use crate::regs::{self, RegisterCache};
use crate::transport::{CMD_ENDPOINT, REPLY_ENDPOINT, UsbTransport};
use crate::{DeviceError, DeviceResult, MAX_SEND_WINDOW_BYTES};
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const REG_CMD_MAGIC: u8 = 0xAA;
const REG_CMD_TIMEOUT: Duration = Duration::from_millis(500);
const REQ_SET_SEND_WINDOW: u8 = 0x01;
const REQ_FLUSH_FX2_FIFO: u8 = 0x02;
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State shared between the facade and the readout worker.
///
/// `device` is the device mutex: it serializes register commands against each
/// other and against the worker's bulk reads. `needs_flush` is set by
/// [`Timetagger::reset`] and cleared by the worker once it has drained the
/// data and reply endpoints, which only it may touch.
pub(crate) struct DeviceCore<T> {
    pub(crate) device: Mutex<DeviceInner<T>>,
    pub(crate) needs_flush: AtomicBool,
    send_window: AtomicUsize,
}

pub(crate) struct DeviceInner<T> {
    pub(crate) transport: T,
    regs: RegisterCache,
}

impl<T: UsbTransport> DeviceInner<T> {
    /// Sends one register command frame and awaits its 4-byte reply. The
    /// caller holds the device mutex, so command and reply stay paired.
    fn reg_cmd(&mut self, write: bool, reg: u16, value: u32) -> DeviceResult<u32> {
        let frame = [
            REG_CMD_MAGIC,
            u8::from(write),
            reg as u8,
            (reg >> 8) as u8,
            value as u8,
            (value >> 8) as u8,
            (value >> 16) as u8,
            (value >> 24) as u8,
        ];
        self.transport.bulk_out(CMD_ENDPOINT, &frame, REG_CMD_TIMEOUT)?;

        let mut reply = [0; 4];
        let actual = self.transport.bulk_in(REPLY_ENDPOINT, &mut reply, REG_CMD_TIMEOUT)?;
        if actual != reply.len() {
            return Err(DeviceError::InvalidReplyLength { actual, expected: reply.len() });
        }

        let value = u32::from_le_bytes(reply);
        self.regs.set(reg, value);
        Ok(value)
    }
}

impl<T: UsbTransport> DeviceCore<T> {
    pub(crate) fn read_reg(&self, reg: u16) -> DeviceResult<u32> {
        self.device.lock().unwrap().reg_cmd(false, reg, 0)
    }

    pub(crate) fn write_reg(&self, reg: u16, value: u32) -> DeviceResult<u32> {
        self.device.lock().unwrap().reg_cmd(true, reg, value)
    }

    /// Read-modify-write against the cached value, atomically under the
    /// device mutex.
    fn update_reg(&self, reg: u16, f: impl FnOnce(u32) -> u32) -> DeviceResult<u32> {
        let mut inner = self.device.lock().unwrap();
        let current = inner.regs.get(reg);
        inner.reg_cmd(true, reg, f(current))
    }

    fn set_send_window(&self, records: usize) -> DeviceResult<()> {
        let bytes = records * timetag_record::RECORD_LENGTH;
        if bytes > MAX_SEND_WINDOW_BYTES {
            return Err(DeviceError::InvalidSendWindow { records });
        }

        self.device.lock().unwrap().transport.vendor_request(REQ_SET_SEND_WINDOW, bytes as u16)?;
        self.send_window.store(records, Ordering::Relaxed);
        Ok(())
    }

    fn flush_fx2_fifo(&self) -> DeviceResult<()> {
        self.device.lock().unwrap().transport.vendor_request(REQ_FLUSH_FX2_FIFO, 0)?;
        Ok(())
    }
}

/// Typed operations on the timetagger, built on the register protocol.
///
/// Construction claims the device, programs safe defaults, and fills the
/// register cache; dropping the facade stops the readout worker and releases
/// the claim.
pub struct Timetagger<T: UsbTransport> {
    core: Arc<DeviceCore<T>>,
    readout: Mutex<Option<ReadoutHandle>>,
}

impl<T: UsbTransport + 'static> Timetagger<T> {
    pub fn new(mut transport: T) -> DeviceResult<Self> {
        transport.claim()?;

        let core = Arc::new(DeviceCore {
            device: Mutex::new(DeviceInner { transport, regs: RegisterCache::new() }),
            needs_flush: AtomicBool::new(false),
            send_window: AtomicUsize::new(0),
        });

        core.set_send_window(MAX_SEND_WINDOW_BYTES / timetag_record::RECORD_LENGTH)?;

        // Clearing register 0 un-jams a command parser left mid-frame by a
        // previous host process.
        core.write_reg(0x00, 0x00)?;
        core.flush_fx2_fifo()?;
        core.write_reg(regs::CAPCTL, 0x00)?;
        core.write_reg(regs::STROBE, 0x0F)?;
        core.write_reg(regs::DELTA, 0x0F)?;

        for reg in 1..regs::NUM_REGISTERS as u16 {
            core.read_reg(reg)?;
        }

        Ok(Self { core, readout: Mutex::new(None) })
    }

    /// Spawns the readout worker. Each buffer drained from the data endpoint
    /// is handed to `callback`.
    pub fn start_readout(&self, callback: DataCallback) {
        let mut readout = self.readout.lock().unwrap();
        assert!(readout.is_none(), "readout worker already running");
        *readout = Some(readout::spawn(Arc::clone(&self.core), callback));
    }

    pub fn stop_readout(&self) {
        if let Some(handle) = self.readout.lock().unwrap().take() {
            handle.stop();
        }
    }

    /// Enables capture and the record counter. Blocks until any pending
    /// endpoint drain has completed; capture must not restart while stale
    /// records are still being discarded.
    pub fn start_capture(&self) -> DeviceResult<()> {
        while self.core.needs_flush.load(Ordering::Acquire) {
            thread::sleep(FLUSH_POLL_INTERVAL);
        }
        self.core
            .update_reg(regs::CAPCTL, |v| v | regs::CAPCTL_CAPTURE_EN | regs::CAPCTL_COUNT_EN)?;
        Ok(())
    }

    pub fn stop_capture(&self) -> DeviceResult<()> {
        self.core.update_reg(regs::CAPCTL, |v| v & !regs::CAPCTL_CAPTURE_EN)?;
        Ok(())
    }

    /// Pulses the counter reset with counting disabled.
    pub fn reset_counter(&self) -> DeviceResult<()> {
        self.core
            .update_reg(regs::CAPCTL, |v| (v | regs::CAPCTL_RESET_CNT) & !regs::CAPCTL_COUNT_EN)?;
        self.core.update_reg(regs::CAPCTL, |v| v & !regs::CAPCTL_RESET_CNT)?;
        Ok(())
    }

    /// Pulses the on-device record FIFO clear.
    pub fn flush_fifo(&self) -> DeviceResult<()> {
        self.core.update_reg(regs::REC_FIFO, |v| v | regs::REC_FIFO_CLEAR)?;
        self.core.update_reg(regs::REC_FIFO, |v| v & !regs::REC_FIFO_CLEAR)?;
        Ok(())
    }

    /// Stops capture and discards everything in flight: the FX2 FIFO is
    /// flushed immediately, and the readout worker drains both endpoints
    /// before its next delivery.
    pub fn reset(&self) -> DeviceResult<()> {
        self.stop_capture()?;
        self.core.flush_fx2_fifo()?;
        self.core.needs_flush.store(true, Ordering::Release);
        debug!("reset requested; endpoint drain deferred to readout worker");
        Ok(())
    }

    pub fn set_send_window(&self, records: usize) -> DeviceResult<()> {
        self.core.set_send_window(records)
    }

    /// Current send window, in records.
    #[must_use]
    pub fn send_window(&self) -> usize {
        self.core.send_window.load(Ordering::Relaxed)
    }

    /// Whether a reset-triggered endpoint drain is still outstanding.
    #[must_use]
    pub fn flush_pending(&self) -> bool {
        self.core.needs_flush.load(Ordering::Acquire)
    }

    pub fn capture_enabled(&self) -> DeviceResult<bool> {
        Ok(self.core.read_reg(regs::CAPCTL)? & regs::CAPCTL_CAPTURE_EN != 0)
    }

    pub fn version(&self) -> DeviceResult<u32> {
        self.core.read_reg(regs::VERSION)
    }

    pub fn clockrate(&self) -> DeviceResult<u32> {
        self.core.read_reg(regs::CLOCKRATE)
    }

    pub fn record_count(&self) -> DeviceResult<u32> {
        self.core.read_reg(regs::REC_COUNTER)
    }

    pub fn lost_record_count(&self) -> DeviceResult<u32> {
        self.core.read_reg(regs::LOST_COUNTER)
    }

    pub fn set_strobe_operate(&self, channel: usize, enabled: bool) -> DeviceResult<()> {
        self.core.update_reg(regs::STROBE, |v| set_bit(v, channel, enabled))?;
        Ok(())
    }

    pub fn strobe_operate(&self, channel: usize) -> DeviceResult<bool> {
        Ok(self.core.read_reg(regs::STROBE)? & (1 << channel) != 0)
    }

    pub fn set_delta_operate(&self, channel: usize, enabled: bool) -> DeviceResult<()> {
        self.core.update_reg(regs::DELTA, |v| set_bit(v, channel, enabled))?;
        Ok(())
    }

    pub fn delta_operate(&self, channel: usize) -> DeviceResult<bool> {
        Ok(self.core.read_reg(regs::DELTA)? & (1 << channel) != 0)
    }

    pub fn seq_clockrate(&self) -> DeviceResult<u32> {
        self.core.read_reg(regs::SEQ_CLOCKRATE)
    }

    pub fn set_global_sequencer_operate(&self, operate: bool) -> DeviceResult<()> {
        self.core.update_reg(regs::SEQ, |v| {
            if operate { v | regs::SEQ_OPERATE } else { v & !regs::SEQ_OPERATE }
        })?;
        Ok(())
    }

    pub fn global_sequencer_operate(&self) -> DeviceResult<bool> {
        Ok(self.core.read_reg(regs::SEQ)? & regs::SEQ_OPERATE != 0)
    }

    /// Pulses the sequencer reset, leaving the sequencer stopped.
    pub fn reset_sequencer(&self) -> DeviceResult<()> {
        self.core.write_reg(regs::SEQ, regs::SEQ_RESET)?;
        self.core.write_reg(regs::SEQ, 0x00)?;
        Ok(())
    }

    pub fn set_seqchan_operate(&self, channel: usize, operate: bool) -> DeviceResult<()> {
        self.core.update_reg(regs::seqchan_base(channel), |v| {
            if operate { v | regs::SEQCHAN_OPERATE } else { v & !regs::SEQCHAN_OPERATE }
        })?;
        Ok(())
    }

    pub fn seqchan_operate(&self, channel: usize) -> DeviceResult<bool> {
        Ok(self.core.read_reg(regs::seqchan_base(channel))? & regs::SEQCHAN_OPERATE != 0)
    }

    pub fn set_seqchan_initial_state(&self, channel: usize, state: bool) -> DeviceResult<()> {
        self.core.update_reg(regs::seqchan_base(channel), |v| {
            if state { v | regs::SEQCHAN_INITIAL_STATE } else { v & !regs::SEQCHAN_INITIAL_STATE }
        })?;
        Ok(())
    }

    pub fn seqchan_initial_state(&self, channel: usize) -> DeviceResult<bool> {
        Ok(self.core.read_reg(regs::seqchan_base(channel))? & regs::SEQCHAN_INITIAL_STATE != 0)
    }

    pub fn set_seqchan_initial_count(&self, channel: usize, count: u32) -> DeviceResult<()> {
        self.core
            .write_reg(regs::seqchan_base(channel) + regs::SEQCHAN_INITIAL_COUNT_OFFSET, count)?;
        Ok(())
    }

    pub fn seqchan_initial_count(&self, channel: usize) -> DeviceResult<u32> {
        self.core.read_reg(regs::seqchan_base(channel) + regs::SEQCHAN_INITIAL_COUNT_OFFSET)
    }

    pub fn set_seqchan_low_count(&self, channel: usize, count: u32) -> DeviceResult<()> {
        self.core.write_reg(regs::seqchan_base(channel) + regs::SEQCHAN_LOW_COUNT_OFFSET, count)?;
        Ok(())
    }

    pub fn seqchan_low_count(&self, channel: usize) -> DeviceResult<u32> {
        self.core.read_reg(regs::seqchan_base(channel) + regs::SEQCHAN_LOW_COUNT_OFFSET)
    }

    pub fn set_seqchan_high_count(&self, channel: usize, count: u32) -> DeviceResult<()> {
        self.core.write_reg(regs::seqchan_base(channel) + regs::SEQCHAN_HIGH_COUNT_OFFSET, count)?;
        Ok(())
    }

    pub fn seqchan_high_count(&self, channel: usize) -> DeviceResult<u32> {
        self.core.read_reg(regs::seqchan_base(channel) + regs::SEQCHAN_HIGH_COUNT_OFFSET)
    }
}

impl<T: UsbTransport> Drop for Timetagger<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.readout.lock().unwrap().take() {
            handle.stop();
        }
        if let Ok(mut inner) = self.core.device.lock() {
            let _ = inner.transport.release();
        }
    }
}

fn set_bit(value: u32, bit: usize, set: bool) -> u32 {
    if set { value | (1 << bit) } else { value & !(1 << bit) }
}
