//! Host-side control of the FPGA timetagger: the register command protocol,
//! a typed instrument facade with a register cache, and the background
//! readout worker that drains the bulk data endpoint.

pub mod readout;
pub mod regs;
#[cfg(any(test, feature = "mock"))]
pub mod testutil;
mod timetagger;
mod transport;

pub use readout::DataCallback;
pub use timetagger::Timetagger;
pub use transport::{
    CMD_ENDPOINT, DATA_ENDPOINT, PRODUCT_ID, REPLY_ENDPOINT, UsbTransport, VENDOR_ID,
    open_timetagger,
};

use thiserror::Error;

/// Largest USB bulk-transfer window the device will grant, in bytes.
pub const MAX_SEND_WINDOW_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("USB transfer failed: {0}")]
    Transport(#[from] rusb::Error),
    #[error("invalid register reply length {actual}, expected {expected}")]
    InvalidReplyLength { actual: usize, expected: usize },
    #[error("send window of {records} records exceeds {MAX_SEND_WINDOW_BYTES} bytes")]
    InvalidSendWindow { records: usize },
    #[error("timetagger not found (vid {vid:04x} pid {pid:04x})")]
    DeviceNotFound { vid: u16, pid: u16 },
}

pub type DeviceResult<T> = Result<T, DeviceError>;
