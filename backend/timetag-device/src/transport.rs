use crate::{DeviceError, DeviceResult};
use std::time::Duration;

pub const VENDOR_ID: u16 = 0x04B4;
pub const PRODUCT_ID: u16 = 0x1004;

/// Register command frames, host to device.
pub const CMD_ENDPOINT: u8 = 0x02;
/// Bulk record stream, device to host.
pub const DATA_ENDPOINT: u8 = 0x86;
/// Register command replies, device to host.
pub const REPLY_ENDPOINT: u8 = 0x88;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);

/// The blocking USB operations the timetagger protocol is built on.
///
/// Implemented for the rusb device handle; tests substitute scripted mocks.
pub trait UsbTransport: Send {
    fn claim(&mut self) -> rusb::Result<()>;

    fn release(&mut self) -> rusb::Result<()>;

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    /// Zero-length vendor control transfer, host to device.
    fn vendor_request(&self, request: u8, value: u16) -> rusb::Result<()>;
}

impl<C: rusb::UsbContext> UsbTransport for rusb::DeviceHandle<C> {
    fn claim(&mut self) -> rusb::Result<()> {
        self.claim_interface(0)
    }

    fn release(&mut self) -> rusb::Result<()> {
        self.release_interface(0)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.write_bulk(endpoint, data, timeout)
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.read_bulk(endpoint, buf, timeout)
    }

    fn vendor_request(&self, request: u8, value: u16) -> rusb::Result<()> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        self.write_control(request_type, request, value, 0, &[], CONTROL_TIMEOUT)?;
        Ok(())
    }
}

/// Opens the first attached timetagger by vendor/product id.
pub fn open_timetagger() -> DeviceResult<rusb::DeviceHandle<rusb::GlobalContext>> {
    rusb::open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
        .ok_or(DeviceError::DeviceNotFound { vid: VENDOR_ID, pid: PRODUCT_ID })
}
