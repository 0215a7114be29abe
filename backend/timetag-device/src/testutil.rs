//! Scripted in-memory transport for exercising the protocol, facade, and
//! readout worker without hardware.

use crate::transport::{CMD_ENDPOINT, DATA_ENDPOINT, REPLY_ENDPOINT, UsbTransport};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    pub state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub claimed: bool,
    pub released: bool,
    /// Every 8-byte command frame sent to the command endpoint, in order.
    pub cmd_frames: Vec<[u8; 8]>,
    /// `(request, value)` pairs from vendor control transfers, in order.
    pub vendor_requests: Vec<(u8, u16)>,
    /// Simulated device registers; writes land here and replies echo them.
    pub registers: HashMap<u16, u32>,
    /// Replies consumed ahead of the auto-generated one, for fault injection.
    pub scripted_replies: VecDeque<Vec<u8>>,
    pending_reply: Option<[u8; 4]>,
    pub data_queue: VecDeque<Vec<u8>>,
    /// When set, every data-endpoint read fails with this error.
    pub data_error: Option<rusb::Error>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&self, reg: u16, value: u32) {
        self.state.lock().unwrap().registers.insert(reg, value);
    }

    pub fn register(&self, reg: u16) -> u32 {
        self.state.lock().unwrap().registers.get(&reg).copied().unwrap_or(0)
    }

    pub fn push_data(&self, bytes: &[u8]) {
        self.state.lock().unwrap().data_queue.push_back(bytes.to_vec());
    }

    pub fn script_reply(&self, bytes: &[u8]) {
        self.state.lock().unwrap().scripted_replies.push_back(bytes.to_vec());
    }

    /// Parsed `(write, reg, value)` triples of all command frames so far.
    pub fn parsed_frames(&self) -> Vec<(bool, u16, u32)> {
        self.state.lock().unwrap().cmd_frames.iter().map(|frame| parse_frame(*frame)).collect()
    }

    /// Values written to `reg`, in order.
    pub fn writes_to(&self, reg: u16) -> Vec<u32> {
        self.parsed_frames()
            .into_iter()
            .filter(|&(write, r, _)| write && r == reg)
            .map(|(_, _, value)| value)
            .collect()
    }
}

fn parse_frame(frame: [u8; 8]) -> (bool, u16, u32) {
    let write = frame[1] != 0;
    let reg = u16::from_le_bytes([frame[2], frame[3]]);
    let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    (write, reg, value)
}

impl UsbTransport for MockTransport {
    fn claim(&mut self) -> rusb::Result<()> {
        self.state.lock().unwrap().claimed = true;
        Ok(())
    }

    fn release(&mut self) -> rusb::Result<()> {
        self.state.lock().unwrap().released = true;
        Ok(())
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        assert_eq!(endpoint, CMD_ENDPOINT, "unexpected out endpoint {endpoint:#04x}");
        let frame: [u8; 8] = data.try_into().expect("command frames are 8 bytes");

        let mut state = self.state.lock().unwrap();
        state.cmd_frames.push(frame);

        let (write, reg, value) = parse_frame(frame);
        if write {
            state.registers.insert(reg, value);
        }
        let current = state.registers.get(&reg).copied().unwrap_or(0);
        state.pending_reply = Some(current.to_le_bytes());
        Ok(data.len())
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> rusb::Result<usize> {
        let mut state = self.state.lock().unwrap();
        match endpoint {
            REPLY_ENDPOINT => {
                if let Some(reply) = state.scripted_replies.pop_front() {
                    buf[..reply.len()].copy_from_slice(&reply);
                    return Ok(reply.len());
                }
                if let Some(reply) = state.pending_reply.take() {
                    buf[..reply.len()].copy_from_slice(&reply);
                    return Ok(reply.len());
                }
                Err(rusb::Error::Timeout)
            }
            DATA_ENDPOINT => {
                if let Some(e) = state.data_error {
                    return Err(e);
                }
                if let Some(data) = state.data_queue.pop_front() {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    return Ok(len);
                }
                drop(state);
                // Simulate a short blocking wait so worker loops don't spin
                thread::sleep(Duration::from_millis(1));
                Err(rusb::Error::Timeout)
            }
            other => panic!("unexpected in endpoint {other:#04x}"),
        }
    }

    fn vendor_request(&self, request: u8, value: u16) -> rusb::Result<()> {
        self.state.lock().unwrap().vendor_requests.push((request, value));
        Ok(())
    }
}
