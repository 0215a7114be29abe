//! The 48-bit packed record format emitted by the FPGA timetagger, plus the
//! wrap-aware stream reader/writer and the binned-count record format.
//!
//! A record occupies 6 bytes big-endian on the wire. Bits 0-35 hold the raw
//! time counter, bits 36-39 the channel bitmap, bit 45 the record type
//! (strobe/delta), bit 46 the timer-wrap flag, and bit 47 the lost-sample
//! flag. Bits 40-44 are reserved.

pub mod bins;
mod stream;

pub use stream::{RecordReader, RecordWriter};

use std::io;
use thiserror::Error;

/// Size of one record on the wire, in bytes.
pub const RECORD_LENGTH: usize = 6;

/// Width of the raw time counter.
pub const TIME_BITS: u32 = 36;

pub const TIME_MASK: u64 = (1 << TIME_BITS) - 1;

/// Number of strobe/delta channels the hardware exposes.
pub const NUM_CHANNELS: usize = 4;

pub const CHANNEL_MASK: u64 = 0xF << TIME_BITS;

const PAYLOAD_MASK: u64 = (1 << 48) - 1;
const REC_TYPE_BIT: u64 = 1 << 45;
const TIMER_WRAP_BIT: u64 = 1 << 46;
const LOST_SAMPLE_BIT: u64 = 1 << 47;

/// Added to a stream's time offset every time a wrap-flagged record is seen.
pub const WRAP_INCREMENT: u64 = (1 << TIME_BITS) - 1;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("byte source ended mid-record ({actual} of {expected} bytes)")]
    PartialRecord { actual: usize, expected: usize },
    #[error("I/O error on record stream: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// A photon arrival; channel bits indicate which detector(s) fired.
    Strobe,
    /// A state change on the digital outputs; channel bits hold the
    /// post-transition state.
    Delta,
}

/// One timetagger record: the 48-bit wire payload plus the time offset
/// accumulated from counter wraps earlier in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    data: u64,
    time_offset: u64,
}

impl Record {
    #[must_use]
    pub fn new(data: u64) -> Self {
        Self { data: data & PAYLOAD_MASK, time_offset: 0 }
    }

    #[must_use]
    pub fn with_time_offset(data: u64, time_offset: u64) -> Self {
        Self { data: data & PAYLOAD_MASK, time_offset }
    }

    /// The raw 48-bit wire payload.
    #[must_use]
    pub fn payload(self) -> u64 {
        self.data
    }

    #[must_use]
    pub fn record_type(self) -> RecordType {
        if self.data & REC_TYPE_BIT != 0 { RecordType::Delta } else { RecordType::Strobe }
    }

    /// The 36-bit counter value as emitted by the hardware.
    #[must_use]
    pub fn raw_time(self) -> u64 {
        self.data & TIME_MASK
    }

    /// Absolute time: raw time plus the offset accumulated from wraps.
    #[must_use]
    pub fn time(self) -> u64 {
        self.raw_time() + self.time_offset
    }

    #[must_use]
    pub fn time_offset(self) -> u64 {
        self.time_offset
    }

    #[must_use]
    pub fn wrap_flag(self) -> bool {
        self.data & TIMER_WRAP_BIT != 0
    }

    #[must_use]
    pub fn lost_flag(self) -> bool {
        self.data & LOST_SAMPLE_BIT != 0
    }

    /// The channel bitmap as the low 4 bits of the returned byte.
    #[must_use]
    pub fn channels(self) -> u8 {
        ((self.data & CHANNEL_MASK) >> TIME_BITS) as u8
    }

    #[must_use]
    pub fn channel_active(self, channel: usize) -> bool {
        debug_assert!(channel < NUM_CHANNELS);
        self.channels() & (1 << channel) != 0
    }

    /// The same record with all channel bits cleared.
    #[must_use]
    pub fn without_channels(self) -> Self {
        Self { data: self.data & !CHANNEL_MASK, time_offset: self.time_offset }
    }

    /// Encodes the raw payload as 6 bytes big-endian. The reconstructed
    /// absolute time is never written.
    #[must_use]
    pub fn to_wire(self) -> [u8; RECORD_LENGTH] {
        let shifted = (self.data << 16).to_be_bytes();
        [shifted[0], shifted[1], shifted[2], shifted[3], shifted[4], shifted[5]]
    }

    /// Decodes 6 wire bytes into a record with no time offset applied.
    #[must_use]
    pub fn from_wire(bytes: [u8; RECORD_LENGTH]) -> Self {
        let mut padded = [0; 8];
        padded[2..].copy_from_slice(&bytes);
        Self::new(u64::from_be_bytes(padded))
    }
}
