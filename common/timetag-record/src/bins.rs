//! Binned photon counts, as produced by the temporal binner.
//!
//! The serialized layout is packed little-endian with no padding:
//! `{i32 channel, u64 start_time, u32 count, u32 lost}`, 20 bytes total.

use crate::RecordError;
use std::io::{self, Read, Write};

/// Serialized size of one bin record, in bytes.
pub const BIN_RECORD_LENGTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinRecord {
    pub channel: i32,
    pub start_time: u64,
    /// Photons counted on this channel within the bin.
    pub count: u32,
    /// Number of records in the bin that carried the lost-sample flag, i.e.
    /// potential sprees of lost photons, not a count of lost photons.
    pub lost: u32,
}

impl BinRecord {
    #[must_use]
    pub fn to_bytes(self) -> [u8; BIN_RECORD_LENGTH] {
        let mut bytes = [0; BIN_RECORD_LENGTH];
        bytes[0..4].copy_from_slice(&self.channel.to_le_bytes());
        bytes[4..12].copy_from_slice(&self.start_time.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.count.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.lost.to_le_bytes());
        bytes
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; BIN_RECORD_LENGTH]) -> Self {
        Self {
            channel: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            start_time: u64::from_le_bytes(bytes[4..12].try_into().unwrap()),
            count: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            lost: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        }
    }

    pub fn write_to<W: Write>(self, sink: &mut W) -> Result<(), RecordError> {
        sink.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Reads the next bin record, returning `None` on a clean end of source.
    pub fn read_from<R: Read>(source: &mut R) -> Result<Option<Self>, RecordError> {
        let mut bytes = [0; BIN_RECORD_LENGTH];
        let mut filled = 0;
        while filled < BIN_RECORD_LENGTH {
            match source.read(&mut bytes[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(RecordError::PartialRecord {
                        actual: filled,
                        expected: BIN_RECORD_LENGTH,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(Self::from_bytes(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_fields() {
        let bin = BinRecord { channel: 3, start_time: 0x1234_5678_9ABC, count: 42, lost: 7 };
        assert_eq!(BinRecord::from_bytes(bin.to_bytes()), bin);
    }

    #[test]
    fn layout_is_little_endian() {
        let bin = BinRecord { channel: 1, start_time: 0x0102, count: 0x0304, lost: 0 };
        let bytes = bin.to_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[4..6], &[0x02, 0x01]);
        assert_eq!(&bytes[12..14], &[0x04, 0x03]);
    }

    #[test]
    fn stream_read_write() {
        let mut sink = Vec::new();
        let bins = [
            BinRecord { channel: 0, start_time: 10, count: 2, lost: 0 },
            BinRecord { channel: 0, start_time: 20, count: 1, lost: 1 },
        ];
        for bin in bins {
            bin.write_to(&mut sink).unwrap();
        }

        let mut source = sink.as_slice();
        assert_eq!(BinRecord::read_from(&mut source).unwrap(), Some(bins[0]));
        assert_eq!(BinRecord::read_from(&mut source).unwrap(), Some(bins[1]));
        assert_eq!(BinRecord::read_from(&mut source).unwrap(), None);
    }

    #[test]
    fn truncated_bin_record_is_fatal() {
        let bin = BinRecord { channel: 0, start_time: 1, count: 1, lost: 0 };
        let mut source = &bin.to_bytes()[..10];
        assert!(matches!(
            BinRecord::read_from(&mut source),
            Err(RecordError::PartialRecord { actual: 10, expected: 20 })
        ));
    }
}
