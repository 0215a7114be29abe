use crate::{RECORD_LENGTH, Record, RecordError, WRAP_INCREMENT};
use std::io::{self, Read, Write};

/// Wrap-aware reader over a byte source of packed records.
///
/// Maintains the accumulated time offset for the stream: every wrap-flagged
/// record advances the offset by [`WRAP_INCREMENT`] before the record itself
/// is stamped, so wrap records already carry the post-wrap timebase.
#[derive(Debug)]
pub struct RecordReader<R> {
    source: R,
    time_offset: u64,
}

impl<R: Read> RecordReader<R> {
    pub fn new(source: R) -> Self {
        Self { source, time_offset: 0 }
    }

    /// Consumes and discards records until `wraps` wrap-flagged records have
    /// been seen, then resets the time offset so delivery starts at the raw
    /// timebase. Used to align a stream with the start of a capture session.
    pub fn with_initial_wraps_dropped(source: R, wraps: u32) -> Result<Self, RecordError> {
        let mut reader = Self::new(source);
        let mut seen = 0;
        while seen < wraps {
            match reader.next_record()? {
                Some(record) if record.wrap_flag() => seen += 1,
                Some(_) => {}
                None => break,
            }
        }
        reader.time_offset = 0;
        Ok(reader)
    }

    /// Reads the next record, returning `None` on a clean end of source.
    ///
    /// A source that ends partway through a 6-byte record is a fatal
    /// [`RecordError::PartialRecord`].
    pub fn next_record(&mut self) -> Result<Option<Record>, RecordError> {
        let mut bytes = [0; RECORD_LENGTH];
        let mut filled = 0;
        while filled < RECORD_LENGTH {
            match self.source.read(&mut bytes[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(RecordError::PartialRecord {
                        actual: filled,
                        expected: RECORD_LENGTH,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let record = Record::from_wire(bytes);
        if record.wrap_flag() {
            self.time_offset += WRAP_INCREMENT;
        }
        Ok(Some(Record::with_time_offset(record.payload(), self.time_offset)))
    }

    #[must_use]
    pub fn time_offset(&self) -> u64 {
        self.time_offset
    }
}

/// Writes packed records to a byte sink.
#[derive(Debug)]
pub struct RecordWriter<W> {
    sink: W,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn write_record(&mut self, record: Record) -> Result<(), RecordError> {
        self.sink.write_all(&record.to_wire())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), RecordError> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RecordType, TIME_MASK};

    fn stream_of(payloads: &[u64]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(payloads.len() * RECORD_LENGTH);
        for &payload in payloads {
            bytes.extend_from_slice(&Record::new(payload).to_wire());
        }
        bytes
    }

    const WRAP_BIT: u64 = 1 << 46;

    #[test]
    fn reads_exactly_n_records_then_eos() {
        let bytes = stream_of(&[0x10, 0x20, 0x30]);
        let mut reader = RecordReader::new(bytes.as_slice());

        for expected in [0x10, 0x20, 0x30] {
            let record = reader.next_record().unwrap().unwrap();
            assert_eq!(record.raw_time(), expected);
            assert_eq!(record.record_type(), RecordType::Strobe);
        }
        assert!(reader.next_record().unwrap().is_none());
        // EOS is sticky
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn partial_trailing_record_is_fatal() {
        let mut bytes = stream_of(&[0x10]);
        bytes.extend_from_slice(&[0xAB, 0xCD]);
        let mut reader = RecordReader::new(bytes.as_slice());

        assert!(reader.next_record().unwrap().is_some());
        match reader.next_record() {
            Err(RecordError::PartialRecord { actual: 2, expected: 6 }) => {}
            other => panic!("expected partial record error, got {other:?}"),
        }
    }

    #[test]
    fn wrap_accumulation() {
        // Raw times 0xFFFFFFFFE, 0x0 (wrap), 0x5; absolute times per the wrap
        // law: the wrap record itself carries the post-wrap timebase.
        let bytes = stream_of(&[0xF_FFFF_FFFE, WRAP_BIT, 0x5]);
        let mut reader = RecordReader::new(bytes.as_slice());

        assert_eq!(reader.next_record().unwrap().unwrap().time(), 0xF_FFFF_FFFE);
        assert_eq!(reader.next_record().unwrap().unwrap().time(), 0xF_FFFF_FFFF);
        assert_eq!(reader.next_record().unwrap().unwrap().time(), 0x10_0000_0004);
    }

    #[test]
    fn absolute_time_non_decreasing_across_wraps() {
        let bytes = stream_of(&[
            0x100,
            TIME_MASK - 1,
            WRAP_BIT | 0x0,
            0x80,
            WRAP_BIT | 0x1,
            0x2,
        ]);
        let mut reader = RecordReader::new(bytes.as_slice());

        let mut last = 0;
        while let Some(record) = reader.next_record().unwrap() {
            assert!(record.time() >= last, "time went backwards: {} < {last}", record.time());
            last = record.time();
        }
    }

    #[test]
    fn drop_initial_wraps_realigns_timebase() {
        let payloads =
            [0x10, WRAP_BIT | 0x20, 0x30, WRAP_BIT | 0x40, 0x50, WRAP_BIT | 0x60, 0x70];
        let bytes = stream_of(&payloads);

        let mut reader = RecordReader::with_initial_wraps_dropped(bytes.as_slice(), 2).unwrap();

        // First delivered record is the one following the 2nd wrap, at its raw time.
        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.raw_time(), 0x50);
        assert_eq!(first.time(), 0x50);

        // The same bytes read with no drop, filtered past the 2nd wrap, match
        // the delivered sequence record-for-record (modulo the offset reset).
        let mut plain = RecordReader::new(bytes.as_slice());
        let mut wraps = 0;
        let mut expected = Vec::new();
        while let Some(record) = plain.next_record().unwrap() {
            if wraps >= 2 {
                expected.push(record.raw_time());
            }
            if record.wrap_flag() {
                wraps += 1;
            }
        }
        let mut delivered = vec![first.raw_time()];
        while let Some(record) = reader.next_record().unwrap() {
            delivered.push(record.raw_time());
        }
        assert_eq!(delivered, expected);
    }

    #[test]
    fn drop_initial_wraps_tolerates_short_stream() {
        let bytes = stream_of(&[0x10, WRAP_BIT | 0x20]);
        let mut reader = RecordReader::with_initial_wraps_dropped(bytes.as_slice(), 5).unwrap();
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn writer_round_trip() {
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_record(Record::new(WRAP_BIT | 0x123)).unwrap();
        writer.write_record(Record::new(0x456)).unwrap();

        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 2 * RECORD_LENGTH);

        let mut reader = RecordReader::new(bytes.as_slice());
        assert_eq!(reader.next_record().unwrap().unwrap().raw_time(), 0x123);
        assert_eq!(reader.next_record().unwrap().unwrap().raw_time(), 0x456);
    }
}
