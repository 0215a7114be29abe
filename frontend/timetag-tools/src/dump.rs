//! Human-readable record dump.

use crate::ProcessorResult;
use std::io::{Read, Write};
use timetag_record::{NUM_CHANNELS, Record, RecordReader, RecordType};

pub fn dump_record(out: &mut impl Write, index: u64, record: Record) -> std::io::Result<()> {
    write!(
        out,
        "{index}\t{:>11}\t{}\t{}\t{}",
        record.raw_time(),
        match record.record_type() {
            RecordType::Strobe => "STROBE",
            RecordType::Delta => "DELTA",
        },
        if record.wrap_flag() { "WRAP" } else { "" },
        if record.lost_flag() { "LOST" } else { "" },
    )?;
    for channel in 0..NUM_CHANNELS {
        write!(out, "\t{}", u8::from(record.channel_active(channel)))?;
    }
    writeln!(out)
}

pub fn run(input: impl Read, mut output: impl Write) -> ProcessorResult<()> {
    let mut reader = RecordReader::new(input);
    let mut index = 0;
    while let Some(record) = reader.next_record()? {
        dump_record(&mut output, index, record)?;
        index += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use timetag_record::TIME_BITS;

    #[test]
    fn one_line_per_record() {
        let record = Record::new((1 << 46) | (0b0101 << TIME_BITS) | 0x1234);
        let mut out = Vec::new();
        dump_record(&mut out, 7, record).unwrap();

        let line = String::from_utf8(out).unwrap();
        assert_eq!(line, format!("7\t{:>11}\tSTROBE\tWRAP\t\t1\t0\t1\t0\n", 0x1234));
    }

    #[test]
    fn dumps_until_end_of_stream() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&Record::new(0x10).to_wire());
        bytes.extend_from_slice(&Record::new((1 << 45) | 0x20).to_wire());

        let mut out = Vec::new();
        run(bytes.as_slice(), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('0'));
        assert!(lines[1].contains("DELTA"));
    }
}
