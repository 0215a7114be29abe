//! Time and channel cuts over a record stream.
//!
//! DELTA records are consumed to track the current output state (so
//! `--delta-on` can gate strobes on it) and are dropped from the output;
//! wrap-flagged records can be passed through with their channel bits
//! masked so downstream readers keep a correct timebase.

use crate::ProcessorResult;
use log::debug;
use std::io::{Read, Write};
use timetag_record::{RecordReader, RecordType, RecordWriter};

#[derive(Debug, Clone, Default)]
pub struct CutConfig {
    /// Keep only records with this strobe channel active.
    pub strobe_on: Option<usize>,
    /// Keep only records seen while this delta channel is high.
    pub delta_on: Option<usize>,
    pub start_time: Option<u64>,
    /// The first record past this time terminates the cut.
    pub end_time: Option<u64>,
    /// Drop the first N records that would otherwise pass.
    pub skip_records: u64,
    /// Drop every record past the Nth.
    pub truncate_records: Option<u64>,
    /// Pass wrap-flagged records through, channel bits cleared.
    pub preserve_wraps: bool,
}

pub fn run<R: Read, W: Write>(
    reader: &mut RecordReader<R>,
    writer: &mut RecordWriter<W>,
    config: &CutConfig,
) -> ProcessorResult<()> {
    let mut delta_status: u8 = 0;
    let mut index: u64 = 0;
    let mut written: u64 = 0;

    while let Some(record) = reader.next_record()? {
        if record.record_type() == RecordType::Delta {
            delta_status = record.channels();
            if !(config.preserve_wraps && record.wrap_flag()) {
                continue;
            }
        }
        index += 1;

        let time = record.time();
        if config.end_time.is_some_and(|end| time > end) {
            debug!("end time reached after {index} records, {written} written");
            return Ok(());
        }
        if config.start_time.is_some_and(|start| time < start)
            || index <= config.skip_records
            || config.truncate_records.is_some_and(|truncate| index > truncate)
        {
            continue;
        }

        if config.preserve_wraps && record.wrap_flag() {
            writer.write_record(record.without_channels())?;
            written += 1;
            continue;
        }

        if config.strobe_on.is_some_and(|ch| !record.channel_active(ch)) {
            continue;
        }
        if config.delta_on.is_some_and(|ch| delta_status & (1 << ch) == 0) {
            continue;
        }

        writer.write_record(record)?;
        written += 1;
    }
    debug!("end of stream after {index} records, {written} written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use timetag_record::{Record, TIME_BITS};

    const DELTA_BIT: u64 = 1 << 45;
    const WRAP_BIT: u64 = 1 << 46;

    fn strobe(time: u64, channels: u64) -> u64 {
        (channels << TIME_BITS) | time
    }

    fn delta(time: u64, channels: u64) -> u64 {
        DELTA_BIT | (channels << TIME_BITS) | time
    }

    fn cut(payloads: &[u64], config: &CutConfig) -> Vec<Record> {
        let mut bytes = Vec::new();
        for &payload in payloads {
            bytes.extend_from_slice(&Record::new(payload).to_wire());
        }

        let mut reader = RecordReader::new(bytes.as_slice());
        let mut writer = RecordWriter::new(Vec::new());
        run(&mut reader, &mut writer, config).unwrap();

        let output = writer.into_inner();
        let mut reader = RecordReader::new(output.as_slice());
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn time_window() {
        // Records at 5, 15, 25 with a 10..=20 window keep only 15
        let out = cut(
            &[strobe(5, 1), strobe(15, 1), strobe(25, 1)],
            &CutConfig {
                start_time: Some(10),
                end_time: Some(20),
                ..CutConfig::default()
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].raw_time(), 15);
    }

    #[test]
    fn output_is_an_ordered_subsequence() {
        let input: Vec<u64> = (0..20).map(|i| strobe(i * 3, 1 + (i % 3))).collect();
        let out = cut(&input, &CutConfig { strobe_on: Some(1), ..CutConfig::default() });

        let mut last = 0;
        for record in &out {
            assert!(record.channel_active(1));
            assert!(record.raw_time() >= last);
            last = record.raw_time();
        }
        assert!(out.len() < input.len());
    }

    #[test]
    fn skip_drops_exactly_the_first_n() {
        let input: Vec<u64> = (1..=6).map(|i| strobe(i, 1)).collect();
        let out = cut(&input, &CutConfig { skip_records: 4, ..CutConfig::default() });

        let times: Vec<u64> = out.iter().map(|r| r.raw_time()).collect();
        assert_eq!(times, [5, 6]);
    }

    #[test]
    fn truncate_keeps_a_prefix() {
        let input: Vec<u64> = (1..=6).map(|i| strobe(i, 1)).collect();
        let out = cut(&input, &CutConfig { truncate_records: Some(2), ..CutConfig::default() });

        let times: Vec<u64> = out.iter().map(|r| r.raw_time()).collect();
        assert_eq!(times, [1, 2]);
    }

    #[test]
    fn delta_records_gate_but_never_pass() {
        let input = [
            strobe(1, 0b0001),
            delta(2, 0b0010), // delta channel 1 goes high
            strobe(3, 0b0001),
            delta(4, 0b0000), // and low again
            strobe(5, 0b0001),
        ];
        let out = cut(&input, &CutConfig { delta_on: Some(1), ..CutConfig::default() });

        let times: Vec<u64> = out.iter().map(|r| r.raw_time()).collect();
        assert_eq!(times, [3]);
    }

    #[test]
    fn preserved_wraps_lose_their_channel_bits() {
        let input = [strobe(10, 0b0001), WRAP_BIT | strobe(0, 0b0110), strobe(3, 0b0001)];
        let out = cut(
            &input,
            &CutConfig { strobe_on: Some(2), preserve_wraps: true, ..CutConfig::default() },
        );

        // Only the wrap record survives the channel filter, and masked
        assert_eq!(out.len(), 1);
        assert!(out[0].wrap_flag());
        assert_eq!(out[0].channels(), 0);
    }

    #[test]
    fn wrap_flagged_deltas_pass_only_when_preserved(){
        let input = [strobe(1, 1), DELTA_BIT | WRAP_BIT | strobe(2, 0b0010), strobe(3, 1)];

        let plain = cut(&input, &CutConfig::default());
        assert_eq!(plain.len(), 2);

        let preserved = cut(&input, &CutConfig { preserve_wraps: true, ..CutConfig::default() });
        assert_eq!(preserved.len(), 3);
        assert!(preserved[1].wrap_flag());
        assert_eq!(preserved[1].channels(), 0);
    }
}
