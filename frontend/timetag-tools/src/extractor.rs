//! Per-channel timestamp extraction.
//!
//! Strobe channels produce flat files of `u64` little-endian timestamps.
//! Delta channels produce `{u64 time, u8 state}` transition files headed by
//! one `{u64 first_delta_time, u8 initial_state}` record capturing the state
//! before the channel's first transition. Files are only created for
//! channels that see activity.

use crate::ProcessorResult;
use log::info;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use timetag_record::{NUM_CHANNELS, Record, RecordReader, RecordType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Strobe,
    Delta,
}

/// Routes extracted events to lazily-created per-channel sinks.
pub struct Extractor<W, F> {
    open: F,
    strobe_out: [Option<W>; NUM_CHANNELS],
    delta_out: [Option<W>; NUM_CHANNELS],
    first_delta_time: u64,
    delta_states: u8,
    first_delta: bool,
}

impl<W: Write, F: FnMut(ChannelKind, usize) -> io::Result<W>> Extractor<W, F> {
    /// `open` is called at most once per `(kind, channel)`, the first time
    /// that channel produces output.
    pub fn new(open: F) -> Self {
        Self {
            open,
            strobe_out: [None, None, None, None],
            delta_out: [None, None, None, None],
            first_delta_time: 0,
            delta_states: 0,
            first_delta: true,
        }
    }

    pub fn process(&mut self, record: Record) -> ProcessorResult<()> {
        let channels = record.channels();
        let time = record.time();

        match record.record_type() {
            RecordType::Strobe => {
                for channel in 0..NUM_CHANNELS {
                    if channels & (1 << channel) == 0 {
                        continue;
                    }
                    if self.strobe_out[channel].is_none() {
                        self.strobe_out[channel] =
                            Some((self.open)(ChannelKind::Strobe, channel)?);
                    }
                    let out = self.strobe_out[channel].as_mut().unwrap();
                    out.write_all(&time.to_le_bytes())?;
                }
            }
            RecordType::Delta => {
                // The first DELTA defines the baseline state; transitions
                // are emitted relative to it
                if self.first_delta {
                    self.first_delta_time = time;
                    self.delta_states = channels;
                    self.first_delta = false;
                    return Ok(());
                }

                for channel in 0..NUM_CHANNELS {
                    let new_state = channels & (1 << channel) != 0;
                    let old_state = self.delta_states & (1 << channel) != 0;
                    if new_state == old_state {
                        continue;
                    }

                    if self.delta_out[channel].is_none() {
                        let mut out = (self.open)(ChannelKind::Delta, channel)?;
                        out.write_all(&self.first_delta_time.to_le_bytes())?;
                        out.write_all(&[u8::from(old_state)])?;
                        self.delta_out[channel] = Some(out);
                    }
                    let out = self.delta_out[channel].as_mut().unwrap();
                    out.write_all(&time.to_le_bytes())?;
                    out.write_all(&[u8::from(new_state)])?;

                    if new_state {
                        self.delta_states |= 1 << channel;
                    } else {
                        self.delta_states &= !(1 << channel);
                    }
                }
            }
        }
        Ok(())
    }

    /// Tears down the extractor, returning the sinks that were created.
    pub fn into_sinks(self) -> ([Option<W>; NUM_CHANNELS], [Option<W>; NUM_CHANNELS]) {
        (self.strobe_out, self.delta_out)
    }
}

/// Extractor writing `base.strobe<n>.times` / `base.delta<n>.times` files,
/// with channels numbered from 1.
pub fn file_extractor(
    base: PathBuf,
) -> Extractor<File, impl FnMut(ChannelKind, usize) -> io::Result<File>> {
    Extractor::new(move |kind, channel| {
        let kind = match kind {
            ChannelKind::Strobe => "strobe",
            ChannelKind::Delta => "delta",
        };
        let name = format!("{}.{kind}{}.times", base.display(), channel + 1);
        info!("writing {name}");
        File::create(name)
    })
}

pub fn run<W: Write, F: FnMut(ChannelKind, usize) -> io::Result<W>>(
    input: impl Read,
    extractor: &mut Extractor<W, F>,
) -> ProcessorResult<()> {
    let mut reader = RecordReader::new(input);
    while let Some(record) = reader.next_record()? {
        extractor.process(record)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use timetag_record::TIME_BITS;

    const DELTA_BIT: u64 = 1 << 45;

    fn strobe(time: u64, channels: u64) -> Record {
        Record::new((channels << TIME_BITS) | time)
    }

    fn delta(time: u64, channels: u64) -> Record {
        Record::new(DELTA_BIT | (channels << TIME_BITS) | time)
    }

    fn extract(records: &[Record]) -> ([Option<Vec<u8>>; 4], [Option<Vec<u8>>; 4]) {
        let mut extractor = Extractor::new(|_, _| Ok(Vec::new()));
        for &record in records {
            extractor.process(record).unwrap();
        }
        extractor.into_sinks()
    }

    #[test]
    fn strobe_channels_collect_timestamps() {
        let (strobes, deltas) = extract(&[
            strobe(0x10, 0b0001),
            strobe(0x20, 0b0011),
            strobe(0x30, 0b0010),
        ]);

        let chan0 = strobes[0].as_ref().unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&0x10_u64.to_le_bytes());
        expected.extend_from_slice(&0x20_u64.to_le_bytes());
        assert_eq!(chan0, &expected);

        let chan1 = strobes[1].as_ref().unwrap();
        assert_eq!(chan1.len(), 16);

        // Untouched channels get no file
        assert!(strobes[2].is_none());
        assert!(deltas.iter().all(Option::is_none));
    }

    #[test]
    fn delta_files_carry_initial_state_then_transitions() {
        let (_, deltas) = extract(&[
            delta(0x10, 0b0001), // baseline: channel 0 high
            delta(0x20, 0b0000), // channel 0 falls
            delta(0x30, 0b0001), // and rises again
        ]);

        let chan0 = deltas[0].as_ref().unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&0x10_u64.to_le_bytes());
        expected.push(1); // state before the first transition
        expected.extend_from_slice(&0x20_u64.to_le_bytes());
        expected.push(0);
        expected.extend_from_slice(&0x30_u64.to_le_bytes());
        expected.push(1);
        assert_eq!(chan0, &expected);

        assert!(deltas[1].is_none());
    }

    #[test]
    fn unchanged_delta_channels_emit_nothing() {
        let (_, deltas) = extract(&[delta(0x10, 0b0001), delta(0x20, 0b0001)]);
        assert!(deltas.iter().all(Option::is_none));
    }
}
