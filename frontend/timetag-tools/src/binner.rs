//! Temporal binning of photon counts.
//!
//! Times are kept as 64-bit absolute values, so a stream can wrap the
//! hardware counter many times over without the bins ever going backwards.

use crate::ProcessorResult;
use std::io::Read;
use timetag_record::bins::BinRecord;
use timetag_record::{NUM_CHANNELS, Record, RecordReader, RecordType};

/// How intervals with no counts are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroBins {
    /// Backfill every skipped interval with a zero bin.
    Emit,
    /// Skip empty bins entirely.
    Omit,
    /// For a gap wider than two bins, emit only its first and last zero bin.
    Prune,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelBin {
    start: u64,
    count: u32,
    lost: u32,
}

pub struct Binner {
    bin_length: u64,
    zero_bins: ZeroBins,
    channels: [ChannelBin; NUM_CHANNELS],
    initialized: bool,
}

impl Binner {
    /// `bin_length` is the bin width in counter units and must be non-zero.
    #[must_use]
    pub fn new(bin_length: u64, zero_bins: ZeroBins) -> Self {
        assert!(bin_length > 0, "bin length must be non-zero");
        Self {
            bin_length,
            zero_bins,
            channels: [ChannelBin::default(); NUM_CHANNELS],
            initialized: false,
        }
    }

    /// Feeds one record through the binner. The first record aligns every
    /// channel's bin start to `floor(time / bin_length) * bin_length` and is
    /// itself counted.
    pub fn process(
        &mut self,
        record: Record,
        emit: &mut impl FnMut(BinRecord) -> ProcessorResult<()>,
    ) -> ProcessorResult<()> {
        let time = record.time();
        if !self.initialized {
            let start = time / self.bin_length * self.bin_length;
            for chan in &mut self.channels {
                chan.start = start;
            }
            self.initialized = true;
        }

        let bin_length = self.bin_length;
        let zero_bins = self.zero_bins;
        for (index, chan) in self.channels.iter_mut().enumerate() {
            if time >= chan.start + bin_length {
                let new_start = time / bin_length * bin_length;
                flush_bin(index, chan, new_start, bin_length, zero_bins, emit)?;
                chan.start = new_start;
                chan.count = 0;
                chan.lost = 0;
            }

            if record.lost_flag() {
                chan.lost += 1;
            }
            if record.record_type() == RecordType::Strobe && record.channel_active(index) {
                chan.count += 1;
            }
        }
        Ok(())
    }

    /// Emits the in-progress bin on every channel.
    pub fn finish(
        &mut self,
        emit: &mut impl FnMut(BinRecord) -> ProcessorResult<()>,
    ) -> ProcessorResult<()> {
        if !self.initialized {
            return Ok(());
        }
        for (index, chan) in self.channels.iter().enumerate() {
            if chan.count == 0 && self.zero_bins == ZeroBins::Omit {
                continue;
            }
            emit(BinRecord {
                channel: index as i32,
                start_time: chan.start,
                count: chan.count,
                lost: chan.lost,
            })?;
        }
        Ok(())
    }
}

/// Emits the completed bin for one channel, plus whatever representation of
/// the empty gap up to `new_start` the zero mode calls for.
fn flush_bin(
    index: usize,
    chan: &ChannelBin,
    new_start: u64,
    bin_length: u64,
    zero_bins: ZeroBins,
    emit: &mut impl FnMut(BinRecord) -> ProcessorResult<()>,
) -> ProcessorResult<()> {
    let bin = |start_time, count, lost| BinRecord { channel: index as i32, start_time, count, lost };

    if chan.count > 0 || zero_bins != ZeroBins::Omit {
        emit(bin(chan.start, chan.count, chan.lost))?;
    }

    let gap_start = chan.start + bin_length;
    match zero_bins {
        ZeroBins::Omit => {}
        ZeroBins::Emit => {
            let mut start = gap_start;
            while start < new_start {
                emit(bin(start, 0, 0))?;
                start += bin_length;
            }
        }
        ZeroBins::Prune => {
            if new_start - gap_start > 2 * bin_length {
                emit(bin(gap_start, 0, 0))?;
                emit(bin(new_start - bin_length, 0, 0))?;
            } else {
                let mut start = gap_start;
                while start < new_start {
                    emit(bin(start, 0, 0))?;
                    start += bin_length;
                }
            }
        }
    }
    Ok(())
}

/// Bins every record from `input`, flushing the final bins at end of stream.
pub fn run(
    input: impl Read,
    bin_length: u64,
    zero_bins: ZeroBins,
    emit: &mut impl FnMut(BinRecord) -> ProcessorResult<()>,
) -> ProcessorResult<()> {
    let mut reader = RecordReader::new(input);
    let mut binner = Binner::new(bin_length, zero_bins);
    while let Some(record) = reader.next_record()? {
        binner.process(record, emit)?;
    }
    binner.finish(emit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use timetag_record::TIME_BITS;

    const LOST_BIT: u64 = 1 << 47;
    const DELTA_BIT: u64 = 1 << 45;

    fn strobe(time: u64, channels: u64) -> Record {
        Record::new((channels << TIME_BITS) | time)
    }

    fn collect(records: &[Record], bin_length: u64, zero_bins: ZeroBins) -> Vec<BinRecord> {
        let mut binner = Binner::new(bin_length, zero_bins);
        let mut bins = Vec::new();
        let mut emit = |bin: BinRecord| {
            bins.push(bin);
            Ok(())
        };
        for &record in records {
            binner.process(record, &mut emit).unwrap();
        }
        binner.finish(&mut emit).unwrap();
        bins
    }

    fn channel_bins(bins: &[BinRecord], channel: i32) -> Vec<BinRecord> {
        bins.iter().copied().filter(|bin| bin.channel == channel).collect()
    }

    #[test]
    fn bins_photons_by_interval() {
        // Strobes on channel 0 at 10, 12, 25 with width 10
        let bins = collect(
            &[strobe(10, 0b0001), strobe(12, 0b0001), strobe(25, 0b0001)],
            10,
            ZeroBins::Emit,
        );

        let chan0 = channel_bins(&bins, 0);
        assert_eq!(chan0.len(), 2);
        assert_eq!((chan0[0].start_time, chan0[0].count, chan0[0].lost), (10, 2, 0));
        assert_eq!((chan0[1].start_time, chan0[1].count, chan0[1].lost), (20, 1, 0));
    }

    #[test]
    fn start_times_form_a_contiguous_progression() {
        let records: Vec<Record> =
            [3, 17, 18, 64, 65, 99].iter().map(|&t| strobe(t, 0b0011)).collect();
        let bins = collect(&records, 7, ZeroBins::Emit);

        for channel in 0..4 {
            let chan = channel_bins(&bins, channel);
            assert_eq!(chan[0].start_time, 3 / 7 * 7);
            for pair in chan.windows(2) {
                assert_eq!(pair[1].start_time, pair[0].start_time + 7);
            }
        }
    }

    #[test]
    fn counts_are_conserved_per_channel() {
        let records: Vec<Record> = (0..50).map(|i| strobe(i * 13, i % 16)).collect();
        let bins = collect(&records, 40, ZeroBins::Emit);

        for channel in 0..4 {
            let expected = records
                .iter()
                .filter(|r| r.channel_active(channel))
                .count();
            let counted: u32 = channel_bins(&bins, channel as i32).iter().map(|b| b.count).sum();
            assert_eq!(counted as usize, expected, "channel {channel}");
        }
    }

    #[test]
    fn omit_zeros_drops_empty_bins() {
        let bins =
            collect(&[strobe(5, 0b0001), strobe(95, 0b0001)], 10, ZeroBins::Omit);

        let chan0 = channel_bins(&bins, 0);
        assert_eq!(chan0.len(), 2);
        assert_eq!(chan0[0].start_time, 0);
        assert_eq!(chan0[1].start_time, 90);
        // Channels that saw nothing produce nothing
        assert!(channel_bins(&bins, 1).is_empty());
    }

    #[test]
    fn pruned_gaps_keep_first_and_last_zero_bin() {
        let bins =
            collect(&[strobe(5, 0b0001), strobe(95, 0b0001)], 10, ZeroBins::Prune);

        let chan0 = channel_bins(&bins, 0);
        let starts: Vec<u64> = chan0.iter().map(|b| b.start_time).collect();
        assert_eq!(starts, [0, 10, 80, 90]);
        assert_eq!(chan0[1].count, 0);
        assert_eq!(chan0[2].count, 0);
    }

    #[test]
    fn short_gaps_are_never_pruned() {
        let bins =
            collect(&[strobe(5, 0b0001), strobe(35, 0b0001)], 10, ZeroBins::Prune);

        let starts: Vec<u64> = channel_bins(&bins, 0).iter().map(|b| b.start_time).collect();
        assert_eq!(starts, [0, 10, 20, 30]);
    }

    #[test]
    fn lost_flag_charges_every_channel() {
        let bins = collect(
            &[strobe(1, 0b0001), Record::new(LOST_BIT | 2), strobe(11, 0b0001)],
            10,
            ZeroBins::Emit,
        );

        for channel in 0..4 {
            assert_eq!(channel_bins(&bins, channel)[0].lost, 1, "channel {channel}");
        }
    }

    #[test]
    fn delta_records_are_not_counted() {
        let bins = collect(
            &[strobe(1, 0b0001), Record::new(DELTA_BIT | (0b1111 << TIME_BITS) | 3)],
            10,
            ZeroBins::Emit,
        );

        assert_eq!(channel_bins(&bins, 0)[0].count, 1);
        assert_eq!(channel_bins(&bins, 1)[0].count, 0);
    }

    #[test]
    fn stream_round_trip() {
        let mut bytes = Vec::new();
        for record in [strobe(10, 0b0001), strobe(25, 0b0001)] {
            bytes.extend_from_slice(&record.to_wire());
        }

        let mut bins = Vec::new();
        run(bytes.as_slice(), 10, ZeroBins::Emit, &mut |bin| {
            bins.push(bin);
            Ok(())
        })
        .unwrap();

        assert_eq!(channel_bins(&bins, 0).len(), 2);
    }
}
