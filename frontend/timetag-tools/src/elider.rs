//! Elides DELTA records that bracket no photons.
//!
//! Alternating-excitation experiments emit a dense stream of output-state
//! transitions; past an initial preamble (kept so the excitation periods can
//! be recovered during analysis), only the DELTA immediately before and
//! after each STROBE carries information.

use crate::ProcessorResult;
use std::io::{Read, Write};
use timetag_record::{Record, RecordReader, RecordType, RecordWriter};

/// DELTA records passed through verbatim before elision begins.
pub const DELTA_PREAMBLE: usize = 1000;

pub fn run<R: Read, W: Write>(
    reader: &mut RecordReader<R>,
    writer: &mut RecordWriter<W>,
) -> ProcessorResult<()> {
    run_with_preamble(reader, writer, DELTA_PREAMBLE)
}

pub fn run_with_preamble<R: Read, W: Write>(
    reader: &mut RecordReader<R>,
    writer: &mut RecordWriter<W>,
    preamble: usize,
) -> ProcessorResult<()> {
    let mut deltas_seen = 0;
    while deltas_seen < preamble {
        let Some(record) = reader.next_record()? else {
            return Ok(());
        };
        writer.write_record(record)?;
        if record.record_type() == RecordType::Delta {
            deltas_seen += 1;
        }
    }

    let mut last_delta: Option<Record> = None;
    let mut write_next_delta = false;
    while let Some(record) = reader.next_record()? {
        match record.record_type() {
            RecordType::Strobe => {
                if let Some(delta) = last_delta.take() {
                    writer.write_record(delta)?;
                }
                writer.write_record(record)?;
                write_next_delta = true;
            }
            RecordType::Delta => {
                if write_next_delta {
                    writer.write_record(record)?;
                    write_next_delta = false;
                } else {
                    last_delta = Some(record);
                }
            }
        }
    }
    Ok(())
}
