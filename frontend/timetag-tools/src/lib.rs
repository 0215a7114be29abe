//! Stream-to-stream processors over the packed record format: temporal
//! binning, time/channel cuts, delta elision, timestamp extraction, and
//! human-readable dumps. Each processor reads records on one end, writes a
//! transformed stream on the other, and shares the wrap-aware reader.

pub mod binner;
pub mod cutter;
pub mod dump;
pub mod elider;
pub mod extractor;

use std::io;
use thiserror::Error;
use timetag_record::RecordError;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("I/O error writing output: {0}")]
    Io(#[from] io::Error),
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;
