use clap::Parser;
use env_logger::Env;
use std::io::{self, BufWriter};
use timetag_record::{RecordReader, RecordWriter};
use timetag_tools::elider;

/// Elides DELTA records that bracket no photons, after passing an initial
/// preamble of transitions through verbatim.
#[derive(Parser)]
struct Args;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    Args::parse();

    let mut reader = RecordReader::new(io::stdin().lock());
    let mut writer = RecordWriter::new(BufWriter::new(io::stdout().lock()));

    elider::run(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(())
}
