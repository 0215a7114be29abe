use clap::Parser;
use env_logger::Env;
use std::io::{self, BufWriter};
use timetag_record::{RecordReader, RecordWriter};
use timetag_tools::cutter::{self, CutConfig};

/// Cuts the record stream on stdin by time, index, and channel, writing the
/// surviving records unchanged to stdout.
#[derive(Parser)]
struct Args {
    /// Include only records with strobe channel CH active
    #[arg(short = 's', long, value_name = "CH")]
    strobe_on: Option<usize>,

    /// Include only records seen while delta channel CH is high
    #[arg(short = 'd', long, value_name = "CH")]
    delta_on: Option<usize>,

    /// Start at timestamp TIME
    #[arg(short = 't', long, value_name = "TIME")]
    start_time: Option<f64>,

    /// End at timestamp TIME
    #[arg(short = 'T', long, value_name = "TIME")]
    end_time: Option<f64>,

    /// Skip the first N records
    #[arg(short = 'r', long, value_name = "N", default_value_t = 0)]
    skip_records: u64,

    /// Drop all records past the Nth
    #[arg(short = 'R', long, value_name = "N")]
    truncate_records: Option<u64>,

    /// Ignore data until the Nth counter wrap
    #[arg(short = 'W', long, value_name = "N", default_value_t = 0)]
    drop_initial_wraps: u32,

    /// Keep wrap records, channel bits cleared
    #[arg(short = 'w', long)]
    preserve_wraps: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = CutConfig {
        strobe_on: args.strobe_on,
        delta_on: args.delta_on,
        start_time: args.start_time.map(|t| t.round() as u64),
        end_time: args.end_time.map(|t| t.round() as u64),
        skip_records: args.skip_records,
        truncate_records: args.truncate_records,
        preserve_wraps: args.preserve_wraps,
    };

    let mut reader =
        RecordReader::with_initial_wraps_dropped(io::stdin().lock(), args.drop_initial_wraps)?;
    let mut writer = RecordWriter::new(BufWriter::new(io::stdout().lock()));

    cutter::run(&mut reader, &mut writer, &config)?;
    writer.flush()?;
    Ok(())
}
