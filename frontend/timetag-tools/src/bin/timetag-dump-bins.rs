use clap::Parser;
use env_logger::Env;
use std::io::{self, Read, Write};
use timetag_record::bins::BinRecord;

/// Decodes the binary bin-record stream on stdin (as produced by
/// timetag-bin) to `CHAN START COUNT LOST` text lines.
#[derive(Parser)]
struct Args;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    Args::parse();

    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();
    dump_bins(&mut stdin, &mut stdout)?;
    Ok(())
}

fn dump_bins(input: &mut impl Read, output: &mut impl Write) -> anyhow::Result<()> {
    while let Some(bin) = BinRecord::read_from(input)? {
        writeln!(output, "{}\t{:>11}\t{}\t{}", bin.channel, bin.start_time, bin.count, bin.lost)?;
    }
    Ok(())
}
