use anyhow::ensure;
use clap::Parser;
use env_logger::Env;
use std::io::{self, BufWriter, Write};
use timetag_tools::binner::{self, ZeroBins};

/// Temporally bins the record stream on stdin into per-channel photon
/// counts on stdout.
#[derive(Parser)]
struct Args {
    /// Bin width in counter units
    #[arg(value_name = "BIN_LENGTH")]
    bin_length: u64,

    /// Print text bins instead of binary bin records
    #[arg(short, long)]
    text: bool,

    /// Omit empty bins
    #[arg(short = 'z', long)]
    omit_zeros: bool,

    /// For gaps wider than two bins, emit only the first and last empty bin
    #[arg(short = 'p', long, conflicts_with = "omit_zeros")]
    prune_zeros: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    ensure!(args.bin_length > 0, "bin length must be non-zero");

    let zero_bins = if args.omit_zeros {
        ZeroBins::Omit
    } else if args.prune_zeros {
        ZeroBins::Prune
    } else {
        ZeroBins::Emit
    };

    let stdin = io::stdin().lock();
    let mut out = BufWriter::new(io::stdout().lock());

    if args.text {
        binner::run(stdin, args.bin_length, zero_bins, &mut |bin| {
            writeln!(out, "{:2}\t{:>10}\t{:>5}\t{:>5}", bin.channel, bin.start_time, bin.count, bin.lost)?;
            Ok(())
        })?;
    } else {
        binner::run(stdin, args.bin_length, zero_bins, &mut |bin| {
            bin.write_to(&mut out)?;
            Ok(())
        })?;
    }

    out.flush()?;
    Ok(())
}
