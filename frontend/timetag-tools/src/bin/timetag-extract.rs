use clap::Parser;
use env_logger::Env;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use timetag_tools::extractor::{self, file_extractor};

/// Extracts per-channel timestamp files from a record file. Outputs are
/// named after the input with its extension replaced by
/// `.strobe<n>.times` / `.delta<n>.times`; silent channels produce no file.
#[derive(Parser)]
struct Args {
    /// Record file to extract
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let input = BufReader::new(File::open(&args.input)?);
    let mut extractor = file_extractor(args.input.with_extension(""));
    extractor::run(input, &mut extractor)?;
    Ok(())
}
