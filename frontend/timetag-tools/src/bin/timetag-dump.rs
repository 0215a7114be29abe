use clap::Parser;
use env_logger::Env;
use std::io;
use timetag_tools::dump;

/// Decodes the record stream on stdin to a human-readable table:
/// `INDEX TIME TYPE WRAP LOST C0 C1 C2 C3`, tab separated.
#[derive(Parser)]
struct Args;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    Args::parse();

    dump::run(io::stdin().lock(), io::stdout().lock())?;
    Ok(())
}
