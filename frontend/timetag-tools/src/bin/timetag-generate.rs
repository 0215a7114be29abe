use clap::Parser;
use env_logger::Env;
use rand::RngExt;
use std::io;
use std::thread;
use std::time::Duration;
use timetag_record::{Record, RecordWriter, TIME_BITS, TIME_MASK};

/// Nominal capture clock the generated counter advances against.
const CLOCK_RATE: f64 = 30e6;
/// Fractional jitter applied to each inter-photon delay.
const DEVIATION: f64 = 0.7;

/// Generates a reasonably realistic photon stream on stdout, for exercising
/// the stream processors without hardware.
#[derive(Parser)]
struct Args {
    /// Mean photon rate in Hz
    #[arg(value_name = "HZ")]
    rate: u32,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    anyhow::ensure!(args.rate > 0, "rate must be non-zero");

    let period_ns = 1e9 / f64::from(args.rate);
    let mut counter: u64 = 0;
    let mut rng = rand::rng();
    let mut writer = RecordWriter::new(io::stdout().lock());

    loop {
        let channels = u64::from(rng.random::<u8>() & 0x0F);
        writer.write_record(Record::new((channels << TIME_BITS) | (counter & TIME_MASK)))?;
        writer.flush()?;

        let delay_ns = period_ns * (1.0 + DEVIATION * rng.random::<f64>());
        thread::sleep(Duration::from_nanos(delay_ns as u64));
        counter += (CLOCK_RATE * delay_ns * 1e-9) as u64;
    }
}
