use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::fs::{self, File};
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use timetag_acquire::broker::Broker;
use timetag_acquire::fanout::{Sink, SubscriberSet};
use timetag_acquire::session::{StdinSession, drive};
use timetag_acquire::{drop_privileges, ignore_sigpipe, server};
use timetag_device::{Timetagger, open_timetagger};
use timetag_record::RECORD_LENGTH;

/// The hardware replays stale records at the start of the first capture;
/// this many are dropped from the stdout stream (and only from stdout).
const STARTUP_SKIP_RECORDS: usize = 8;

#[derive(Parser)]
#[command(about = "Acquisition daemon for the FPGA timetagger")]
struct Args {
    /// Serve control clients on a Unix socket at PATH instead of stdin
    #[arg(short = 's', long = "socket", value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Append log output to PATH instead of stderr
    #[arg(short = 'l', long = "log-file", value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Detach from the controlling terminal after setup
    #[arg(short = 'd', long)]
    daemonize: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_ref())?;
    ignore_sigpipe();

    let handle = open_timetagger().context("no timetagger attached")?;

    if args.daemonize {
        // Keep fds open: stdout carries the record stream and the caller is
        // expected to have redirected it
        nix::unistd::daemon(false, true).context("failed to daemonize")?;
    }

    let subscribers = Arc::new(SubscriberSet::new());
    // SAFETY: fd 1 stays open for the process lifetime; the sink is borrowed,
    // so teardown hands the fd back instead of closing it
    let stdout = unsafe { OwnedFd::from_raw_fd(libc::STDOUT_FILENO) };
    subscribers.add("stdout", Sink::borrowed(stdout), STARTUP_SKIP_RECORDS * RECORD_LENGTH);

    let tagger =
        Arc::new(Timetagger::new(handle).context("failed to initialize the timetagger")?);
    let publish = Arc::clone(&subscribers);
    tagger.start_readout(Box::new(move |buffer| publish.publish(buffer)));
    tagger.reset().context("initial reset failed")?;

    let broker = Arc::new(Broker::new(Arc::clone(&tagger), Arc::clone(&subscribers)));

    if let Some(path) = &args.socket {
        let listener = server::bind_control_socket(path)
            .with_context(|| format!("cannot bind control socket {}", path.display()))?;
        drop_privileges();

        let stop = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGINT, Arc::clone(&stop))
            .context("installing signal handlers")?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&stop))
            .context("installing signal handlers")?;

        let accept = server::serve(listener, Arc::clone(&broker), Arc::clone(&stop));
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(100));
        }
        info!("stop requested");
        let _ = accept.join();
        let _ = fs::remove_file(path);
    } else {
        drop_privileges();
        let mut session = StdinSession::new();
        if let Err(e) = drive(&broker, &mut session) {
            error!("control session failed: {e}");
        }
    }

    tagger.stop_readout();
    subscribers.shutdown();
    info!("shut down cleanly");
    Ok(())
}

fn init_logging(log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
