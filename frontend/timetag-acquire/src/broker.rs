//! Line-oriented command dispatch against the instrument facade and the
//! subscriber fanout.
//!
//! Verbs are declared in a static table that drives token validation and
//! generates the `help` output; every handler error is caught at the command
//! boundary and turned into a one-line response, so no client input can
//! terminate a session.

use crate::fanout::{Sink, SubscriberSet};
use log::info;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use timetag_device::{DeviceError, Timetagger, UsbTransport};
use timetag_record::NUM_CHANNELS;

pub struct CommandSpec {
    pub name: &'static str,
    pub arity: usize,
    pub usage: &'static str,
    pub help: &'static str,
}

macro_rules! command {
    ($name:literal, $arity:literal, $usage:literal, $help:literal) => {
        CommandSpec { name: $name, arity: $arity, usage: $usage, help: $help }
    };
}

pub const COMMANDS: &[CommandSpec] = &[
    command!("start_capture", 0, "start_capture", "enable capture and the record counter"),
    command!("stop_capture", 0, "stop_capture", "disable capture"),
    command!("capture?", 0, "capture?", "query whether capture is enabled"),
    command!("reset", 0, "reset", "stop capture and discard everything in flight"),
    command!("flush_fifo", 0, "flush_fifo", "clear the on-device record FIFO"),
    command!("set_send_window", 1, "set_send_window SIZE", "set the bulk send window in records"),
    command!("strobe_operate", 2, "strobe_operate CH EN", "enable or disable a strobe channel"),
    command!("strobe_operate?", 1, "strobe_operate? CH", "query a strobe channel"),
    command!("delta_operate", 2, "delta_operate CH EN", "enable or disable a delta channel"),
    command!("delta_operate?", 1, "delta_operate? CH", "query a delta channel"),
    command!("version?", 0, "version?", "query the firmware version"),
    command!("clockrate?", 0, "clockrate?", "query the capture clockrate in Hz"),
    command!("reset_counter", 0, "reset_counter", "zero the record counters"),
    command!("record_count?", 0, "record_count?", "query records emitted since the last reset"),
    command!("lost_record_count?", 0, "lost_record_count?", "query records dropped by the hardware"),
    command!("seq_clockrate?", 0, "seq_clockrate?", "query the sequencer clockrate in Hz"),
    command!("seq_operate", 1, "seq_operate EN", "start or stop the pulse sequencer"),
    command!("seq_operate?", 0, "seq_operate?", "query the pulse sequencer"),
    command!("reset_seq", 0, "reset_seq", "reset the pulse sequencer"),
    command!("seqchan_operate", 2, "seqchan_operate CH EN", "enable or disable a sequencer channel"),
    command!("seqchan_operate?", 1, "seqchan_operate? CH", "query a sequencer channel"),
    command!(
        "seqchan_config",
        5,
        "seqchan_config CH INITIAL_STATE INITIAL_COUNT LOW_COUNT HIGH_COUNT",
        "program a sequencer channel"
    ),
    command!("seqchan_initial_state?", 1, "seqchan_initial_state? CH", "query the initial state"),
    command!("seqchan_initial_count?", 1, "seqchan_initial_count? CH", "query the initial count"),
    command!("seqchan_low_count?", 1, "seqchan_low_count? CH", "query the low (off) count"),
    command!("seqchan_high_count?", 1, "seqchan_high_count? CH", "query the high (on) count"),
    command!("add_output_fd", 1, "add_output_fd NAME", "register a passed fd as an output"),
    command!("add_output_file", 2, "add_output_file NAME PATH", "register a file as an output"),
    command!("remove_output", 1, "remove_output NAME", "remove outputs with the given name"),
    command!("list_outputs", 0, "list_outputs", "list outputs as NAME FD LOST_RECORDS"),
    command!("help", 0, "help", "show this list"),
    command!("quit", 0, "quit", "end this control session"),
];

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command")]
    UnknownCommand,
    #[error("invalid command (expects {0} arguments)")]
    WrongArity(usize),
    #[error("invalid {what} '{value}'")]
    Parse { what: &'static str, value: String },
    #[error("channel {0} out of range (0-3)")]
    ChannelRange(usize),
    #[error("no output named '{0}'")]
    NoSuchOutput(String),
    #[error("cannot open '{path}': {source}")]
    OpenOutput {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub enum CommandOutcome {
    /// Command succeeded with nothing to report.
    Done,
    /// Single-value query response.
    Value(String),
    /// Multi-line response; each line is prefixed `= ` by the session.
    Lines(Vec<String>),
    /// `add_output_fd`: the session must now receive an ancillary fd and
    /// hand it to [`Broker::register_fd_output`].
    AwaitFd(String),
    /// End this session; the daemon keeps serving others.
    Quit,
}

pub struct Broker<T: UsbTransport + 'static> {
    tagger: Arc<Timetagger<T>>,
    subscribers: Arc<SubscriberSet>,
}

impl<T: UsbTransport + 'static> Broker<T> {
    pub fn new(tagger: Arc<Timetagger<T>>, subscribers: Arc<SubscriberSet>) -> Self {
        Self { tagger, subscribers }
    }

    /// Parses and executes one command line. Blank lines are no-ops.
    pub fn execute(&self, line: &str) -> Result<CommandOutcome, CommandError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = tokens.split_first() else {
            return Ok(CommandOutcome::Done);
        };

        let spec =
            COMMANDS.iter().find(|spec| spec.name == verb).ok_or(CommandError::UnknownCommand)?;
        if args.len() != spec.arity {
            return Err(CommandError::WrongArity(spec.arity));
        }

        self.dispatch(verb, args)
    }

    fn dispatch(&self, verb: &str, args: &[&str]) -> Result<CommandOutcome, CommandError> {
        use CommandOutcome::{AwaitFd, Done, Lines, Quit, Value};

        let tagger = &self.tagger;
        let outcome = match verb {
            "start_capture" => {
                tagger.start_capture()?;
                Done
            }
            "stop_capture" => {
                tagger.stop_capture()?;
                Done
            }
            "capture?" => Value(flag(tagger.capture_enabled()?)),
            "reset" => {
                tagger.reset()?;
                Done
            }
            "flush_fifo" => {
                tagger.flush_fifo()?;
                Done
            }
            "set_send_window" => {
                tagger.set_send_window(parse(args, 0, "send window")?)?;
                Done
            }
            "strobe_operate" => {
                tagger.set_strobe_operate(channel(args, 0)?, enable(args, 1)?)?;
                Done
            }
            "strobe_operate?" => Value(flag(tagger.strobe_operate(channel(args, 0)?)?)),
            "delta_operate" => {
                tagger.set_delta_operate(channel(args, 0)?, enable(args, 1)?)?;
                Done
            }
            "delta_operate?" => Value(flag(tagger.delta_operate(channel(args, 0)?)?)),
            "version?" => Value(tagger.version()?.to_string()),
            "clockrate?" => Value(tagger.clockrate()?.to_string()),
            "reset_counter" => {
                tagger.reset_counter()?;
                Done
            }
            "record_count?" => Value(tagger.record_count()?.to_string()),
            "lost_record_count?" => Value(tagger.lost_record_count()?.to_string()),
            "seq_clockrate?" => Value(tagger.seq_clockrate()?.to_string()),
            "seq_operate" => {
                tagger.set_global_sequencer_operate(enable(args, 0)?)?;
                Done
            }
            "seq_operate?" => Value(flag(tagger.global_sequencer_operate()?)),
            "reset_seq" => {
                tagger.reset_sequencer()?;
                Done
            }
            "seqchan_operate" => {
                tagger.set_seqchan_operate(channel(args, 0)?, enable(args, 1)?)?;
                Done
            }
            "seqchan_operate?" => Value(flag(tagger.seqchan_operate(channel(args, 0)?)?)),
            "seqchan_config" => {
                let ch = channel(args, 0)?;
                tagger.set_seqchan_initial_state(ch, enable(args, 1)?)?;
                tagger.set_seqchan_initial_count(ch, parse(args, 2, "initial count")?)?;
                tagger.set_seqchan_low_count(ch, parse(args, 3, "low count")?)?;
                tagger.set_seqchan_high_count(ch, parse(args, 4, "high count")?)?;
                Done
            }
            "seqchan_initial_state?" => Value(flag(tagger.seqchan_initial_state(channel(args, 0)?)?)),
            "seqchan_initial_count?" => {
                Value(tagger.seqchan_initial_count(channel(args, 0)?)?.to_string())
            }
            "seqchan_low_count?" => Value(tagger.seqchan_low_count(channel(args, 0)?)?.to_string()),
            "seqchan_high_count?" => {
                Value(tagger.seqchan_high_count(channel(args, 0)?)?.to_string())
            }
            "add_output_fd" => AwaitFd(args[0].to_owned()),
            "add_output_file" => {
                self.add_file_output(args[0], args[1])?;
                Done
            }
            "remove_output" => {
                if self.subscribers.remove(args[0]) == 0 {
                    return Err(CommandError::NoSuchOutput(args[0].to_owned()));
                }
                Done
            }
            "list_outputs" => Lines(
                self.subscribers
                    .list()
                    .iter()
                    .map(|sub| format!("{} {} {}", sub.name, sub.fd, sub.lost_records))
                    .collect(),
            ),
            "help" => Lines(help_lines()),
            "quit" => Quit,
            _ => unreachable!("verb was validated against the command table"),
        };
        Ok(outcome)
    }

    /// Registers a passed fd as a non-blocking output that the fanout closes
    /// on removal.
    pub fn register_fd_output(&self, name: &str, fd: OwnedFd) -> Result<(), CommandError> {
        set_nonblocking(&fd)?;
        info!("registering passed fd {} as output '{name}'", fd.as_raw_fd());
        self.subscribers.add(name, Sink::owned(fd), 0);
        Ok(())
    }

    fn add_file_output(&self, name: &str, path: &str) -> Result<(), CommandError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| CommandError::OpenOutput { path: path.to_owned(), source })?;
        self.subscribers.add(name, Sink::owned(file.into()), 0);
        Ok(())
    }
}

fn help_lines() -> Vec<String> {
    COMMANDS.iter().map(|spec| format!("{:<58} {}", spec.usage, spec.help)).collect()
}

fn flag(value: bool) -> String {
    u8::from(value).to_string()
}

fn parse<N: FromStr>(args: &[&str], index: usize, what: &'static str) -> Result<N, CommandError> {
    args[index].parse().map_err(|_| CommandError::Parse { what, value: args[index].to_owned() })
}

fn channel(args: &[&str], index: usize) -> Result<usize, CommandError> {
    let ch = parse(args, index, "channel")?;
    if ch >= NUM_CHANNELS {
        return Err(CommandError::ChannelRange(ch));
    }
    Ok(ch)
}

fn enable(args: &[&str], index: usize) -> Result<bool, CommandError> {
    let value: u32 = parse(args, index, "flag")?;
    Ok(value != 0)
}

fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    // SAFETY: plain fcntl on a valid fd
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
