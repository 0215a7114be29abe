//! Control sessions: the prompt/response loop shared by stdin and socket
//! clients, and the socket session's ancillary-fd plumbing.

use crate::broker::{Broker, CommandError, CommandOutcome};
use log::debug;
use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, UnixAddr, recvmsg};
use std::collections::VecDeque;
use std::io::{self, BufRead, IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use timetag_device::UsbTransport;

/// One control client's I/O. `receive_fd` only works where the transport
/// can carry ancillary data.
pub trait SessionIo {
    /// Next command line, or `None` when the client is gone.
    fn read_line(&mut self) -> io::Result<Option<String>>;

    fn write_line(&mut self, line: &str) -> io::Result<()>;

    fn receive_fd(&mut self) -> io::Result<OwnedFd> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "fd passing requires a socket session"))
    }
}

/// Runs one control session to completion: prompt with `ready`, read a
/// line, execute it, respond. Errors from a command become `error:` lines;
/// only client EOF, `quit`, or a transport failure end the loop.
pub fn drive<T: UsbTransport + 'static>(
    broker: &Broker<T>,
    session: &mut impl SessionIo,
) -> io::Result<()> {
    loop {
        session.write_line("ready")?;
        let Some(line) = session.read_line()? else {
            return Ok(());
        };

        match broker.execute(&line) {
            Ok(CommandOutcome::Done) => {}
            Ok(CommandOutcome::Value(value)) => session.write_line(&format!("= {value}"))?,
            Ok(CommandOutcome::Lines(lines)) => {
                for line in lines {
                    session.write_line(&format!("= {line}"))?;
                }
            }
            Ok(CommandOutcome::AwaitFd(name)) => {
                // The next message from this client must carry the fd
                session.write_line("ready")?;
                let registered = session
                    .receive_fd()
                    .map_err(CommandError::from)
                    .and_then(|fd| broker.register_fd_output(&name, fd));
                if let Err(e) = registered {
                    session.write_line(&format!("error: {e}"))?;
                }
            }
            Ok(CommandOutcome::Quit) => {
                debug!("client quit");
                return Ok(());
            }
            Err(e) => session.write_line(&format!("error: {e}"))?,
        }
    }
}

/// Interactive session: commands on stdin, responses on stderr so the data
/// stream on stdout stays clean.
pub struct StdinSession {
    input: io::StdinLock<'static>,
    output: io::Stderr,
}

impl StdinSession {
    #[must_use]
    pub fn new() -> Self {
        Self { input: io::stdin().lock(), output: io::stderr() }
    }
}

impl Default for StdinSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIo for StdinSession {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            Ok(None)
        } else {
            Ok(Some(line.trim_end().to_owned()))
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.output, "{line}")?;
        self.output.flush()
    }
}

/// Socket session. Lines are reassembled from `recvmsg` so that any
/// `SCM_RIGHTS` fds riding along with the byte stream are captured no
/// matter how the client frames its messages.
pub struct SocketSession {
    stream: UnixStream,
    buffer: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl SocketSession {
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self { stream, buffer: Vec::new(), fds: VecDeque::new() }
    }

    /// One `recvmsg`: appends data to the line buffer and stashes any
    /// passed fds. Returns the number of data bytes received.
    fn fill(&mut self) -> io::Result<usize> {
        let mut data = [0; 1024];
        let mut cmsg_buffer = cmsg_space!([RawFd; 4]);

        let bytes = loop {
            let mut iov = [IoSliceMut::new(&mut data)];
            match recvmsg::<UnixAddr>(
                self.stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => {
                    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            for fd in received {
                                // SAFETY: the kernel just handed us ownership
                                self.fds.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                            }
                        }
                    }
                    break msg.bytes;
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        };

        self.buffer.extend_from_slice(&data[..bytes]);
        Ok(bytes)
    }
}

impl SessionIo for SocketSession {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=end).collect();
                let line = String::from_utf8_lossy(&line);
                return Ok(Some(line.trim_end().to_owned()));
            }
            if self.fill()? == 0 {
                return Ok(None);
            }
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")
    }

    fn receive_fd(&mut self) -> io::Result<OwnedFd> {
        loop {
            if let Some(fd) = self.fds.pop_front() {
                return Ok(fd);
            }
            // A zero-byte read can still have carried the fd
            if self.fill()? == 0 && self.fds.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed before passing an fd",
                ));
            }
        }
    }
}
