//! End-to-end control protocol over a real Unix socket: prompt/response
//! framing, ancillary fd passing, fanout delivery to the passed fd, and
//! multi-client serving.

use nix::sys::socket::{ControlMessage, MsgFlags, UnixAddr, sendmsg};
use std::io::{BufRead, BufReader, IoSlice, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use timetag_acquire::broker::Broker;
use timetag_acquire::fanout::SubscriberSet;
use timetag_acquire::{ignore_sigpipe, server};
use timetag_device::testutil::MockTransport;
use timetag_device::{Timetagger, regs};

struct TestDaemon {
    path: PathBuf,
    subscribers: Arc<SubscriberSet>,
    stop: Arc<AtomicBool>,
    accept: Option<std::thread::JoinHandle<()>>,
}

impl TestDaemon {
    fn start(name: &str) -> Self {
        ignore_sigpipe();
        let path =
            std::env::temp_dir().join(format!("timetag-ctl-{name}-{}", std::process::id()));

        let mock = MockTransport::new();
        mock.set_register(regs::VERSION, 7);
        let tagger = Arc::new(Timetagger::new(mock).expect("mock construction cannot fail"));
        let subscribers = Arc::new(SubscriberSet::new());
        let broker = Arc::new(Broker::new(tagger, Arc::clone(&subscribers)));

        let listener = server::bind_control_socket(&path).expect("bind in temp dir");
        let stop = Arc::new(AtomicBool::new(false));
        let accept = server::serve(listener, broker, Arc::clone(&stop));

        Self { path, subscribers, stop, accept: Some(accept) }
    }

    fn connect(&self) -> Client {
        let stream = UnixStream::connect(&self.path).expect("connect to control socket");
        let reader = BufReader::new(stream.try_clone().expect("clone stream"));
        Client { stream, reader }
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

struct Client {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Client {
    fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).unwrap();
        self.stream.write_all(b"\n").unwrap();
    }

    fn expect(&mut self, expected: &str) {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), expected);
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end().to_owned()
    }

    /// Sends one byte of data carrying `fd` as ancillary SCM_RIGHTS.
    fn send_fd(&mut self, fd: &impl AsRawFd) {
        let fds = [fd.as_raw_fd()];
        let iov = [IoSlice::new(b"\n")];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )
        .unwrap();
    }
}

#[test]
fn query_round_trip_over_the_socket() {
    let daemon = TestDaemon::start("query");
    let mut client = daemon.connect();

    client.expect("ready");
    client.send("version?");
    client.expect("= 7");
    client.expect("ready");

    client.send("bogus");
    client.expect("error: unknown command");
    client.expect("ready");

    client.send("quit");
}

#[test]
fn passed_fd_receives_published_buffers() {
    let daemon = TestDaemon::start("fdpass");
    let mut client = daemon.connect();
    client.expect("ready");

    let (mut sink_reader, sink_writer) = UnixStream::pair().unwrap();
    client.send("add_output_fd pipe");
    client.expect("ready");
    client.send_fd(&sink_writer);
    drop(sink_writer);
    // The byte carrying the fd reads as an empty command
    client.expect("ready");
    client.expect("ready");

    client.send("list_outputs");
    let listing = client.read_line();
    assert!(listing.starts_with("= pipe "), "got {listing:?}");
    assert!(listing.ends_with(" 0"));
    client.expect("ready");

    daemon.subscribers.publish(&[1, 2, 3, 4, 5, 6]);
    let mut received = [0; 6];
    sink_reader.read_exact(&mut received).unwrap();
    assert_eq!(received, [1, 2, 3, 4, 5, 6]);

    client.send("remove_output pipe");
    client.expect("ready");
    client.send("quit");
}

#[test]
fn clients_are_independent() {
    let daemon = TestDaemon::start("multi");

    let mut first = daemon.connect();
    let mut second = daemon.connect();
    first.expect("ready");
    second.expect("ready");

    first.send("quit");

    // The second session keeps working after the first quits
    second.send("version?");
    second.expect("= 7");
    second.expect("ready");
    second.send("quit");
}
