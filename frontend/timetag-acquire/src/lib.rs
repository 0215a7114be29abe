//! Acquisition daemon for the FPGA timetagger: a control broker that speaks
//! a line-oriented command protocol over stdin or a Unix socket, and a
//! fanout that copies the hot readout stream to any number of registered
//! sinks with per-sink backpressure.

pub mod broker;
pub mod fanout;
pub mod server;
pub mod session;

use log::{debug, info, warn};
use nix::unistd::{User, setegid, seteuid};

/// Subscriber sinks are arbitrary fds; a closed pipe must surface as EPIPE
/// on the write, not kill the process.
pub fn ignore_sigpipe() {
    // SAFETY: SIG_IGN installs no handler code
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Drops effective uid/gid to the `timetag` account when one exists.
/// Failure is non-fatal; the daemon keeps running with its current ids.
pub fn drop_privileges() {
    match User::from_name("timetag") {
        Ok(Some(user)) => {
            if let Err(e) = setegid(user.gid).and_then(|()| seteuid(user.uid)) {
                warn!("could not drop privileges to timetag: {e}");
            } else {
                info!("dropped privileges to the timetag account");
            }
        }
        Ok(None) => debug!("no timetag account, keeping current ids"),
        Err(e) => warn!("timetag account lookup failed: {e}"),
    }
}
