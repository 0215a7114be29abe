//! Control-socket server: binds the listening socket with the documented
//! permission scheme and runs one session thread per client.

use crate::broker::Broker;
use crate::session::{SocketSession, drive};
use log::{info, warn};
use nix::unistd::Group;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use timetag_device::UsbTransport;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Binds the control socket, replacing any stale inode. Permissions open to
/// 0660 with group ownership when a `timetag` group exists, 0666 otherwise.
pub fn bind_control_socket(path: &Path) -> io::Result<UnixListener> {
    let _ = fs::remove_file(path);
    let listener = UnixListener::bind(path)?;

    match Group::from_name("timetag") {
        Ok(Some(group)) => {
            std::os::unix::fs::chown(path, None, Some(group.gid.as_raw()))?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;
        }
        _ => fs::set_permissions(path, fs::Permissions::from_mode(0o666))?,
    }

    info!("listening on control socket {}", path.display());
    Ok(listener)
}

/// Accepts control clients until `stop` is set, spawning one session thread
/// per client. Sessions themselves end on `quit` or client EOF.
pub fn serve<T: UsbTransport + 'static>(
    listener: UnixListener,
    broker: Arc<Broker<T>>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("control-accept".into())
        .spawn(move || {
            if let Err(e) = listener.set_nonblocking(true) {
                warn!("cannot poll control socket: {e}");
                return;
            }

            while !stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let broker = Arc::clone(&broker);
                        let spawned =
                            thread::Builder::new().name("control-client".into()).spawn(move || {
                                let mut session = SocketSession::new(stream);
                                if let Err(e) = drive(&broker, &mut session) {
                                    warn!("control session ended: {e}");
                                }
                            });
                        if let Err(e) = spawned {
                            warn!("could not spawn control session: {e}");
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                    Err(e) => {
                        warn!("accept on control socket failed: {e}");
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        })
        .expect("failed to spawn accept thread")
}
