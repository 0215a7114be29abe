//! Per-sink fanout of the readout stream.
//!
//! Every buffer the readout worker produces is copied once into a
//! reference-counted owner and enqueued on each live subscriber's bounded
//! queue. Each subscriber has its own writer thread, so one stalled sink
//! never blocks the others: a subscriber that falls more than the high-water
//! mark behind is declared dead and dropped from delivery.

use log::{debug, warn};
use nix::errno::Errno;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use timetag_record::RECORD_LENGTH;

pub const DEFAULT_HIGH_WATER: usize = 1000;

const WRITER_WAIT: Duration = Duration::from_millis(100);

/// A subscriber's byte sink plus its close discipline. A borrowed sink's fd
/// is handed back to the process on teardown instead of being closed.
pub struct Sink {
    fd: OwnedFd,
    close_on_removal: bool,
}

impl Sink {
    #[must_use]
    pub fn owned(fd: OwnedFd) -> Self {
        Self { fd, close_on_removal: true }
    }

    #[must_use]
    pub fn borrowed(fd: OwnedFd) -> Self {
        Self { fd, close_on_removal: false }
    }

    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn dispose(self) {
        if !self.close_on_removal {
            let _ = self.fd.into_raw_fd();
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberInfo {
    pub name: String,
    pub fd: RawFd,
    pub lost_records: u64,
    pub dead: bool,
}

struct Subscriber {
    name: String,
    fd: RawFd,
    queue: Arc<BufferQueue>,
    lost_records: Arc<AtomicU64>,
    writer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct QueueState {
    buffers: VecDeque<Arc<[u8]>>,
    /// Bytes of the head buffer already written; a short write resumes here.
    head_offset: usize,
    closed: bool,
}

struct BufferQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    high_water: usize,
    dead: AtomicBool,
}

impl BufferQueue {
    /// Declares the subscriber dead, discarding everything queued. Returns
    /// true only for the first transition.
    fn mark_dead(&self) -> bool {
        let first = !self.dead.swap(true, Ordering::AcqRel);
        if first {
            let mut state = self.state.lock().unwrap();
            state.buffers.clear();
            state.head_offset = 0;
        }
        self.ready.notify_all();
        first
    }
}

pub struct SubscriberSet {
    subscribers: Mutex<Vec<Subscriber>>,
    high_water: usize,
}

impl SubscriberSet {
    #[must_use]
    pub fn new() -> Self {
        Self::with_high_water(DEFAULT_HIGH_WATER)
    }

    #[must_use]
    pub fn with_high_water(high_water: usize) -> Self {
        Self { subscribers: Mutex::new(Vec::new()), high_water }
    }

    /// Registers `sink` under `name` and spawns its writer thread. The first
    /// `skip_bytes` bytes that would reach the sink are discarded.
    pub fn add(&self, name: &str, sink: Sink, skip_bytes: usize) {
        let queue = Arc::new(BufferQueue {
            state: Mutex::default(),
            ready: Condvar::new(),
            high_water: self.high_water,
            dead: AtomicBool::new(false),
        });
        let lost_records = Arc::new(AtomicU64::new(0));
        let fd = sink.raw_fd();

        let writer_queue = Arc::clone(&queue);
        let writer_lost = Arc::clone(&lost_records);
        let writer = thread::Builder::new()
            .name(format!("output-{name}"))
            .spawn(move || writer_loop(&writer_queue, sink, &writer_lost, skip_bytes))
            .expect("failed to spawn subscriber writer");

        debug!("added output '{name}' on fd {fd}");
        self.subscribers.lock().unwrap().push(Subscriber {
            name: name.to_owned(),
            fd,
            queue,
            lost_records,
            writer: Some(writer),
        });
    }

    /// Copies `buffer` once and enqueues it on every live subscriber, in the
    /// order the readout worker produced it.
    pub fn publish(&self, buffer: &[u8]) {
        let buffer: Arc<[u8]> = Arc::from(buffer);
        let subscribers = self.subscribers.lock().unwrap();
        for sub in subscribers.iter() {
            if sub.queue.dead.load(Ordering::Acquire) {
                continue;
            }

            let mut state = sub.queue.state.lock().unwrap();
            if state.closed {
                continue;
            }
            state.buffers.push_back(Arc::clone(&buffer));
            let overrun = state.buffers.len() > sub.queue.high_water;
            drop(state);

            if overrun {
                if sub.queue.mark_dead() {
                    warn!("output '{}' fell too far behind, dropping it", sub.name);
                }
            } else {
                sub.queue.ready.notify_one();
            }
        }
    }

    /// Removes every subscriber named `name`, joining its writer and closing
    /// owned sinks. Returns how many were removed.
    pub fn remove(&self, name: &str) -> usize {
        let removed: Vec<Subscriber> = {
            let mut subscribers = self.subscribers.lock().unwrap();
            let mut kept = Vec::with_capacity(subscribers.len());
            let mut removed = Vec::new();
            for sub in subscribers.drain(..) {
                if sub.name == name { removed.push(sub) } else { kept.push(sub) }
            }
            *subscribers = kept;
            removed
        };

        let count = removed.len();
        for sub in removed {
            close_subscriber(sub);
        }
        count
    }

    #[must_use]
    pub fn list(&self) -> Vec<SubscriberInfo> {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|sub| SubscriberInfo {
                name: sub.name.clone(),
                fd: sub.fd,
                lost_records: sub.lost_records.load(Ordering::Relaxed),
                dead: sub.queue.dead.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Joins and closes every subscriber.
    pub fn shutdown(&self) {
        let drained: Vec<Subscriber> = self.subscribers.lock().unwrap().drain(..).collect();
        for sub in drained {
            close_subscriber(sub);
        }
    }
}

impl Default for SubscriberSet {
    fn default() -> Self {
        Self::new()
    }
}

fn close_subscriber(mut sub: Subscriber) {
    sub.queue.state.lock().unwrap().closed = true;
    sub.queue.ready.notify_all();
    if let Some(writer) = sub.writer.take() {
        let _ = writer.join();
    }
    debug!("removed output '{}'", sub.name);
}

fn writer_loop(queue: &BufferQueue, sink: Sink, lost_records: &AtomicU64, mut skip_bytes: usize) {
    loop {
        let (buffer, offset) = {
            let mut state = queue.state.lock().unwrap();
            loop {
                if queue.dead.load(Ordering::Acquire) || state.closed {
                    drop(state);
                    sink.dispose();
                    return;
                }
                if let Some(front) = state.buffers.front() {
                    break (Arc::clone(front), state.head_offset);
                }
                state = queue.ready.wait_timeout(state, WRITER_WAIT).unwrap().0;
            }
        };

        let mut start = offset;
        if skip_bytes > 0 {
            let skipped = skip_bytes.min(buffer.len() - start);
            start += skipped;
            skip_bytes -= skipped;
        }
        if start >= buffer.len() {
            pop_head(queue);
            continue;
        }

        match nix::unistd::write(&sink.fd, &buffer[start..]) {
            Ok(written) if written > 0 && start + written < buffer.len() => {
                queue.state.lock().unwrap().head_offset = start + written;
            }
            Ok(written) if written > 0 => pop_head(queue),
            Ok(_) => {
                warn!("output fd {} accepted no bytes, dropping it", sink.raw_fd());
                queue.mark_dead();
                sink.dispose();
                return;
            }
            Err(Errno::EAGAIN) => {
                // Non-blocking sink with no room: charge the unwritten bytes
                // as lost records and move on
                let unwritten = (buffer.len() - start) as u64;
                lost_records.fetch_add(unwritten.div_ceil(RECORD_LENGTH as u64), Ordering::Relaxed);
                pop_head(queue);
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                warn!("write to output fd {} failed: {e}", sink.raw_fd());
                queue.mark_dead();
                sink.dispose();
                return;
            }
        }
    }
}

fn pop_head(queue: &BufferQueue) {
    let mut state = queue.state.lock().unwrap();
    state.buffers.pop_front();
    state.head_offset = 0;
}
