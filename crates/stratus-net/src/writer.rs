//! Asynchronous write submission.
//!
//! Callers never transmit directly: `write`/`flush` hand their bytes to a
//! [`PendingWritesManager`], which queues them per connection and drains the
//! queues from a dedicated worker thread. Each backend runs one manager
//! instance. The worker owns the queue map exclusively; callers communicate
//! through a command channel, which doubles as the wake signal when the
//! worker is idle.
//!
//! Queue entries hold a strong reference to the connection they belong to.
//! A caller that closes a connection with bytes still queued simply drops its
//! own handle; the entry keeps the connection alive until the queue drains
//! (or fails), at which point the worker drops the last reference and the
//! backend handle is released. Closing a connection with an empty queue
//! releases it immediately on the caller's thread.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::error::{NetError, NetResult};
use crate::poll::{DescriptorSet, RawDescriptor};

/// How long one write-readiness poll may block. Kept short so newly queued
/// writes are picked up promptly on the next cycle.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a single backend send attempt.
pub(crate) enum RawSend {
    /// `n` bytes were accepted by the backend (possibly fewer than offered).
    Sent(usize),
    /// The backend cannot accept data right now; retry on a later cycle.
    WouldBlock,
    /// The call was interrupted; retry on the next cycle.
    Interrupted,
    /// The connection is broken; queued bytes for it must be dropped.
    Fatal(NetError),
}

/// The connection-side surface the write worker drives.
///
/// Implemented by each backend's shared connection core. All methods are
/// called from the worker thread while the caller thread may be reading or
/// queueing more data.
pub(crate) trait WriteHandle: Send + Sync {
    /// OS descriptor to poll for write readiness, or `None` when the backend
    /// buffers sends internally and is always writable.
    fn descriptor(&self) -> Option<RawDescriptor>;

    /// Attempt one send of the queued bytes.
    fn raw_send(&self, bytes: &[u8]) -> RawSend;

    /// Probe whether the link is still up. Consulted when a send would block,
    /// to distinguish a slow peer from a dead connection.
    fn link_alive(&self) -> bool {
        true
    }

    /// Record a sticky write error so subsequent writes fail fast.
    fn record_write_error(&self, err: NetError);

    /// Human-readable peer address for log lines.
    fn peer_label(&self) -> String;
}

enum Command {
    Append {
        handle: Arc<dyn WriteHandle>,
        bytes: Vec<u8>,
    },
    Discard {
        handle: Arc<dyn WriteHandle>,
    },
    Shutdown,
}

struct QueueEntry {
    handle: Arc<dyn WriteHandle>,
    buf: Vec<u8>,
}

/// Stable map key for a connection: the address of its shared core.
fn handle_key(handle: &Arc<dyn WriteHandle>) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

/// Background engine that owns all not-yet-transmitted outbound bytes for
/// one backend.
pub struct PendingWritesManager {
    tx: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl PendingWritesManager {
    /// Spawn the worker thread. `set` is the writable-readiness descriptor
    /// set the worker rebuilds every cycle.
    pub(crate) fn new(thread_name: &str, set: Box<dyn DescriptorSet>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || run_worker(rx, set))
            .expect("failed to spawn pending-writes worker thread");
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Queue bytes for transmission on `handle`'s connection.
    ///
    /// Returns immediately; the data is not yet on the wire. Empty appends
    /// are ignored so drained entries never linger with empty buffers.
    /// Fails once the manager has been shut down.
    pub(crate) fn append(&self, handle: Arc<dyn WriteHandle>, bytes: Vec<u8>) -> NetResult<()> {
        if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
            return Err(NetError::bad_descriptor());
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let _ = self.tx.send(Command::Append { handle, bytes });
        Ok(())
    }

    /// Drop any queued bytes for `handle`'s connection without sending them.
    /// Used by forceful disposal.
    pub(crate) fn discard(&self, handle: Arc<dyn WriteHandle>) {
        let _ = self.tx.send(Command::Discard { handle });
    }

    /// Stop the worker, dropping all queued data. Idempotent.
    ///
    /// Only per-connection close guarantees drain-before-destroy; manager
    /// shutdown intentionally abandons whatever is still queued.
    pub fn shutdown(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::Release);
        let worker = self
            .worker
            .lock()
            .expect("pending-writes worker handle lock poisoned")
            .take();
        if let Some(worker) = worker {
            let _ = self.tx.send(Command::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for PendingWritesManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(rx: Receiver<Command>, mut set: Box<dyn DescriptorSet>) {
    let mut queues: HashMap<usize, QueueEntry> = HashMap::new();

    'outer: loop {
        // Idle: with nothing queued, block until the next command arrives.
        if queues.is_empty() {
            match rx.recv() {
                Ok(cmd) => {
                    if apply_command(&mut queues, cmd) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        // Absorb whatever else is already waiting.
        loop {
            match rx.try_recv() {
                Ok(cmd) => {
                    if apply_command(&mut queues, cmd) {
                        break 'outer;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }
        if queues.is_empty() {
            continue;
        }

        // Rebuild the writable set from every connection with queued bytes.
        set.clear();
        let mut os_backed = false;
        for entry in queues.values() {
            if let Some(d) = entry.handle.descriptor() {
                set.add(d);
                os_backed = true;
            }
        }

        if os_backed {
            match set.poll(Some(POLL_INTERVAL)) {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("write readiness poll failed: {err}");
                    continue;
                }
            }
        }

        queues.retain(|_, entry| drain_entry(entry, set.as_ref()));

        // Descriptor-less entries that could not complete have nothing to
        // poll; pace the retry instead of spinning.
        if !queues.is_empty() && !queues.values().any(|e| e.handle.descriptor().is_some()) {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Returns true when the worker should stop.
fn apply_command(queues: &mut HashMap<usize, QueueEntry>, cmd: Command) -> bool {
    match cmd {
        Command::Append { handle, bytes } => {
            debug_assert!(!bytes.is_empty(), "empty appends are filtered at the API");
            match queues.entry(handle_key(&handle)) {
                MapEntry::Occupied(mut e) => e.get_mut().buf.extend_from_slice(&bytes),
                MapEntry::Vacant(v) => {
                    v.insert(QueueEntry { handle, buf: bytes });
                }
            }
            false
        }
        Command::Discard { handle } => {
            queues.remove(&handle_key(&handle));
            false
        }
        Command::Shutdown => {
            queues.clear();
            true
        }
    }
}

/// Drive one connection's queue; returns true when the entry should be kept.
fn drain_entry(entry: &mut QueueEntry, set: &dyn DescriptorSet) -> bool {
    let writable = entry.handle.descriptor().is_none_or(|d| set.is_set(d));
    if !writable {
        return true;
    }

    match entry.handle.raw_send(&entry.buf) {
        RawSend::Sent(n) => {
            entry.buf.drain(..n);
            !entry.buf.is_empty()
        }
        RawSend::Interrupted => true,
        RawSend::WouldBlock => {
            if entry.handle.link_alive() {
                return true;
            }
            tracing::debug!(
                "peer {} went away with writes pending",
                entry.handle.peer_label()
            );
            entry.handle.record_write_error(NetError::connection_reset());
            false
        }
        RawSend::Fatal(err) => {
            tracing::debug!(
                "send to {} failed: {err}; dropping queued bytes",
                entry.handle.peer_label()
            );
            entry.handle.record_write_error(err);
            false
        }
    }
}

/// Convenience for connection code: report a sticky write error, if any.
pub(crate) fn sticky_error(slot: &Mutex<Option<NetError>>) -> NetResult<()> {
    match &*slot.lock().expect("write error slot poisoned") {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::DummyDescriptorSet;
    use std::sync::Weak;
    use std::time::Instant;

    /// Observable side of a [`MockHandle`], held by the test independently
    /// of the handle's own lifetime.
    #[derive(Clone, Default)]
    struct MockWire {
        /// Everything the "wire" has seen, in order.
        sent: Arc<Mutex<Vec<u8>>>,
        /// When true, every send reports `WouldBlock`.
        blocked: Arc<Mutex<bool>>,
        error: Arc<Mutex<Option<NetError>>>,
    }

    /// Scripted backend connection for driving the worker.
    struct MockHandle {
        /// Bytes accepted per send call; mimics a backend with a tiny buffer.
        per_send: usize,
        link_alive: bool,
        wire: MockWire,
    }

    impl MockHandle {
        fn accepting(per_send: usize) -> (Arc<Self>, MockWire) {
            let wire = MockWire::default();
            let handle = Arc::new(Self {
                per_send,
                link_alive: true,
                wire: wire.clone(),
            });
            (handle, wire)
        }

        fn stuck(link_alive: bool) -> (Arc<Self>, MockWire) {
            let wire = MockWire::default();
            *wire.blocked.lock().unwrap() = true;
            let handle = Arc::new(Self {
                per_send: usize::MAX,
                link_alive,
                wire: wire.clone(),
            });
            (handle, wire)
        }
    }

    impl WriteHandle for MockHandle {
        fn descriptor(&self) -> Option<RawDescriptor> {
            None
        }

        fn raw_send(&self, bytes: &[u8]) -> RawSend {
            if *self.wire.blocked.lock().unwrap() {
                return RawSend::WouldBlock;
            }
            let n = bytes.len().min(self.per_send);
            self.wire.sent.lock().unwrap().extend_from_slice(&bytes[..n]);
            RawSend::Sent(n)
        }

        fn link_alive(&self) -> bool {
            self.link_alive
        }

        fn record_write_error(&self, err: NetError) {
            *self.wire.error.lock().unwrap() = Some(err);
        }

        fn peer_label(&self) -> String {
            "mock".to_string()
        }
    }

    fn manager() -> PendingWritesManager {
        PendingWritesManager::new("test-writes", Box::new(DummyDescriptorSet::new()))
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_ten_kilobytes_drain_in_order_through_small_backend() {
        let mgr = manager();
        let (mock, wire) = MockHandle::accepting(1024);
        let data: Vec<u8> = (0..10_240u32).map(|i| (i % 251) as u8).collect();

        // Queue in a few appends, the way repeated write calls would.
        for chunk in data.chunks(3000) {
            mgr.append(mock.clone(), chunk.to_vec()).unwrap();
        }

        assert!(
            wait_until(Duration::from_secs(10), || {
                wire.sent.lock().unwrap().len() == data.len()
            }),
            "all queued bytes must eventually be transmitted"
        );
        assert_eq!(*wire.sent.lock().unwrap(), data, "bytes must stay in order");

        // Once drained, the worker keeps no reference: dropping the caller's
        // handle must free the connection.
        let weak: Weak<MockHandle> = Arc::downgrade(&mock);
        drop(mock);
        assert!(
            wait_until(Duration::from_secs(2), || weak.upgrade().is_none()),
            "drained entry must not keep the connection alive"
        );
    }

    #[test]
    fn test_destruction_deferred_until_queue_drains() {
        let mgr = manager();
        let (mock, wire) = MockHandle::stuck(true);
        let weak: Weak<MockHandle> = Arc::downgrade(&mock);

        mgr.append(mock.clone(), vec![7u8; 256]).unwrap();
        // The caller closes its handle while bytes are still queued.
        drop(mock);

        std::thread::sleep(Duration::from_millis(150));
        assert!(
            weak.upgrade().is_some(),
            "connection with queued bytes must stay alive"
        );

        // Unblock the backend; the queue drains and the last owner drops.
        *wire.blocked.lock().unwrap() = false;
        assert!(
            wait_until(Duration::from_secs(5), || weak.upgrade().is_none()),
            "connection must be destroyed once its queue empties"
        );
        assert_eq!(wire.sent.lock().unwrap().len(), 256);
    }

    #[test]
    fn test_discard_drops_queued_bytes_without_sending() {
        let mgr = manager();
        let (mock, wire) = MockHandle::stuck(true);
        let weak = Arc::downgrade(&mock);

        mgr.append(mock.clone(), vec![1, 2, 3, 4]).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        mgr.discard(mock.clone());
        drop(mock);

        assert!(
            wait_until(Duration::from_secs(2), || weak.upgrade().is_none()),
            "discard must release the worker's reference"
        );
        assert!(
            wire.sent.lock().unwrap().is_empty(),
            "discarded bytes must never reach the wire"
        );
    }

    #[test]
    fn test_dead_link_records_sticky_error_and_drops_entry() {
        let mgr = manager();
        let (mock, wire) = MockHandle::stuck(false);

        mgr.append(mock.clone(), vec![9u8; 64]).unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                wire.error.lock().unwrap().is_some()
            }),
            "a dead link must record a write error"
        );
        let err = wire.error.lock().unwrap().clone().unwrap();
        assert_eq!(err, NetError::connection_reset());
        assert!(wire.sent.lock().unwrap().is_empty());
        drop(mgr);
    }

    #[test]
    fn test_errors_on_one_connection_do_not_stop_others() {
        let mgr = manager();
        let (broken, broken_wire) = MockHandle::stuck(false);
        let (healthy, healthy_wire) = MockHandle::accepting(64);

        mgr.append(broken.clone(), vec![1u8; 32]).unwrap();
        mgr.append(healthy.clone(), vec![2u8; 200]).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                healthy_wire.sent.lock().unwrap().len() == 200
            }),
            "healthy connection must drain despite the broken one"
        );
        assert!(broken_wire.error.lock().unwrap().is_some());
    }

    #[test]
    fn test_empty_append_is_ignored() {
        let mgr = manager();
        let (mock, _wire) = MockHandle::stuck(true);
        let weak = Arc::downgrade(&mock);

        mgr.append(mock.clone(), Vec::new()).unwrap();
        drop(mock);
        assert!(
            wait_until(Duration::from_secs(2), || weak.upgrade().is_none()),
            "an empty append must not create a queue entry"
        );
    }

    #[test]
    fn test_shutdown_abandons_queued_data_and_joins() {
        let mgr = manager();
        let (mock, wire) = MockHandle::stuck(true);
        let weak = Arc::downgrade(&mock);

        mgr.append(mock.clone(), vec![5u8; 128]).unwrap();
        drop(mock);
        std::thread::sleep(Duration::from_millis(100));

        mgr.shutdown();
        assert!(
            weak.upgrade().is_none(),
            "shutdown must clear the queues and release connections"
        );
        assert!(wire.sent.lock().unwrap().is_empty());
        // Second shutdown is a no-op.
        mgr.shutdown();
    }
}
