//! The reliable-messaging connection type.
//!
//! The library delivers reliable, ordered messages rather than a byte
//! stream; [`ReliableCore`] re-exposes them as a stream by queueing inbound
//! message payloads and letting reads consume them across message
//! boundaries. Writes go through the backend's pending-writes manager like
//! any other connection; the manager sees this backend as always writable
//! and the core chops oversized queues into message-sized sends.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::compress::StreamCompressor;
use crate::connection::{Connection, ReadOutcome};
use crate::error::{NetError, NetResult};
use crate::poll::RawDescriptor;
use crate::writer::{PendingWritesManager, RawSend, WriteHandle, sticky_error};

use super::endpoint::{EVENT_BATCH, Endpoint, MAX_MESSAGE_BYTES};

/// Inbound message payloads, consumable as a byte stream.
#[derive(Default)]
pub(crate) struct InboundQueue {
    chunks: VecDeque<Vec<u8>>,
    /// Consumed prefix of the front chunk.
    head_pos: usize,
}

impl InboundQueue {
    fn push(&mut self, chunk: Vec<u8>) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Copy queued bytes into `buf`, crossing message boundaries.
    fn pull(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let rest = &front[self.head_pos..];
            let take = rest.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&rest[..take]);
            copied += take;
            self.head_pos += take;
            if self.head_pos >= front.len() {
                self.chunks.pop_front();
                self.head_pos = 0;
            }
        }
        copied
    }

    /// Take the remainder of the front message as one owned chunk.
    fn pull_chunk(&mut self) -> Option<Vec<u8>> {
        let front = self.chunks.pop_front()?;
        let chunk = if self.head_pos == 0 {
            front
        } else {
            front[self.head_pos..].to_vec()
        };
        self.head_pos = 0;
        Some(chunk)
    }
}

/// Connection state shared between the caller, the write worker, poll
/// groups, and the endpoint's router.
pub(crate) struct ReliableCore {
    remote: SocketAddr,
    endpoint: Weak<Endpoint>,
    inbound: Mutex<InboundQueue>,
    established: AtomicBool,
    valid: AtomicBool,
    ready: AtomicBool,
    read_disconnected: AtomicBool,
    write_error: Mutex<Option<NetError>>,
    compressor: Mutex<Option<StreamCompressor>>,
}

impl ReliableCore {
    pub(crate) fn new(remote: SocketAddr, endpoint: Weak<Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            remote,
            endpoint,
            inbound: Mutex::new(InboundQueue::default()),
            established: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            read_disconnected: AtomicBool::new(false),
            write_error: Mutex::new(None),
            compressor: Mutex::new(None),
        })
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn endpoint(&self) -> Weak<Endpoint> {
        self.endpoint.clone()
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub(crate) fn mark_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    /// Called by the router when the library reports the peer gone.
    pub(crate) fn mark_closed(&self) {
        self.read_disconnected.store(true, Ordering::Release);
        self.invalidate();
        let mut slot = self.write_error.lock().expect("write error slot poisoned");
        if slot.is_none() {
            *slot = Some(NetError::connection_reset());
        }
    }

    pub(crate) fn push_inbound(&self, chunk: Vec<u8>) {
        self.inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .push(chunk);
    }

    pub(crate) fn has_inbound(&self) -> bool {
        !self
            .inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .is_empty()
    }

    pub(crate) fn has_buffered_input(&self) -> bool {
        self.compressor
            .lock()
            .expect("compressor lock poisoned")
            .as_ref()
            .is_some_and(|c| c.has_buffered_input())
    }

    pub(crate) fn set_read_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

impl WriteHandle for ReliableCore {
    fn descriptor(&self) -> Option<RawDescriptor> {
        // The library buffers sends internally; there is nothing to poll.
        None
    }

    fn raw_send(&self, bytes: &[u8]) -> RawSend {
        if !self.is_valid() {
            return RawSend::Fatal(NetError::bad_descriptor());
        }
        let Some(endpoint) = self.endpoint.upgrade() else {
            return RawSend::Fatal(NetError::Messaging(
                "messaging endpoint is gone".to_string(),
            ));
        };
        let take = bytes.len().min(MAX_MESSAGE_BYTES);
        match endpoint.send_to(self.remote, bytes[..take].to_vec()) {
            Ok(()) => RawSend::Sent(take),
            Err(err) => RawSend::Fatal(err),
        }
    }

    fn record_write_error(&self, err: NetError) {
        let mut slot = self.write_error.lock().expect("write error slot poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn peer_label(&self) -> String {
        self.remote.to_string()
    }
}

/// A reliable-ordered messaging connection.
pub struct ReliableConnection {
    core: Arc<ReliableCore>,
    manager: Weak<PendingWritesManager>,
}

impl ReliableConnection {
    pub(crate) fn new(core: Arc<ReliableCore>, manager: Weak<PendingWritesManager>) -> Self {
        Self { core, manager }
    }

    pub(crate) fn core(&self) -> &Arc<ReliableCore> {
        &self.core
    }

    fn writes(&self) -> NetResult<Arc<PendingWritesManager>> {
        self.manager.upgrade().ok_or_else(NetError::bad_descriptor)
    }

    fn pump_endpoint(&self) {
        if let Some(endpoint) = self.core.endpoint.upgrade() {
            endpoint.pump(EVENT_BATCH);
        }
    }
}

impl Connection for ReliableConnection {
    fn read_exact(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> NetResult<()> {
        if !self.core.is_valid() {
            return Err(NetError::bad_descriptor());
        }
        debug_assert!(!self.is_compressed(), "read_exact on a compressed connection");
        if self.is_compressed() {
            return Err(NetError::socket(crate::error::codes::EINVAL));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut received = 0;
        while received < buf.len() {
            received += self
                .core
                .inbound
                .lock()
                .expect("inbound queue lock poisoned")
                .pull(&mut buf[received..]);
            if received >= buf.len() {
                break;
            }
            if self.core.read_disconnected.load(Ordering::Acquire) {
                return Err(NetError::connection_reset());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(NetError::timed_out());
                }
            }
            self.pump_endpoint();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.core.ready.store(false, Ordering::Release);
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> NetResult<ReadOutcome> {
        if !self.core.is_valid() {
            return Err(NetError::bad_descriptor());
        }
        if buf.is_empty() {
            return Ok(ReadOutcome::default());
        }

        let mut compressor = self.core.compressor.lock().expect("compressor lock poisoned");
        if let Some(codec) = compressor.as_mut() {
            let mut raw_bytes = 0;
            if codec.needs_input() {
                // One backend receive: the next queued message, if any.
                let chunk = self
                    .core
                    .inbound
                    .lock()
                    .expect("inbound queue lock poisoned")
                    .pull_chunk();
                match chunk {
                    Some(chunk) => {
                        raw_bytes = chunk.len();
                        codec.feed_input(&chunk);
                    }
                    None => return Ok(ReadOutcome::default()),
                }
            }
            let bytes = codec.decompress(buf)?;
            return Ok(ReadOutcome { bytes, raw_bytes });
        }
        drop(compressor);

        let n = self
            .core
            .inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .pull(buf);
        if n == 0 {
            self.core.ready.store(false, Ordering::Release);
        }
        Ok(ReadOutcome {
            bytes: n,
            raw_bytes: n,
        })
    }

    fn write(&mut self, buf: &[u8]) -> NetResult<usize> {
        if !self.core.is_valid() {
            return Err(NetError::bad_descriptor());
        }
        sticky_error(&self.core.write_error)?;
        if buf.is_empty() {
            return Ok(0);
        }

        {
            let mut compressor =
                self.core.compressor.lock().expect("compressor lock poisoned");
            if let Some(codec) = compressor.as_mut() {
                codec.compress(buf)?;
                return Ok(buf.len());
            }
        }
        self.writes()?.append(self.core.clone(), buf.to_vec())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> NetResult<usize> {
        sticky_error(&self.core.write_error)?;

        let mut compressor = self.core.compressor.lock().expect("compressor lock poisoned");
        let Some(codec) = compressor.as_mut() else {
            return Ok(0);
        };
        codec.flush_stream()?;
        let out = codec.take_output();
        drop(compressor);

        if out.is_empty() {
            return Ok(0);
        }
        let raw = out.len();
        self.writes()?.append(self.core.clone(), out)?;
        Ok(raw)
    }

    fn enable_compression(&mut self) {
        let mut compressor = self.core.compressor.lock().expect("compressor lock poisoned");
        if compressor.is_some() {
            return;
        }
        match StreamCompressor::new() {
            Ok(codec) => *compressor = Some(codec),
            Err(err) => {
                tracing::warn!(
                    "compression init failed on [{}], staying uncompressed: {err}",
                    self.core.remote
                );
            }
        }
    }

    fn is_compressed(&self) -> bool {
        self.core
            .compressor
            .lock()
            .expect("compressor lock poisoned")
            .is_some()
    }

    fn read_ready(&self) -> bool {
        self.core.ready.load(Ordering::Acquire)
    }

    fn set_nagle(&self, _enabled: bool) -> NetResult<()> {
        // Datagram transport; there is no Nagle to toggle.
        Ok(())
    }

    fn text_address(&self) -> String {
        self.core.remote.to_string()
    }

    fn is_valid(&self) -> bool {
        self.core.is_valid()
    }

    fn connection_status(&self) -> NetResult<()> {
        sticky_error(&self.core.write_error)?;
        if !self.core.is_valid() {
            return Err(NetError::bad_descriptor());
        }
        if self.core.read_disconnected.load(Ordering::Acquire) {
            return Err(NetError::connection_reset());
        }
        Ok(())
    }

    fn write_error(&self) -> Option<NetError> {
        self.core
            .write_error
            .lock()
            .expect("write error slot poisoned")
            .clone()
    }

    fn read_disconnected(&self) -> bool {
        self.core.read_disconnected.load(Ordering::Acquire)
    }
}
