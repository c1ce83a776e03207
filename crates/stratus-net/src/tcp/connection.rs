//! The direct-TCP connection type.
//!
//! A [`TcpConnection`] is the caller-facing handle; the state the background
//! write worker and poll groups need lives in a shared [`TcpCore`]. The
//! pending-writes queue holds a strong reference to the core whenever bytes
//! are queued, which is what defers teardown until the queue drains after the
//! caller drops its handle.

use std::io::Read;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use socket2::Socket;

use crate::compress::StreamCompressor;
use crate::connection::{Connection, ReadOutcome};
use crate::error::{NetError, NetResult, codes, io_interrupted, io_would_block};
use crate::poll::{PollEventType, RawDescriptor, default_descriptor_set};
use crate::readiness::ReadinessSource;
use crate::writer::{PendingWritesManager, RawSend, WriteHandle, sticky_error};

use super::socket::raw_descriptor;

/// Extra room when receiving a raw chunk for the decompressor, so one
/// receive usually carries enough compressed input to fill the caller's
/// buffer.
const INFLATE_CHUNK_SLACK: usize = 1000;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: i32 = 0;

/// Connection state shared between the caller, the write worker, and poll
/// groups.
pub(crate) struct TcpCore {
    socket: Socket,
    text_address: String,
    valid: AtomicBool,
    ready: AtomicBool,
    read_disconnected: AtomicBool,
    write_error: Mutex<Option<NetError>>,
    /// Present once compression is enabled; never removed afterwards.
    compressor: Mutex<Option<StreamCompressor>>,
}

impl TcpCore {
    pub(crate) fn raw_descriptor(&self) -> RawDescriptor {
        raw_descriptor(&self.socket)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Receive into `buf`, retrying interrupted calls.
    fn recv_raw(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match (&self.socket).read(buf) {
                Err(ref err) if io_interrupted(err) => continue,
                other => return other,
            }
        }
    }

    /// Whether the link still looks connected.
    ///
    /// A socket that polls readable but has zero bytes to peek is a closed
    /// stream; that is how a dead peer shows up on the write side.
    fn probe_link(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        let mut set = default_descriptor_set(PollEventType::Readable);
        set.add(self.raw_descriptor());
        match set.poll(Some(Duration::ZERO)) {
            Err(_) => false,
            Ok(0) => true,
            Ok(_) => {
                let mut probe = [MaybeUninit::<u8>::uninit(); 1];
                match self.socket.peek(&mut probe) {
                    Ok(0) => false,
                    Ok(_) => true,
                    Err(ref err) if io_would_block(err) => true,
                    Err(_) => false,
                }
            }
        }
    }
}

impl Drop for TcpCore {
    fn drop(&mut self) {
        tracing::trace!("releasing connection to [{}]", self.text_address);
    }
}

impl WriteHandle for TcpCore {
    fn descriptor(&self) -> Option<RawDescriptor> {
        Some(self.raw_descriptor())
    }

    fn raw_send(&self, bytes: &[u8]) -> RawSend {
        if !self.is_valid() {
            return RawSend::Fatal(NetError::bad_descriptor());
        }
        match self.socket.send_with_flags(bytes, SEND_FLAGS) {
            Ok(n) => RawSend::Sent(n),
            Err(ref err) if io_would_block(err) => RawSend::WouldBlock,
            Err(ref err) if io_interrupted(err) => RawSend::Interrupted,
            Err(err) => RawSend::Fatal(NetError::from_io(&err)),
        }
    }

    fn link_alive(&self) -> bool {
        self.probe_link()
    }

    fn record_write_error(&self, err: NetError) {
        let mut slot = self.write_error.lock().expect("write error slot poisoned");
        // Keep the first failure; later ones are a consequence of it.
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn peer_label(&self) -> String {
        self.text_address.clone()
    }
}

impl ReadinessSource for TcpCore {
    fn descriptor(&self) -> RawDescriptor {
        self.raw_descriptor()
    }

    fn has_buffered_input(&self) -> bool {
        self.compressor
            .lock()
            .expect("compressor lock poisoned")
            .as_ref()
            .is_some_and(|c| c.has_buffered_input())
    }

    fn set_read_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

/// A direct-TCP byte-stream connection.
pub struct TcpConnection {
    core: Arc<TcpCore>,
    manager: Weak<PendingWritesManager>,
}

impl TcpConnection {
    /// Wrap an already-connected, already-prepared socket.
    pub(crate) fn from_socket(
        socket: Socket,
        peer: SocketAddr,
        manager: Weak<PendingWritesManager>,
    ) -> Self {
        Self {
            core: Arc::new(TcpCore {
                socket,
                text_address: peer.to_string(),
                valid: AtomicBool::new(true),
                ready: AtomicBool::new(false),
                read_disconnected: AtomicBool::new(false),
                write_error: Mutex::new(None),
                compressor: Mutex::new(None),
            }),
            manager,
        }
    }

    pub(crate) fn core(&self) -> &Arc<TcpCore> {
        &self.core
    }

    fn writes(&self) -> NetResult<Arc<PendingWritesManager>> {
        self.manager.upgrade().ok_or_else(|| {
            tracing::warn!("write on [{}] after provider shutdown", self.core.text_address);
            NetError::bad_descriptor()
        })
    }
}

impl Connection for TcpConnection {
    fn read_exact(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> NetResult<()> {
        if !self.core.is_valid() {
            return Err(NetError::bad_descriptor());
        }
        // Handshakes run before compression is enabled; afterwards the raw
        // stream is no longer addressable in exact byte counts.
        debug_assert!(!self.is_compressed(), "read_exact on a compressed connection");
        if self.is_compressed() {
            return Err(NetError::socket(codes::EINVAL));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut set = default_descriptor_set(PollEventType::Readable);
        let mut received = 0;
        while received < buf.len() {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(NetError::timed_out());
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            set.clear();
            set.add(self.core.raw_descriptor());
            if set.poll(wait)? == 0 {
                tracing::debug!("read on [{}] timed out", self.core.text_address);
                return Err(NetError::timed_out());
            }

            match self.core.recv_raw(&mut buf[received..]) {
                Ok(0) => {
                    self.core.read_disconnected.store(true, Ordering::Release);
                    return Err(NetError::connection_reset());
                }
                Ok(n) => received += n,
                Err(ref err) if io_would_block(err) => continue,
                Err(err) => return Err(NetError::from_io(&err)),
            }
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
                let mut chunk = vec![0u8; buf.len() + INFLATE_CHUNK_SLACK];
                match self.core.recv_raw(&mut chunk) {
                    Ok(0) => {
                        self.core.read_disconnected.store(true, Ordering::Release);
                        return Ok(ReadOutcome::default());
                    }
                    Ok(n) => {
                        raw_bytes = n;
                        codec.feed_input(&chunk[..n]);
                    }
                    Err(ref err) if io_would_block(err) => {
                        return Ok(ReadOutcome::default());
                    }
                    Err(err) => return Err(NetError::from_io(&err)),
                }
            }
            let bytes = codec.decompress(buf)?;
            return Ok(ReadOutcome { bytes, raw_bytes });
        }
        drop(compressor);

        match self.core.recv_raw(buf) {
            Ok(n) => {
                if n == 0 {
                    self.core.read_disconnected.store(true, Ordering::Release);
                }
                self.core.ready.store(false, Ordering::Release);
                Ok(ReadOutcome {
                    bytes: n,
                    raw_bytes: n,
                })
            }
            Err(ref err) if io_would_block(err) => {
                self.core.ready.store(false, Ordering::Release);
                Ok(ReadOutcome::default())
            }
            Err(err) => Err(NetError::from_io(&err)),
        }
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
                // Compressed path: output reaches the queue on flush.
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
                    self.core.text_address
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

    fn set_nagle(&self, enabled: bool) -> NetResult<()> {
        self.core
            .socket
            .set_nodelay(!enabled)
            .map_err(|e| NetError::from_io(&e))
    }

    fn text_address(&self) -> String {
        self.core.text_address.clone()
    }

    fn is_valid(&self) -> bool {
        self.core.is_valid()
    }

    fn connection_status(&self) -> NetResult<()> {
        sticky_error(&self.core.write_error)?;
        if !self.core.is_valid() {
            return Err(NetError::bad_descriptor());
        }
        if self.core.read_disconnected.load(Ordering::Acquire) || !self.core.probe_link() {
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
