//! Transport-agnostic connection, listen-socket, and poll-group contracts.
//!
//! Each backend (direct TCP, reliable messaging) supplies its own concrete
//! types; higher layers stay generic over [`ConnectionProvider`] and never
//! name a backend. The associated types tie a provider's connections, listen
//! sockets, and poll groups together, so putting a connection into a poll
//! group of the wrong backend is a compile error rather than a runtime
//! assertion.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::NetResult;
use crate::poll::{DescriptorSet, PollEventType};

/// The closed set of transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderType {
    /// Direct TCP sockets.
    Tcp,
    /// Reliable-ordered messaging over UDP.
    #[cfg(feature = "reliable")]
    Reliable,
}

/// Which IP versions a listen socket accepts, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpVersions(u8);

impl IpVersions {
    /// No address family available.
    pub const NONE: IpVersions = IpVersions(0);
    /// IPv4 connections are accepted.
    pub const V4: IpVersions = IpVersions(0b01);
    /// IPv6 connections are accepted.
    pub const V6: IpVersions = IpVersions(0b10);

    /// True when every version in `other` is supported.
    pub fn contains(self, other: IpVersions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for IpVersions {
    type Output = IpVersions;

    fn bitor(self, rhs: IpVersions) -> IpVersions {
        IpVersions(self.0 | rhs.0)
    }
}

/// Result of one [`Connection::read_available`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    /// Bytes delivered into the caller's buffer (decompressed when
    /// compression is enabled).
    pub bytes: usize,
    /// Raw bytes pulled off the transport by this call, before
    /// decompression. Zero when the call was served from buffered data.
    pub raw_bytes: usize,
}

/// One established bidirectional byte-stream endpoint.
pub trait Connection: Send {
    /// Read exactly `buf.len()` bytes, waiting up to `timeout` (`None`
    /// waits indefinitely). Used for short protocol handshakes; not
    /// available once compression is enabled.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> NetResult<()>;

    /// Pull whatever is available right now, without blocking.
    ///
    /// With compression enabled this performs at most one raw receive and
    /// one decompression step; data can be delivered across several calls.
    fn read_available(&mut self, buf: &mut [u8]) -> NetResult<ReadOutcome>;

    /// Queue bytes for transmission and return immediately.
    ///
    /// The bytes are not yet on the wire: uncompressed data goes to the
    /// pending-writes queue, compressed data accumulates in the compressor
    /// until [`flush`](Connection::flush).
    fn write(&mut self, buf: &[u8]) -> NetResult<usize>;

    /// Finalize and queue buffered compressed output.
    ///
    /// Returns the raw (compressed) byte count handed to the transmit
    /// queue; a no-op returning 0 on uncompressed connections.
    fn flush(&mut self) -> NetResult<usize>;

    /// Switch all subsequent traffic on this connection to compressed form.
    ///
    /// One-time and idempotent. If the codec fails to initialize the
    /// connection keeps working uncompressed (the failure is logged).
    fn enable_compression(&mut self);

    /// True once compression has been enabled.
    fn is_compressed(&self) -> bool;

    /// Enable or disable Nagle's algorithm. `true` turns `TCP_NODELAY`
    /// off, `false` turns it on.
    fn set_nagle(&self, enabled: bool) -> NetResult<()>;

    /// True when the last poll-group readiness check flagged this
    /// connection as having data to read.
    fn read_ready(&self) -> bool;

    /// Human-readable peer address.
    fn text_address(&self) -> String;

    /// False once the connection has been invalidated by disposal or a
    /// backend-reported close.
    fn is_valid(&self) -> bool;

    /// Check that the link is still usable; returns the sticky write error
    /// or a probe failure otherwise.
    fn connection_status(&self) -> NetResult<()>;

    /// The sticky error recorded by a failed background write, if any.
    fn write_error(&self) -> Option<crate::error::NetError>;

    /// True once the peer has closed its sending side (a zero-byte read
    /// was observed).
    fn read_disconnected(&self) -> bool;

    /// Close the connection.
    ///
    /// If bytes are still queued for transmission, teardown is deferred
    /// until the write worker drains them; otherwise the backend handle is
    /// released immediately.
    fn close(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// A server-side accept socket.
pub trait ListenSocket {
    /// The backend's connection type.
    type Connection: Connection;

    /// Accept one pending connection, or `Ok(None)` when none is waiting.
    /// Never blocks.
    fn accept(&self) -> NetResult<Option<Self::Connection>>;

    /// Which IP versions this socket can accept.
    fn supported_ip_versions(&self) -> IpVersions;
}

/// A group of connections checked together for read readiness.
pub trait PollGroup {
    /// The backend's connection type.
    type Connection: Connection;

    /// Add a connection to the group. Adding the same connection twice is a
    /// programming error (debug-asserted) and otherwise ignored.
    fn add(&mut self, conn: &Self::Connection);

    /// Remove a connection from the group, if present.
    fn remove(&mut self, conn: &Self::Connection);

    /// Wait up to `timeout` for members to become readable; marks each
    /// member's ready flag and returns how many have data waiting.
    fn check_connections_readable(&mut self, timeout: Duration) -> NetResult<usize>;
}

/// Factory and lifecycle owner for one transport backend.
pub trait ConnectionProvider {
    /// The backend's connection type.
    type Connection: Connection + Send + 'static;
    /// The backend's listen-socket type.
    type ListenSocket: ListenSocket<Connection = Self::Connection>;
    /// The backend's poll-group type.
    type PollGroup: PollGroup<Connection = Self::Connection>;

    /// Which backend this provider implements.
    fn provider_type(&self) -> ProviderType;

    /// Resolve a host/port pair to one or more socket addresses.
    fn resolve_host(&self, host: &str, port: u16) -> NetResult<Vec<SocketAddr>>;

    /// Open a listening socket on the given port.
    fn open_listen_socket(&self, port: u16) -> NetResult<Self::ListenSocket>;

    /// Connect to a host, trying each resolved address in order, bounded by
    /// `timeout` per attempt.
    fn open_client_connection(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> NetResult<Self::Connection>;

    /// Fire-and-forget variant of
    /// [`open_client_connection`](ConnectionProvider::open_client_connection):
    /// spawns a detached worker and hands the outcome to `on_complete`.
    fn open_client_connection_async(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        on_complete: Box<dyn FnOnce(NetResult<Self::Connection>) + Send + 'static>,
    );

    /// Create an empty poll group for this backend.
    fn new_poll_group(&self) -> Self::PollGroup;

    /// Create a descriptor set of this backend's preferred strategy.
    fn new_descriptor_set(&self, event: PollEventType) -> Box<dyn DescriptorSet>;

    /// Pump backend state-change processing.
    ///
    /// Runs inline on the caller's thread and may pop accepted or closed
    /// connections into their queues; it must never do expensive work.
    fn process_connection_state_changes(&self);

    /// Forcefully tear a connection down: discard its pending writes and
    /// in-flight backend messages, detach it from any poll group, release
    /// the backend handle, and invalidate the object.
    fn dispose_connection(&self, conn: Self::Connection);
}
