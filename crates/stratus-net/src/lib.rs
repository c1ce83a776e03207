//! Backend-agnostic client/server transport layer.
//!
//! Connections are raw byte streams (framing and the application protocol
//! live above this crate) carried by one of two backends: direct TCP
//! sockets, or — behind the `reliable` feature — a reliable-ordered
//! messaging library over UDP. Both present the same contract:
//!
//! - [`Connection`]: bounded-blocking exact reads for handshakes,
//!   non-blocking pulls for the steady state, and writes that enqueue to a
//!   per-backend background worker instead of touching the wire.
//! - [`ListenSocket`] / [`PollGroup`]: non-blocking accepts and grouped
//!   read-readiness checks.
//! - [`ConnectionProvider`]: the backend factory, owned by an explicitly
//!   constructed [`NetContext`].
//!
//! Connections can transparently switch to streaming compression mid-life;
//! once enabled, all subsequent traffic passes through the codec.

mod compress;
mod connection;
mod context;
mod error;
mod poll;
mod readiness;
mod tcp;
mod writer;

#[cfg(feature = "reliable")]
mod reliable;

pub use compress::StreamCompressor;
pub use connection::{
    Connection, ConnectionProvider, IpVersions, ListenSocket, PollGroup, ProviderType,
    ReadOutcome,
};
pub use context::NetContext;
pub use error::{CodecError, NetError, NetResult, socket_error_message};
pub use poll::{
    DescriptorSet, DummyDescriptorSet, PollDescriptorSet, PollEventType, RawDescriptor,
    SelectDescriptorSet, default_descriptor_set,
};
pub use tcp::{TcpConnection, TcpListenSocket, TcpPollGroup, TcpProvider};
pub use writer::PendingWritesManager;

#[cfg(feature = "reliable")]
pub use reliable::{ReliableConnection, ReliableListenSocket, ReliablePollGroup, ReliableProvider};
