//! Error and result types for the transport layer.
//!
//! Every fallible operation returns [`NetResult`]. Errors are grouped into a
//! small set of categories: OS socket errors (carried as raw error codes),
//! host-resolution failures, compression-codec failures, and reliable-backend
//! result codes. Socket error messages come from a fixed English table rather
//! than the OS, so log lines and error comparisons are stable regardless of
//! the system locale.

use std::io;

/// Result alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;

/// Platform error codes used by the transport layer.
///
/// Re-exported from `libc` on Unix; defined from the Winsock constants on
/// Windows so the rest of the crate can compare codes without `cfg` noise.
#[cfg(unix)]
pub(crate) mod codes {
    pub use libc::{
        EADDRINUSE, EAGAIN, EBADF, ECONNABORTED, ECONNREFUSED, ECONNRESET, EHOSTUNREACH,
        EINPROGRESS, EINTR, EINVAL, EISCONN, ENETDOWN, ENETRESET, ENETUNREACH, ENOTCONN,
        ENOTSOCK, EPIPE, ETIMEDOUT, EWOULDBLOCK,
    };
}

#[cfg(windows)]
pub(crate) mod codes {
    use windows_sys::Win32::Networking::WinSock as ws;

    pub const EADDRINUSE: i32 = ws::WSAEADDRINUSE;
    pub const EAGAIN: i32 = ws::WSAEWOULDBLOCK;
    pub const EBADF: i32 = ws::WSAEBADF;
    pub const ECONNABORTED: i32 = ws::WSAECONNABORTED;
    pub const ECONNREFUSED: i32 = ws::WSAECONNREFUSED;
    pub const ECONNRESET: i32 = ws::WSAECONNRESET;
    pub const EHOSTUNREACH: i32 = ws::WSAEHOSTUNREACH;
    pub const EINPROGRESS: i32 = ws::WSAEINPROGRESS;
    pub const EINTR: i32 = ws::WSAEINTR;
    pub const EINVAL: i32 = ws::WSAEINVAL;
    pub const EISCONN: i32 = ws::WSAEISCONN;
    pub const ENETDOWN: i32 = ws::WSAENETDOWN;
    pub const ENETRESET: i32 = ws::WSAENETRESET;
    pub const ENETUNREACH: i32 = ws::WSAENETUNREACH;
    pub const ENOTCONN: i32 = ws::WSAENOTCONN;
    pub const ENOTSOCK: i32 = ws::WSAENOTSOCK;
    pub const EPIPE: i32 = ws::WSAESHUTDOWN;
    pub const ETIMEDOUT: i32 = ws::WSAETIMEDOUT;
    pub const EWOULDBLOCK: i32 = ws::WSAEWOULDBLOCK;
}

/// Render a socket error code as a fixed English message.
///
/// The OS `strerror` output depends on the system locale, which makes logs
/// hard to grep and breaks any comparison against expected message text, so
/// the common codes are spelled out here and everything else falls back to a
/// generic string.
pub fn socket_error_message(code: i32) -> &'static str {
    match code {
        0 => "no error",
        c if c == codes::EINTR => "interrupted system call",
        c if c == codes::EBADF => "bad socket descriptor",
        c if c == codes::EINVAL => "invalid argument",
        c if c == codes::EWOULDBLOCK || c == codes::EAGAIN => "operation would block",
        c if c == codes::EINPROGRESS => "operation now in progress",
        c if c == codes::ENOTSOCK => "socket operation on non-socket",
        c if c == codes::EADDRINUSE => "address already in use",
        c if c == codes::ENETDOWN => "network is down",
        c if c == codes::ENETUNREACH => "network is unreachable",
        c if c == codes::ENETRESET => "network connection reset",
        c if c == codes::ECONNABORTED => "connection aborted",
        c if c == codes::ECONNRESET => "connection reset by peer",
        c if c == codes::EISCONN => "socket is already connected",
        c if c == codes::ENOTCONN => "socket is not connected",
        c if c == codes::ETIMEDOUT => "connection timed out",
        c if c == codes::ECONNREFUSED => "connection refused",
        c if c == codes::EHOSTUNREACH => "no route to host",
        c if c == codes::EPIPE => "broken pipe",
        _ => "unknown socket error",
    }
}

/// Errors reported by the streaming compression adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// One of the two stream contexts could not be initialized.
    #[error("compression stream initialization failed")]
    Init,
    /// The deflater rejected its input or internal state.
    #[error("compression failed: {0}")]
    Compress(String),
    /// The inflater hit corrupt data, a dictionary request, or ran out of
    /// memory.
    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// A categorized transport error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// An OS-level socket error, identified by its raw error code.
    #[error("socket error {code}: {}", socket_error_message(*.code))]
    Socket {
        /// Raw `errno` / `WSAGetLastError` value.
        code: i32,
    },
    /// Host name resolution failed.
    #[error("failed to resolve {host}: {detail}")]
    Resolve {
        /// The host string that was being resolved.
        host: String,
        /// Resolver diagnostic text.
        detail: String,
    },
    /// A compression-codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A reliable-messaging backend result code, rendered as text so callers
    /// never need to branch on the backend type.
    #[error("messaging backend error: {0}")]
    Messaging(String),
}

impl NetError {
    /// Error for an invalid or already-released connection handle.
    pub(crate) fn bad_descriptor() -> Self {
        NetError::Socket {
            code: codes::EBADF,
        }
    }

    /// Error for an operation that exceeded its deadline.
    pub(crate) fn timed_out() -> Self {
        NetError::Socket {
            code: codes::ETIMEDOUT,
        }
    }

    /// Error for a peer that closed the stream.
    pub(crate) fn connection_reset() -> Self {
        NetError::Socket {
            code: codes::ECONNRESET,
        }
    }

    /// Wrap a raw socket error code.
    pub(crate) fn socket(code: i32) -> Self {
        NetError::Socket { code }
    }

    /// Translate an `io::Error` from a socket call into the socket category.
    pub(crate) fn from_io(err: &io::Error) -> Self {
        NetError::Socket {
            code: err.raw_os_error().unwrap_or(codes::EINVAL),
        }
    }

    /// True for errors that mean "retry later", not "connection is broken".
    pub fn is_would_block(&self) -> bool {
        matches!(self, NetError::Socket { code }
            if *code == codes::EWOULDBLOCK || *code == codes::EAGAIN)
    }

    /// True for an interrupted system call.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, NetError::Socket { code } if *code == codes::EINTR)
    }

    /// True when an operation failed because its deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Socket { code } if *code == codes::ETIMEDOUT)
    }
}

/// True when an `io::Error` is the non-blocking "no data yet" result.
pub(crate) fn io_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// True when an `io::Error` is an interrupted system call.
pub(crate) fn io_interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}
