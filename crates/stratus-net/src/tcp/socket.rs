//! Socket creation and option plumbing for the TCP backend.
//!
//! Every socket this backend creates is non-blocking, non-inheritable by
//! child processes, and has `SIGPIPE` suppressed where the platform would
//! otherwise raise it on a broken pipe.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{NetError, NetResult, io_would_block};
use crate::poll::{PollEventType, RawDescriptor, default_descriptor_set};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

/// Raw descriptor of a socket, for polling.
pub(crate) fn raw_descriptor(socket: &Socket) -> RawDescriptor {
    #[cfg(unix)]
    {
        socket.as_raw_fd()
    }
    #[cfg(windows)]
    {
        socket.as_raw_socket()
    }
}

/// Apply the backend's standard socket hygiene.
pub(crate) fn prepare_socket(socket: &Socket) -> std::io::Result<()> {
    socket.set_nonblocking(true)?;
    // Windows handles are created non-inheritable by socket2 itself.
    #[cfg(unix)]
    socket.set_cloexec(true)?;
    // Platforms without MSG_NOSIGNAL suppress SIGPIPE per socket instead.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    if let Err(err) = socket.set_nosigpipe(true) {
        tracing::warn!("failed to set SO_NOSIGPIPE, broken pipes may raise a signal: {err}");
    }
    Ok(())
}

/// True for the error a non-blocking `connect` reports while in progress.
fn connect_in_progress(err: &std::io::Error) -> bool {
    io_would_block(err) || err.raw_os_error() == Some(crate::error::codes::EINPROGRESS)
}

/// Open a non-blocking TCP connection to `addr`, waiting up to `timeout`
/// for the handshake to complete.
pub(crate) fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> NetResult<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetError::from_io(&e))?;
    prepare_socket(&socket).map_err(|e| NetError::from_io(&e))?;

    tracing::debug!("connecting to [{addr}]");
    match socket.connect(&addr.into()) {
        Ok(()) => Ok(socket),
        Err(err) if connect_in_progress(&err) => {
            if timeout.is_zero() {
                return Err(NetError::from_io(&err));
            }
            // Wait for the socket to become writable, then read back the
            // deferred connect result.
            let mut set = default_descriptor_set(PollEventType::Writable);
            set.add(raw_descriptor(&socket));
            if set.poll(Some(timeout))? == 0 {
                tracing::debug!("timed out connecting to [{addr}]");
                return Err(NetError::timed_out());
            }
            match socket.take_error() {
                Ok(None) => Ok(socket),
                Ok(Some(err)) => {
                    tracing::debug!("failed to connect to [{addr}]: {err}");
                    Err(NetError::from_io(&err))
                }
                Err(err) => Err(NetError::from_io(&err)),
            }
        }
        Err(err) => {
            tracing::debug!("failed to start connecting to [{addr}]: {err}");
            Err(NetError::from_io(&err))
        }
    }
}

/// Create a listening socket for one address family.
///
/// For IPv6, dual-stack mode is requested; `Ok((socket, dual_stack))`
/// reports whether the socket will also accept IPv4-mapped peers.
pub(crate) fn create_listen_socket(
    addr: SocketAddr,
    backlog: i32,
) -> std::io::Result<(Socket, bool)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    prepare_socket(&socket)?;

    if let Err(err) = socket.set_reuse_address(true) {
        tracing::warn!("failed to set SO_REUSEADDR on listen socket: {err}");
    }

    let mut dual_stack = false;
    if addr.is_ipv6() {
        match socket.set_only_v6(false) {
            Ok(()) => dual_stack = true,
            Err(err) => {
                tracing::info!("IPv4-mapped IPv6 unavailable, falling back to two sockets: {err}");
            }
        }
    }

    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok((socket, dual_stack))
}
