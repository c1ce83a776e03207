//! The TCP listen socket.
//!
//! Listens on all local addresses for a port. Preferably one dual-stack IPv6
//! socket serves both families; where IPv4-mapped addresses are unavailable,
//! separate IPv4 and IPv6 sockets are kept, and accepting checks both.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Weak;

use socket2::Socket;

use crate::connection::{IpVersions, ListenSocket};
use crate::error::{NetError, NetResult, io_would_block};
use crate::writer::PendingWritesManager;

use super::connection::TcpConnection;
use super::socket::{create_listen_socket, prepare_socket};

const LISTEN_BACKLOG: i32 = 128;

/// Accepting side of the TCP backend.
pub struct TcpListenSocket {
    v4: Option<Socket>,
    v6: Option<Socket>,
    dual_stack: bool,
    manager: Weak<PendingWritesManager>,
}

impl TcpListenSocket {
    pub(crate) fn open(port: u16, manager: Weak<PendingWritesManager>) -> NetResult<Self> {
        let mut last_err: Option<std::io::Error> = None;

        let (v6, dual_stack) = match create_listen_socket(
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port),
            LISTEN_BACKLOG,
        ) {
            Ok((socket, dual)) => (Some(socket), dual),
            Err(err) => {
                tracing::info!("failed to open IPv6 listen socket on port {port}: {err}");
                last_err = Some(err);
                (None, false)
            }
        };

        // A dual-stack IPv6 socket covers IPv4 too; otherwise bind IPv4
        // separately.
        let v4 = if dual_stack {
            None
        } else {
            match create_listen_socket(
                SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
                LISTEN_BACKLOG,
            ) {
                Ok((socket, _)) => Some(socket),
                Err(err) => {
                    tracing::info!("failed to open IPv4 listen socket on port {port}: {err}");
                    last_err = Some(err);
                    None
                }
            }
        };

        if v4.is_none() && v6.is_none() {
            let err = last_err.expect("both listen sockets failed without an error");
            tracing::error!("could not listen on port {port}: {err}");
            return Err(NetError::from_io(&err));
        }

        tracing::debug!(
            "listening on port {port} (ipv6: {}, ipv4: {}, dual-stack: {dual_stack})",
            v6.is_some(),
            v4.is_some() || dual_stack,
        );
        Ok(Self {
            v4,
            v6,
            dual_stack,
            manager,
        })
    }

    /// Local address of one of the underlying sockets, for diagnostics and
    /// tests (the IPv6 socket wins when both exist).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.v6
            .as_ref()
            .or(self.v4.as_ref())
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }
}

impl ListenSocket for TcpListenSocket {
    type Connection = TcpConnection;

    fn accept(&self) -> NetResult<Option<TcpConnection>> {
        for socket in [self.v6.as_ref(), self.v4.as_ref()].into_iter().flatten() {
            match socket.accept() {
                Ok((accepted, peer)) => {
                    if let Err(err) = prepare_socket(&accepted) {
                        tracing::warn!("failed to prepare accepted socket: {err}; dropping it");
                        continue;
                    }
                    let peer = peer
                        .as_socket()
                        .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
                    tracing::debug!("incoming connection from [{peer}]");
                    return Ok(Some(TcpConnection::from_socket(
                        accepted,
                        peer,
                        self.manager.clone(),
                    )));
                }
                Err(ref err) if io_would_block(err) => continue,
                Err(err) => {
                    tracing::error!("accept failed: {err}");
                    continue;
                }
            }
        }
        Ok(None)
    }

    fn supported_ip_versions(&self) -> IpVersions {
        let mut versions = IpVersions::NONE;
        if self.v4.is_some() || self.dual_stack {
            versions = versions | IpVersions::V4;
        }
        if self.v6.is_some() {
            versions = versions | IpVersions::V6;
        }
        versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::poll::{PollEventType, default_descriptor_set};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn manager() -> Arc<PendingWritesManager> {
        Arc::new(PendingWritesManager::new(
            "test-listen-writes",
            default_descriptor_set(PollEventType::Writable),
        ))
    }

    fn accept_one(listener: &TcpListenSocket) -> TcpConnection {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(conn) = listener.accept().unwrap() {
                return conn;
            }
            assert!(Instant::now() < deadline, "no connection accepted in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_accept_returns_none_without_pending_connections() {
        let mgr = manager();
        let listener = TcpListenSocket::open(0, Arc::downgrade(&mgr)).unwrap();
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn test_accepts_incoming_connection() {
        let mgr = manager();
        let listener = TcpListenSocket::open(0, Arc::downgrade(&mgr)).unwrap();
        let addr = listener.local_addr().unwrap();
        let host = if addr.is_ipv6() { "::1" } else { "127.0.0.1" };

        let _client = std::net::TcpStream::connect((host, addr.port())).unwrap();
        let conn = accept_one(&listener);
        assert!(conn.is_valid());
    }

    #[test]
    fn test_reports_supported_ip_versions() {
        let mgr = manager();
        let listener = TcpListenSocket::open(0, Arc::downgrade(&mgr)).unwrap();
        let versions = listener.supported_ip_versions();
        assert_ne!(versions, IpVersions::NONE);
    }
}
