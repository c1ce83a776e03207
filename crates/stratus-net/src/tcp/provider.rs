//! The direct-TCP backend factory.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::connection::{Connection, ConnectionProvider, ProviderType};
use crate::error::{NetError, NetResult};
use crate::poll::{DescriptorSet, PollEventType, default_descriptor_set};
use crate::writer::PendingWritesManager;

use super::connection::TcpConnection;
use super::listener::TcpListenSocket;
use super::poll_group::TcpPollGroup;
use super::socket::connect_with_timeout;

/// Provider for direct TCP socket connections.
///
/// Owns the backend's pending-writes worker; connections hold a weak
/// reference to it, so they outlive provider shutdown gracefully (their
/// writes then fail instead of dangling).
pub struct TcpProvider {
    manager: Arc<PendingWritesManager>,
}

impl TcpProvider {
    /// Backend-global setup: starts the pending-writes worker.
    pub fn new() -> Self {
        Self {
            manager: Arc::new(PendingWritesManager::new(
                "tcp-pending-writes",
                default_descriptor_set(PollEventType::Writable),
            )),
        }
    }

    /// Stop the pending-writes worker, abandoning queued data. Idempotent.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    fn manager_ref(&self) -> Weak<PendingWritesManager> {
        Arc::downgrade(&self.manager)
    }
}

impl Default for TcpProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared host resolution; the reliable backend delegates here too.
pub(crate) fn resolve(host: &str, port: u16) -> NetResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| NetError::Resolve {
            host: host.to_string(),
            detail: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(NetError::Resolve {
            host: host.to_string(),
            detail: "no addresses found".to_string(),
        });
    }
    Ok(addrs)
}

/// Try each resolved address in order; first success wins.
fn connect_any(
    addrs: &[SocketAddr],
    timeout: Duration,
    manager: Weak<PendingWritesManager>,
) -> NetResult<TcpConnection> {
    let mut last_err = NetError::bad_descriptor();
    for addr in addrs {
        match connect_with_timeout(*addr, timeout) {
            Ok(socket) => {
                return Ok(TcpConnection::from_socket(socket, *addr, manager));
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

impl ConnectionProvider for TcpProvider {
    type Connection = TcpConnection;
    type ListenSocket = TcpListenSocket;
    type PollGroup = TcpPollGroup;

    fn provider_type(&self) -> ProviderType {
        ProviderType::Tcp
    }

    fn resolve_host(&self, host: &str, port: u16) -> NetResult<Vec<SocketAddr>> {
        resolve(host, port)
    }

    fn open_listen_socket(&self, port: u16) -> NetResult<TcpListenSocket> {
        TcpListenSocket::open(port, self.manager_ref())
    }

    fn open_client_connection(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> NetResult<TcpConnection> {
        let addrs = resolve(host, port)?;
        connect_any(&addrs, timeout, self.manager_ref())
    }

    fn open_client_connection_async(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        on_complete: Box<dyn FnOnce(NetResult<TcpConnection>) + Send + 'static>,
    ) {
        let host = host.to_string();
        let manager = self.manager_ref();
        // Detached worker; the callback is the only way the result leaves.
        let spawned = std::thread::Builder::new()
            .name("tcp-connect".to_string())
            .spawn(move || {
                let result =
                    resolve(&host, port).and_then(|addrs| connect_any(&addrs, timeout, manager));
                on_complete(result);
            });
        if let Err(err) = spawned {
            tracing::error!("failed to spawn connect worker: {err}");
        }
    }

    fn new_poll_group(&self) -> TcpPollGroup {
        TcpPollGroup::new(default_descriptor_set(PollEventType::Readable))
    }

    fn new_descriptor_set(&self, event: PollEventType) -> Box<dyn DescriptorSet> {
        default_descriptor_set(event)
    }

    fn process_connection_state_changes(&self) {
        // Plain sockets have no backend callback queue to pump.
    }

    fn dispose_connection(&self, conn: TcpConnection) {
        // Invalidate first so poll groups stop selecting the connection,
        // then drop its queued writes; the OS handle closes when the last
        // owner releases the core.
        conn.core().invalidate();
        self.manager.discard(conn.core().clone());
        tracing::debug!("disposed connection to [{}]", conn.text_address());
    }
}

impl Drop for TcpProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ListenSocket, PollGroup};
    use std::sync::mpsc;
    use std::time::Instant;

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
    fn test_resolve_localhost() {
        let provider = TcpProvider::new();
        let addrs = provider.resolve_host("localhost", 1234).unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 1234));
    }

    #[test]
    fn test_resolve_failure_is_a_resolve_error() {
        let provider = TcpProvider::new();
        let err = provider
            .resolve_host("host.invalid.example.invalid", 80)
            .unwrap_err();
        assert!(matches!(err, NetError::Resolve { .. }), "got {err:?}");
    }

    #[test]
    fn test_client_connects_to_own_listener() {
        let provider = TcpProvider::new();
        let listener = provider.open_listen_socket(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = provider
            .open_client_connection("localhost", port, Duration::from_secs(5))
            .unwrap();
        let server_side = accept_one(&listener);
        assert!(client.is_valid());
        assert!(server_side.is_valid());
    }

    #[test]
    fn test_async_connect_invokes_callback() {
        let provider = TcpProvider::new();
        let listener = provider.open_listen_socket(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, rx) = mpsc::channel();
        provider.open_client_connection_async(
            "localhost",
            port,
            Duration::from_secs(5),
            Box::new(move |result| {
                let _ = tx.send(result.map(|c| c.text_address()));
            }),
        );

        let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(result.is_ok(), "async connect failed: {result:?}");
        let _server_side = accept_one(&listener);
    }

    #[test]
    fn test_async_connect_reports_failure() {
        let provider = TcpProvider::new();
        let (tx, rx) = mpsc::channel();
        provider.open_client_connection_async(
            "host.invalid.example.invalid",
            9,
            Duration::from_millis(200),
            Box::new(move |result| {
                let _ = tx.send(result.err());
            }),
        );
        let err = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(err.is_some(), "expected the callback to carry an error");
    }

    #[test]
    fn test_dispose_detaches_from_poll_group_before_release() {
        let provider = TcpProvider::new();
        let listener = provider.open_listen_socket(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = provider
            .open_client_connection("localhost", port, Duration::from_secs(5))
            .unwrap();
        let _server_side = accept_one(&listener);

        let mut group = provider.new_poll_group();
        group.add(&client);
        assert_eq!(group.len(), 1);

        provider.dispose_connection(client);
        let _ = group
            .check_connections_readable(Duration::from_millis(20))
            .unwrap();
        assert!(
            group.is_empty(),
            "disposed connection must leave the poll group"
        );
    }

    #[test]
    fn test_connections_survive_provider_shutdown_with_failing_writes() {
        let provider = TcpProvider::new();
        let listener = provider.open_listen_socket(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = provider
            .open_client_connection("localhost", port, Duration::from_secs(5))
            .unwrap();
        let _server_side = accept_one(&listener);

        provider.shutdown();
        let err = client.write(b"too late").unwrap_err();
        assert_eq!(err, NetError::bad_descriptor());
    }
}
