//! The reliable-messaging backend factory.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::connection::{ConnectionProvider, ProviderType};
use crate::error::{NetError, NetResult, codes};
use crate::poll::{DescriptorSet, DummyDescriptorSet, PollEventType};
use crate::writer::PendingWritesManager;

use super::connection::{ReliableConnection, ReliableCore};
use super::endpoint::{EVENT_BATCH, Endpoint};
use super::listener::ReliableListenSocket;
use super::poll_group::ReliablePollGroup;

/// Provider for reliable-ordered messaging connections over UDP.
///
/// Owns the backend's pending-writes worker and tracks every bound endpoint
/// so [`process_connection_state_changes`] can pump them all from the
/// caller's thread.
///
/// One listen endpoint is active at a time; opening a second while the
/// first is alive fails with an address-in-use error.
///
/// [`process_connection_state_changes`]: ConnectionProvider::process_connection_state_changes
pub struct ReliableProvider {
    manager: Arc<PendingWritesManager>,
    endpoints: Arc<Mutex<Vec<Weak<Endpoint>>>>,
    active_listen: Mutex<Weak<Endpoint>>,
}

impl ReliableProvider {
    /// Backend-global setup: starts the pending-writes worker.
    pub fn new() -> Self {
        Self {
            manager: Arc::new(PendingWritesManager::new(
                "messaging-pending-writes",
                Box::new(DummyDescriptorSet::new()),
            )),
            endpoints: Arc::new(Mutex::new(Vec::new())),
            active_listen: Mutex::new(Weak::new()),
        }
    }

    /// Stop the pending-writes worker and forget all endpoints. Idempotent.
    pub fn shutdown(&self) {
        self.manager.shutdown();
        self.endpoints
            .lock()
            .expect("endpoint list lock poisoned")
            .clear();
        *self
            .active_listen
            .lock()
            .expect("active listen lock poisoned") = Weak::new();
    }

    fn track(endpoints: &Arc<Mutex<Vec<Weak<Endpoint>>>>, endpoint: &Arc<Endpoint>) {
        let mut list = endpoints.lock().expect("endpoint list lock poisoned");
        list.retain(|w| w.upgrade().is_some());
        list.push(Arc::downgrade(endpoint));
    }
}

impl Default for ReliableProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind an ephemeral endpoint of the right family and knock on `addr` until
/// the peer acknowledges or the timeout expires.
fn connect_once(
    addr: SocketAddr,
    timeout: Duration,
    manager: Weak<PendingWritesManager>,
    endpoints: &Arc<Mutex<Vec<Weak<Endpoint>>>>,
) -> NetResult<ReliableConnection> {
    let bind_addr = if addr.is_ipv6() {
        SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
    } else {
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
    };
    let endpoint = Endpoint::bind(bind_addr, false)?;
    ReliableProvider::track(endpoints, &endpoint);

    let core = ReliableCore::new(addr, Arc::downgrade(&endpoint));
    endpoint.register(addr, Arc::downgrade(&core));
    // The connection marker; the server answers with one of its own.
    endpoint.send_to(addr, Vec::new())?;

    let deadline = Instant::now() + timeout;
    loop {
        endpoint.pump(EVENT_BATCH);
        if core.is_established() {
            tracing::debug!("messaging connection to [{addr}] established");
            return Ok(ReliableConnection::new(core, manager));
        }
        if !core.is_valid() {
            return Err(NetError::connection_reset());
        }
        if Instant::now() >= deadline {
            tracing::debug!("timed out connecting to [{addr}]");
            return Err(NetError::timed_out());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn connect_any(
    addrs: &[SocketAddr],
    timeout: Duration,
    manager: Weak<PendingWritesManager>,
    endpoints: &Arc<Mutex<Vec<Weak<Endpoint>>>>,
) -> NetResult<ReliableConnection> {
    let mut last_err = NetError::bad_descriptor();
    for addr in addrs {
        match connect_once(*addr, timeout, manager.clone(), endpoints) {
            Ok(conn) => return Ok(conn),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

impl ConnectionProvider for ReliableProvider {
    type Connection = ReliableConnection;
    type ListenSocket = ReliableListenSocket;
    type PollGroup = ReliablePollGroup;

    fn provider_type(&self) -> ProviderType {
        ProviderType::Reliable
    }

    fn resolve_host(&self, host: &str, port: u16) -> NetResult<Vec<SocketAddr>> {
        crate::tcp::resolve(host, port)
    }

    fn open_listen_socket(&self, port: u16) -> NetResult<ReliableListenSocket> {
        let mut active = self
            .active_listen
            .lock()
            .expect("active listen lock poisoned");
        if active.upgrade().is_some() {
            tracing::warn!("a messaging listen socket is already active");
            return Err(NetError::socket(codes::EADDRINUSE));
        }

        let endpoint = Endpoint::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), true)?;
        Self::track(&self.endpoints, &endpoint);
        *active = Arc::downgrade(&endpoint);
        Ok(ReliableListenSocket::new(
            endpoint,
            Arc::downgrade(&self.manager),
        ))
    }

    fn open_client_connection(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> NetResult<ReliableConnection> {
        let addrs = crate::tcp::resolve(host, port)?;
        connect_any(&addrs, timeout, Arc::downgrade(&self.manager), &self.endpoints)
    }

    fn open_client_connection_async(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        on_complete: Box<dyn FnOnce(NetResult<ReliableConnection>) + Send + 'static>,
    ) {
        let host = host.to_string();
        let manager = Arc::downgrade(&self.manager);
        let endpoints = Arc::clone(&self.endpoints);
        let spawned = std::thread::Builder::new()
            .name("messaging-connect".to_string())
            .spawn(move || {
                let result = crate::tcp::resolve(&host, port)
                    .and_then(|addrs| connect_any(&addrs, timeout, manager, &endpoints));
                on_complete(result);
            });
        if let Err(err) = spawned {
            tracing::error!("failed to spawn connect worker: {err}");
        }
    }

    fn new_poll_group(&self) -> ReliablePollGroup {
        ReliablePollGroup::new()
    }

    fn new_descriptor_set(&self, _event: PollEventType) -> Box<dyn DescriptorSet> {
        Box::new(DummyDescriptorSet::new())
    }

    fn process_connection_state_changes(&self) {
        let endpoints: Vec<Arc<Endpoint>> = {
            let mut list = self.endpoints.lock().expect("endpoint list lock poisoned");
            list.retain(|w| w.upgrade().is_some());
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for endpoint in endpoints {
            endpoint.pump(EVENT_BATCH);
        }
    }

    fn dispose_connection(&self, conn: ReliableConnection) {
        let core = conn.core().clone();
        core.invalidate();
        self.manager.discard(core.clone());
        if let Some(endpoint) = core.endpoint().upgrade() {
            // Let in-flight messages settle, then drop the route so poll
            // groups and the router stop seeing the connection.
            endpoint.pump(EVENT_BATCH);
            endpoint.remove_route(core.remote());
        }
        tracing::debug!("disposed messaging connection to [{}]", core.remote());
    }
}

impl Drop for ReliableProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ListenSocket, PollGroup};

    fn pump_until<T>(
        provider: &ReliableProvider,
        deadline: Duration,
        mut step: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            provider.process_connection_state_changes();
            if let Some(v) = step() {
                return Some(v);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        None
    }

    /// A connected (client, server-side) pair over loopback.
    fn connected_pair(
        provider: &ReliableProvider,
    ) -> (ReliableConnection, ReliableConnection, ReliableListenSocket) {
        let listener = provider.open_listen_socket(0).unwrap();
        let port = listener.local_port();

        // Accept on a helper thread is unnecessary: connecting and accepting
        // both run on this thread, interleaved by pumping.
        let client_thread = {
            let manager = Arc::downgrade(&provider.manager);
            let endpoints = Arc::clone(&provider.endpoints);
            std::thread::spawn(move || {
                connect_any(
                    &[SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)],
                    Duration::from_secs(10),
                    manager,
                    &endpoints,
                )
            })
        };

        let server_side = pump_until(provider, Duration::from_secs(10), || {
            listener.accept().unwrap()
        })
        .expect("no connection accepted");
        let client = client_thread.join().unwrap().expect("client connect failed");
        (client, server_side, listener)
    }

    #[test]
    fn test_connect_and_accept_over_loopback() {
        let provider = ReliableProvider::new();
        let (client, server_side, _listener) = connected_pair(&provider);
        assert!(client.is_valid());
        assert!(server_side.is_valid());
        assert!(client.connection_status().is_ok());
    }

    #[test]
    fn test_connect_without_listener_times_out() {
        let provider = ReliableProvider::new();
        let err = provider
            .open_client_connection("127.0.0.1", 9, Duration::from_millis(300))
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err}");
    }

    #[test]
    fn test_write_reaches_peer_in_order() {
        let provider = ReliableProvider::new();
        let (mut client, mut server_side, _listener) = connected_pair(&provider);

        let data: Vec<u8> = (0..30_000u32).map(|i| (i % 247) as u8).collect();
        for chunk in data.chunks(5000) {
            assert_eq!(client.write(chunk).unwrap(), chunk.len());
        }

        let mut out = vec![0u8; data.len()];
        let mut filled = 0;
        let ok = pump_until(&provider, Duration::from_secs(15), || {
            let outcome = server_side.read_available(&mut out[filled..]).unwrap();
            filled += outcome.bytes;
            (filled == data.len()).then_some(())
        });
        assert!(ok.is_some(), "only {filled} of {} bytes arrived", data.len());
        assert_eq!(out, data, "messages must arrive reliable and ordered");
    }

    #[test]
    fn test_compressed_roundtrip() {
        let provider = ReliableProvider::new();
        let (mut client, mut server_side, _listener) = connected_pair(&provider);

        client.enable_compression();
        server_side.enable_compression();

        let data = b"the same phrase over and over ".repeat(500);
        client.write(&data).unwrap();
        assert!(client.flush().unwrap() > 0);

        let mut out = Vec::new();
        let mut dst = [0u8; 1024];
        let ok = pump_until(&provider, Duration::from_secs(15), || {
            let outcome = server_side.read_available(&mut dst).unwrap();
            out.extend_from_slice(&dst[..outcome.bytes]);
            (out.len() == data.len()).then_some(())
        });
        assert!(ok.is_some(), "only {} of {} bytes arrived", out.len(), data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn test_poll_group_reports_connections_with_messages() {
        let provider = ReliableProvider::new();
        let (mut client, server_a, _listener) = connected_pair(&provider);

        let mut group = provider.new_poll_group();
        group.add(&server_a);

        assert_eq!(
            group
                .check_connections_readable(Duration::from_millis(50))
                .unwrap(),
            0
        );

        client.write(b"knock knock").unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let ready = group
                .check_connections_readable(Duration::from_millis(100))
                .unwrap();
            if ready > 0 {
                assert_eq!(ready, 1);
                assert!(server_a.read_ready());
                break;
            }
            assert!(Instant::now() < deadline, "message never became readable");
        }
    }

    #[test]
    fn test_second_listen_socket_is_rejected_while_active() {
        let provider = ReliableProvider::new();
        let first = provider.open_listen_socket(0).unwrap();
        let err = provider.open_listen_socket(0).unwrap_err();
        assert_eq!(err, NetError::socket(codes::EADDRINUSE));

        // Dropping the first frees the slot.
        drop(first);
        let _second = provider.open_listen_socket(0).unwrap();
    }

    #[test]
    fn test_dispose_removes_route_and_invalidates() {
        let provider = ReliableProvider::new();
        let (client, server_side, _listener) = connected_pair(&provider);

        let mut group = provider.new_poll_group();
        group.add(&server_side);

        provider.dispose_connection(server_side);
        let _ = group
            .check_connections_readable(Duration::from_millis(20))
            .unwrap();
        drop(client);
    }
}
