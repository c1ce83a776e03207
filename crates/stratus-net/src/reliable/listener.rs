//! The reliable-messaging listen socket.

use std::sync::{Arc, Weak};

use crate::connection::{IpVersions, ListenSocket};
use crate::error::NetResult;
use crate::writer::PendingWritesManager;

use super::connection::ReliableConnection;
use super::endpoint::Endpoint;

/// Accepting side of the reliable-messaging backend.
///
/// Peers are queued by the endpoint's event routing (serviced via the
/// provider's state-change pump); `accept` only pops from that queue.
pub struct ReliableListenSocket {
    endpoint: Arc<Endpoint>,
    manager: Weak<PendingWritesManager>,
}

impl ReliableListenSocket {
    pub(crate) fn new(endpoint: Arc<Endpoint>, manager: Weak<PendingWritesManager>) -> Self {
        Self { endpoint, manager }
    }

    /// Local port the endpoint is bound on.
    pub fn local_port(&self) -> u16 {
        self.endpoint.local_addr().port()
    }
}

impl ListenSocket for ReliableListenSocket {
    type Connection = ReliableConnection;

    fn accept(&self) -> NetResult<Option<ReliableConnection>> {
        let Some((peer, buffered)) = self.endpoint.pop_pending_accept() else {
            return Ok(None);
        };

        let core = super::connection::ReliableCore::new(peer, Arc::downgrade(&self.endpoint));
        core.mark_established();
        for chunk in buffered {
            core.push_inbound(chunk);
        }
        self.endpoint.register(peer, Arc::downgrade(&core));

        // Answer the peer's connection marker so it sees the link as up.
        if let Err(err) = self.endpoint.send_to(peer, Vec::new()) {
            tracing::warn!("failed to acknowledge connection from [{peer}]: {err}");
        }

        tracing::debug!("accepted messaging connection from [{peer}]");
        Ok(Some(ReliableConnection::new(core, self.manager.clone())))
    }

    fn supported_ip_versions(&self) -> IpVersions {
        if self.endpoint.local_addr().is_ipv6() {
            IpVersions::V6
        } else {
            IpVersions::V4
        }
    }
}
