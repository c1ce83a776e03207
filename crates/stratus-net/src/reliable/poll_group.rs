//! Grouped read-readiness checks for reliable-messaging connections.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::connection::PollGroup;
use crate::error::NetResult;

use super::connection::{ReliableConnection, ReliableCore};
use super::endpoint::EVENT_BATCH;

/// A set of messaging connections checked together for inbound data.
pub struct ReliablePollGroup {
    members: Vec<Weak<ReliableCore>>,
}

impl ReliablePollGroup {
    pub(crate) fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    /// Pump each member's endpoint once, draining up to a fixed batch of
    /// queued messages into the per-connection inbound queues.
    fn pump_endpoints(&self) {
        let mut pumped: HashSet<usize> = HashSet::new();
        for member in &self.members {
            let Some(endpoint) = member.upgrade().and_then(|c| c.endpoint().upgrade()) else {
                continue;
            };
            if pumped.insert(Arc::as_ptr(&endpoint) as usize) {
                endpoint.pump(EVENT_BATCH);
            }
        }
    }

    /// Mark ready flags and count members with data waiting.
    fn collect_ready(&self) -> usize {
        let mut ready = 0;
        for member in &self.members {
            let Some(core) = member.upgrade() else {
                continue;
            };
            let has_data = core.has_inbound() || core.has_buffered_input();
            core.set_read_ready(has_data);
            ready += has_data as usize;
        }
        ready
    }
}

impl Default for ReliablePollGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl PollGroup for ReliablePollGroup {
    type Connection = ReliableConnection;

    fn add(&mut self, conn: &ReliableConnection) {
        let core = conn.core();
        debug_assert!(
            !self
                .members
                .iter()
                .any(|w| w.as_ptr() == Arc::as_ptr(core)),
            "connection added to poll group twice"
        );
        if self.members.iter().any(|w| w.as_ptr() == Arc::as_ptr(core)) {
            return;
        }
        self.members.push(Arc::downgrade(core));
    }

    fn remove(&mut self, conn: &ReliableConnection) {
        let target = Arc::as_ptr(conn.core());
        self.members.retain(|w| w.as_ptr() != target);
    }

    fn check_connections_readable(&mut self, timeout: Duration) -> NetResult<usize> {
        self.members
            .retain(|w| w.upgrade().is_some_and(|c| c.is_valid()));

        let deadline = Instant::now() + timeout;
        loop {
            self.pump_endpoints();
            let ready = self.collect_ready();
            if ready > 0 || Instant::now() >= deadline {
                return Ok(ready);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
