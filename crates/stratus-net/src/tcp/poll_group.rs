//! Grouped read-readiness checks for TCP connections.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::connection::PollGroup;
use crate::error::NetResult;
use crate::poll::DescriptorSet;
use crate::readiness::check_connections_readable;

use super::connection::{TcpConnection, TcpCore};

/// A set of TCP connections checked together for readable data.
///
/// Membership is held weakly: a connection that has been closed or disposed
/// simply stops participating, so the group never polls stale descriptors.
pub struct TcpPollGroup {
    members: Vec<Weak<TcpCore>>,
    set: Box<dyn DescriptorSet>,
}

impl TcpPollGroup {
    pub(crate) fn new(set: Box<dyn DescriptorSet>) -> Self {
        Self {
            members: Vec::new(),
            set,
        }
    }

    /// Number of live members.
    pub fn len(&self) -> usize {
        self.members
            .iter()
            .filter(|w| w.upgrade().is_some_and(|c| c.is_valid()))
            .count()
    }

    /// True when no live members remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PollGroup for TcpPollGroup {
    type Connection = TcpConnection;

    fn add(&mut self, conn: &TcpConnection) {
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

    fn remove(&mut self, conn: &TcpConnection) {
        let target = Arc::as_ptr(conn.core());
        self.members.retain(|w| w.as_ptr() != target);
    }

    fn check_connections_readable(&mut self, timeout: Duration) -> NetResult<usize> {
        // Closed and disposed members fall out here, before the set is
        // rebuilt.
        self.members
            .retain(|w| w.upgrade().is_some_and(|c| c.is_valid()));
        let cores: Vec<Arc<TcpCore>> =
            self.members.iter().filter_map(|w| w.upgrade()).collect();
        check_connections_readable(&cores, self.set.as_mut(), timeout)
    }
}
