//! Shared read-readiness algorithm for descriptor-backed connections.
//!
//! A connection whose decompressor still holds an unconsumed input chunk is
//! readable by definition: the data is already resident in memory, so waiting
//! on the OS would only add latency (and could stall forever if the peer
//! sends nothing else). The check therefore short-circuits on buffered input
//! and only polls the OS when no connection has any.

use std::time::Duration;

use crate::error::NetResult;
use crate::poll::{DescriptorSet, RawDescriptor};

/// What the readiness check needs to know about a connection.
pub(crate) trait ReadinessSource {
    /// The OS descriptor to poll.
    fn descriptor(&self) -> RawDescriptor;

    /// True when compressed input is buffered and not yet decompressed.
    fn has_buffered_input(&self) -> bool;

    /// Record the outcome of the readiness check on the connection.
    fn set_read_ready(&self, ready: bool);
}

/// Mark each connection's ready flag and return how many are readable.
pub(crate) fn check_connections_readable<S>(
    conns: &[S],
    set: &mut dyn DescriptorSet,
    timeout: Duration,
) -> NetResult<usize>
where
    S: std::ops::Deref,
    S::Target: ReadinessSource,
{
    if conns.is_empty() {
        return Ok(0);
    }

    if conns.iter().any(|c| c.has_buffered_input()) {
        let mut ready = 0;
        for conn in conns {
            let buffered = conn.has_buffered_input();
            conn.set_read_ready(buffered);
            ready += buffered as usize;
        }
        return Ok(ready);
    }

    set.clear();
    for conn in conns {
        set.add(conn.descriptor());
    }
    set.poll(Some(timeout))?;

    let mut ready = 0;
    for conn in conns {
        let is_ready = set.is_set(conn.descriptor());
        conn.set_read_ready(is_ready);
        ready += is_ready as usize;
    }
    Ok(ready)
}
