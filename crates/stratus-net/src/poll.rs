//! Readiness polling over raw socket descriptors.
//!
//! Everything above this module talks to [`DescriptorSet`] and never touches
//! the platform polling primitives directly. A set is rebuilt every cycle
//! (clear, add the descriptors of interest, poll, query) rather than kept
//! registered across cycles, so closed connections can never leave stale
//! entries behind.
//!
//! Two interchangeable strategies exist. [`PollDescriptorSet`] wraps the
//! descriptor-count primitive (`poll(2)` / `WSAPoll`) and is the default on
//! Unix. [`SelectDescriptorSet`] wraps the bit-set primitive (`select(2)`)
//! and is the default on Windows, where `WSAPoll` fails to report
//! asynchronous connect failures in time. Interrupted system calls are
//! retried inside `poll`, so callers never see them.

use std::time::Duration;

use crate::error::NetResult;

/// Raw platform socket descriptor.
#[cfg(unix)]
pub type RawDescriptor = std::os::unix::io::RawFd;

/// Raw platform socket descriptor.
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawSocket;

/// Which readiness event a descriptor set watches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEventType {
    /// Data can be read without blocking.
    Readable,
    /// Data can be written without blocking.
    Writable,
}

/// A rebuildable set of descriptors pollable for one readiness event.
pub trait DescriptorSet: Send {
    /// Add a descriptor. Adding one that is already present is a programming
    /// error (debug-asserted) and otherwise ignored.
    fn add(&mut self, descriptor: RawDescriptor);

    /// Remove a descriptor if present.
    fn remove(&mut self, descriptor: RawDescriptor);

    /// Drop all descriptors and any previous poll results.
    fn clear(&mut self);

    /// Wait until at least one descriptor is ready or the timeout expires.
    ///
    /// Returns the number of ready descriptors, `0` on timeout (an empty set
    /// returns `0` immediately), or an error. `None` waits indefinitely.
    fn poll(&mut self, timeout: Option<Duration>) -> NetResult<usize>;

    /// True when the descriptor was reported ready by the last `poll`.
    fn is_set(&self, descriptor: RawDescriptor) -> bool;

    /// Number of descriptors currently in the set.
    fn len(&self) -> usize;

    /// True when no descriptors are in the set.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Construct the platform-preferred strategy for the given event type.
pub fn default_descriptor_set(event: PollEventType) -> Box<dyn DescriptorSet> {
    #[cfg(unix)]
    {
        Box::new(PollDescriptorSet::new(event))
    }
    #[cfg(windows)]
    {
        // WSAPoll reports a failed non-blocking connect only after its own
        // internal timeout, so the bit-set primitive is the reliable choice.
        Box::new(SelectDescriptorSet::new(event))
    }
}

/// Always-ready set for backends whose library buffers I/O internally.
///
/// There is no OS descriptor to wait on: every added descriptor is reported
/// ready on each poll.
#[derive(Debug, Default)]
pub struct DummyDescriptorSet {
    descriptors: Vec<RawDescriptor>,
}

impl DummyDescriptorSet {
    /// Create an empty always-ready set.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DescriptorSet for DummyDescriptorSet {
    fn add(&mut self, descriptor: RawDescriptor) {
        debug_assert!(
            !self.descriptors.contains(&descriptor),
            "descriptor added twice"
        );
        if !self.descriptors.contains(&descriptor) {
            self.descriptors.push(descriptor);
        }
    }

    fn remove(&mut self, descriptor: RawDescriptor) {
        self.descriptors.retain(|d| *d != descriptor);
    }

    fn clear(&mut self) {
        self.descriptors.clear();
    }

    fn poll(&mut self, _timeout: Option<Duration>) -> NetResult<usize> {
        Ok(self.descriptors.len())
    }

    fn is_set(&self, descriptor: RawDescriptor) -> bool {
        self.descriptors.contains(&descriptor)
    }

    fn len(&self) -> usize {
        self.descriptors.len()
    }
}

#[cfg(unix)]
pub use unix::{PollDescriptorSet, SelectDescriptorSet};

#[cfg(windows)]
pub use windows::{PollDescriptorSet, SelectDescriptorSet};

#[cfg(unix)]
mod unix {
    use std::mem;
    use std::time::Duration;

    use super::{DescriptorSet, PollEventType, RawDescriptor};
    use crate::error::{NetError, NetResult, codes};

    fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
        match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        }
    }

    fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    /// `poll(2)`-backed descriptor set.
    pub struct PollDescriptorSet {
        event: PollEventType,
        fds: Vec<libc::pollfd>,
    }

    impl PollDescriptorSet {
        /// Create an empty set watching for `event`.
        pub fn new(event: PollEventType) -> Self {
            Self {
                event,
                fds: Vec::new(),
            }
        }

        fn interest(&self) -> libc::c_short {
            match self.event {
                PollEventType::Readable => libc::POLLIN,
                PollEventType::Writable => libc::POLLOUT,
            }
        }

        fn ready_mask(&self) -> libc::c_short {
            self.interest() | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL
        }
    }

    impl DescriptorSet for PollDescriptorSet {
        fn add(&mut self, descriptor: RawDescriptor) {
            debug_assert!(
                !self.fds.iter().any(|p| p.fd == descriptor),
                "descriptor added twice"
            );
            if self.fds.iter().any(|p| p.fd == descriptor) {
                return;
            }
            self.fds.push(libc::pollfd {
                fd: descriptor,
                events: self.interest(),
                revents: 0,
            });
        }

        fn remove(&mut self, descriptor: RawDescriptor) {
            self.fds.retain(|p| p.fd != descriptor);
        }

        fn clear(&mut self) {
            self.fds.clear();
        }

        fn poll(&mut self, timeout: Option<Duration>) -> NetResult<usize> {
            if self.fds.is_empty() {
                return Ok(0);
            }
            for p in &mut self.fds {
                p.revents = 0;
            }
            let ms = timeout_ms(timeout);
            loop {
                let rc = unsafe {
                    libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms)
                };
                if rc >= 0 {
                    return Ok(rc as usize);
                }
                let err = last_errno();
                if err == codes::EINTR {
                    continue;
                }
                return Err(NetError::socket(err));
            }
        }

        fn is_set(&self, descriptor: RawDescriptor) -> bool {
            let mask = self.ready_mask();
            self.fds
                .iter()
                .any(|p| p.fd == descriptor && p.revents & mask != 0)
        }

        fn len(&self) -> usize {
            self.fds.len()
        }
    }

    /// `select(2)`-backed descriptor set.
    ///
    /// Kept as the workaround strategy; descriptors must stay below
    /// `FD_SETSIZE`.
    pub struct SelectDescriptorSet {
        event: PollEventType,
        fds: Vec<RawDescriptor>,
        ready: Vec<bool>,
    }

    impl SelectDescriptorSet {
        /// Create an empty set watching for `event`.
        pub fn new(event: PollEventType) -> Self {
            Self {
                event,
                fds: Vec::new(),
                ready: Vec::new(),
            }
        }
    }

    impl DescriptorSet for SelectDescriptorSet {
        fn add(&mut self, descriptor: RawDescriptor) {
            debug_assert!(
                (descriptor as usize) < libc::FD_SETSIZE,
                "descriptor beyond FD_SETSIZE cannot be watched with select"
            );
            debug_assert!(!self.fds.contains(&descriptor), "descriptor added twice");
            if self.fds.contains(&descriptor) {
                return;
            }
            self.fds.push(descriptor);
            self.ready.push(false);
        }

        fn remove(&mut self, descriptor: RawDescriptor) {
            if let Some(idx) = self.fds.iter().position(|fd| *fd == descriptor) {
                self.fds.swap_remove(idx);
                self.ready.swap_remove(idx);
            }
        }

        fn clear(&mut self) {
            self.fds.clear();
            self.ready.clear();
        }

        fn poll(&mut self, timeout: Option<Duration>) -> NetResult<usize> {
            if self.fds.is_empty() {
                return Ok(0);
            }
            self.ready.iter_mut().for_each(|r| *r = false);

            loop {
                let mut set = unsafe { mem::zeroed::<libc::fd_set>() };
                let mut maxfd: RawDescriptor = -1;
                unsafe {
                    libc::FD_ZERO(&mut set);
                    for fd in &self.fds {
                        libc::FD_SET(*fd, &mut set);
                        maxfd = maxfd.max(*fd);
                    }
                }

                let mut tv = timeout.map(|d| libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: d.subsec_micros() as libc::suseconds_t,
                });
                let tv_ptr = tv
                    .as_mut()
                    .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);

                let (read_ptr, write_ptr) = match self.event {
                    PollEventType::Readable => (&mut set as *mut libc::fd_set, std::ptr::null_mut()),
                    PollEventType::Writable => (std::ptr::null_mut(), &mut set as *mut libc::fd_set),
                };

                let rc = unsafe {
                    libc::select(maxfd + 1, read_ptr, write_ptr, std::ptr::null_mut(), tv_ptr)
                };
                if rc < 0 {
                    let err = last_errno();
                    if err == codes::EINTR {
                        continue;
                    }
                    return Err(NetError::socket(err));
                }

                for (idx, fd) in self.fds.iter().enumerate() {
                    self.ready[idx] = unsafe { libc::FD_ISSET(*fd, &set) };
                }
                return Ok(rc as usize);
            }
        }

        fn is_set(&self, descriptor: RawDescriptor) -> bool {
            self.fds
                .iter()
                .position(|fd| *fd == descriptor)
                .is_some_and(|idx| self.ready[idx])
        }

        fn len(&self) -> usize {
            self.fds.len()
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::time::Duration;

    use windows_sys::Win32::Networking::WinSock as ws;

    use super::{DescriptorSet, PollEventType, RawDescriptor};
    use crate::error::{NetError, NetResult, codes};

    fn last_wsa_error() -> i32 {
        unsafe { ws::WSAGetLastError() }
    }

    /// `WSAPoll`-backed descriptor set.
    ///
    /// Not the Windows default: `WSAPoll` only reports a failed non-blocking
    /// connect after its internal timeout has elapsed.
    pub struct PollDescriptorSet {
        event: PollEventType,
        fds: Vec<ws::WSAPOLLFD>,
    }

    impl PollDescriptorSet {
        /// Create an empty set watching for `event`.
        pub fn new(event: PollEventType) -> Self {
            Self {
                event,
                fds: Vec::new(),
            }
        }

        fn interest(&self) -> i16 {
            match self.event {
                PollEventType::Readable => ws::POLLRDNORM as i16,
                PollEventType::Writable => ws::POLLWRNORM as i16,
            }
        }
    }

    impl DescriptorSet for PollDescriptorSet {
        fn add(&mut self, descriptor: RawDescriptor) {
            debug_assert!(
                !self.fds.iter().any(|p| p.fd as u64 == descriptor),
                "descriptor added twice"
            );
            if self.fds.iter().any(|p| p.fd as u64 == descriptor) {
                return;
            }
            self.fds.push(ws::WSAPOLLFD {
                fd: descriptor as usize,
                events: self.interest(),
                revents: 0,
            });
        }

        fn remove(&mut self, descriptor: RawDescriptor) {
            self.fds.retain(|p| p.fd as u64 != descriptor);
        }

        fn clear(&mut self) {
            self.fds.clear();
        }

        fn poll(&mut self, timeout: Option<Duration>) -> NetResult<usize> {
            if self.fds.is_empty() {
                return Ok(0);
            }
            for p in &mut self.fds {
                p.revents = 0;
            }
            let ms = match timeout {
                None => -1,
                Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            };
            loop {
                let rc = unsafe { ws::WSAPoll(self.fds.as_mut_ptr(), self.fds.len() as u32, ms) };
                if rc != ws::SOCKET_ERROR {
                    return Ok(rc as usize);
                }
                let err = last_wsa_error();
                if err == codes::EINTR {
                    continue;
                }
                return Err(NetError::socket(err));
            }
        }

        fn is_set(&self, descriptor: RawDescriptor) -> bool {
            let mask =
                self.interest() | ws::POLLERR as i16 | ws::POLLHUP as i16 | ws::POLLNVAL as i16;
            self.fds
                .iter()
                .any(|p| p.fd as u64 == descriptor && p.revents & mask != 0)
        }

        fn len(&self) -> usize {
            self.fds.len()
        }
    }

    /// Winsock `select`-backed descriptor set; the Windows default.
    ///
    /// For writable sets the exception set is also watched, which is how
    /// Winsock signals a failed asynchronous connect.
    pub struct SelectDescriptorSet {
        event: PollEventType,
        fds: Vec<RawDescriptor>,
        ready: Vec<bool>,
    }

    impl SelectDescriptorSet {
        /// Create an empty set watching for `event`.
        pub fn new(event: PollEventType) -> Self {
            Self {
                event,
                fds: Vec::new(),
                ready: Vec::new(),
            }
        }

        fn fill(&self) -> ws::FD_SET {
            let mut set: ws::FD_SET = unsafe { std::mem::zeroed() };
            for (idx, fd) in self.fds.iter().enumerate() {
                set.fd_array[idx] = *fd as usize;
            }
            set.fd_count = self.fds.len() as u32;
            set
        }
    }

    fn fd_isset(set: &ws::FD_SET, fd: usize) -> bool {
        set.fd_array[..set.fd_count as usize].contains(&fd)
    }

    impl DescriptorSet for SelectDescriptorSet {
        fn add(&mut self, descriptor: RawDescriptor) {
            debug_assert!(
                self.fds.len() < ws::FD_SETSIZE as usize,
                "select set is full"
            );
            debug_assert!(!self.fds.contains(&descriptor), "descriptor added twice");
            if self.fds.contains(&descriptor) || self.fds.len() >= ws::FD_SETSIZE as usize {
                return;
            }
            self.fds.push(descriptor);
            self.ready.push(false);
        }

        fn remove(&mut self, descriptor: RawDescriptor) {
            if let Some(idx) = self.fds.iter().position(|fd| *fd == descriptor) {
                self.fds.swap_remove(idx);
                self.ready.swap_remove(idx);
            }
        }

        fn clear(&mut self) {
            self.fds.clear();
            self.ready.clear();
        }

        fn poll(&mut self, timeout: Option<Duration>) -> NetResult<usize> {
            if self.fds.is_empty() {
                return Ok(0);
            }
            self.ready.iter_mut().for_each(|r| *r = false);

            loop {
                let mut set = self.fill();
                let mut except = self.fill();

                let mut tv = timeout.map(|d| ws::TIMEVAL {
                    tv_sec: d.as_secs().min(i32::MAX as u64) as i32,
                    tv_usec: d.subsec_micros() as i32,
                });
                let tv_ptr = tv
                    .as_mut()
                    .map_or(std::ptr::null(), |tv| tv as *const ws::TIMEVAL);

                let (read_ptr, write_ptr, except_ptr) = match self.event {
                    PollEventType::Readable => {
                        (&mut set as *mut ws::FD_SET, std::ptr::null_mut(), std::ptr::null_mut())
                    }
                    PollEventType::Writable => (
                        std::ptr::null_mut(),
                        &mut set as *mut ws::FD_SET,
                        &mut except as *mut ws::FD_SET,
                    ),
                };

                let rc = unsafe { ws::select(0, read_ptr, write_ptr, except_ptr, tv_ptr) };
                if rc == ws::SOCKET_ERROR {
                    let err = last_wsa_error();
                    if err == codes::EINTR {
                        continue;
                    }
                    return Err(NetError::socket(err));
                }

                for (idx, fd) in self.fds.iter().enumerate() {
                    let hit = fd_isset(&set, *fd as usize)
                        || (matches!(self.event, PollEventType::Writable)
                            && fd_isset(&except, *fd as usize));
                    self.ready[idx] = hit;
                }
                return Ok(rc as usize);
            }
        }

        fn is_set(&self, descriptor: RawDescriptor) -> bool {
            self.fds
                .iter()
                .position(|fd| *fd == descriptor)
                .is_some_and(|idx| self.ready[idx])
        }

        fn len(&self) -> usize {
            self.fds.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    #[cfg(unix)]
    use std::os::unix::io::AsRawFd;
    #[cfg(windows)]
    use std::os::windows::io::AsRawSocket;

    fn raw(stream: &TcpStream) -> RawDescriptor {
        #[cfg(unix)]
        {
            stream.as_raw_fd()
        }
        #[cfg(windows)]
        {
            stream.as_raw_socket()
        }
    }

    /// A connected loopback socket pair.
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn strategies(event: PollEventType) -> Vec<Box<dyn DescriptorSet>> {
        vec![
            Box::new(PollDescriptorSet::new(event)),
            Box::new(SelectDescriptorSet::new(event)),
        ]
    }

    #[test]
    fn test_empty_set_polls_to_zero_immediately() {
        for mut set in strategies(PollEventType::Readable) {
            let start = Instant::now();
            assert_eq!(set.poll(Some(Duration::from_secs(5))).unwrap(), 0);
            assert!(
                start.elapsed() < Duration::from_secs(1),
                "empty set must not wait out the timeout"
            );
        }
    }

    #[test]
    fn test_readable_after_peer_writes() {
        for mut set in strategies(PollEventType::Readable) {
            let (client, mut server) = socket_pair();
            set.add(raw(&client));

            assert_eq!(
                set.poll(Some(Duration::from_millis(50))).unwrap(),
                0,
                "nothing written yet"
            );
            assert!(!set.is_set(raw(&client)));

            server.write_all(b"ping").unwrap();
            let ready = set.poll(Some(Duration::from_secs(2))).unwrap();
            assert_eq!(ready, 1);
            assert!(set.is_set(raw(&client)));
        }
    }

    #[test]
    fn test_writable_connected_socket_reports_ready() {
        for mut set in strategies(PollEventType::Writable) {
            let (client, _server) = socket_pair();
            set.add(raw(&client));
            let ready = set.poll(Some(Duration::from_secs(2))).unwrap();
            assert_eq!(ready, 1);
            assert!(set.is_set(raw(&client)));
        }
    }

    #[test]
    fn test_remove_and_clear() {
        for mut set in strategies(PollEventType::Readable) {
            let (client, server) = socket_pair();
            set.add(raw(&client));
            set.add(raw(&server));
            assert_eq!(set.len(), 2);

            set.remove(raw(&client));
            assert_eq!(set.len(), 1);

            set.clear();
            assert!(set.is_empty());
        }
    }

    #[test]
    fn test_results_reset_between_polls() {
        for mut set in strategies(PollEventType::Readable) {
            let (client, mut server) = socket_pair();
            set.add(raw(&client));
            server.write_all(b"x").unwrap();
            assert_eq!(set.poll(Some(Duration::from_secs(2))).unwrap(), 1);

            // Drain the byte, then poll again: readiness must not linger.
            use std::io::Read;
            let mut buf = [0u8; 8];
            let _ = (&client).read(&mut buf).unwrap();
            assert_eq!(set.poll(Some(Duration::from_millis(50))).unwrap(), 0);
            assert!(!set.is_set(raw(&client)));
        }
    }

    #[test]
    fn test_dummy_set_always_ready() {
        let mut set = DummyDescriptorSet::new();
        assert_eq!(set.poll(None).unwrap(), 0);
        set.add(7);
        set.add(9);
        assert_eq!(set.poll(Some(Duration::from_secs(30))).unwrap(), 2);
        assert!(set.is_set(7));
        assert!(!set.is_set(8));
        set.remove(7);
        assert_eq!(set.poll(None).unwrap(), 1);
    }
}
