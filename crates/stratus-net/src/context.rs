//! Explicit lifetime owner for the transport backends.
//!
//! Instead of a process-wide provider table, the application constructs a
//! [`NetContext`] at startup, registers the backends it needs, and tears the
//! whole thing down at shutdown. Multiple isolated contexts can coexist,
//! which also keeps tests independent of each other.

use std::sync::Arc;

use crate::connection::ProviderType;
#[cfg(feature = "reliable")]
use crate::reliable::ReliableProvider;
use crate::tcp::TcpProvider;

/// Owns one singleton provider instance per registered backend.
#[derive(Default)]
pub struct NetContext {
    tcp: Option<Arc<TcpProvider>>,
    #[cfg(feature = "reliable")]
    reliable: Option<Arc<ReliableProvider>>,
}

impl NetContext {
    /// Create a context with no backends registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the given backend if it is not registered yet.
    ///
    /// Registering an already-registered backend keeps the existing provider
    /// instance.
    pub fn register(&mut self, backend: ProviderType) {
        match backend {
            ProviderType::Tcp => {
                if self.tcp.is_none() {
                    tracing::debug!("registering TCP connection provider");
                    self.tcp = Some(Arc::new(TcpProvider::new()));
                }
            }
            #[cfg(feature = "reliable")]
            ProviderType::Reliable => {
                if self.reliable.is_none() {
                    tracing::debug!("registering reliable-messaging connection provider");
                    self.reliable = Some(Arc::new(ReliableProvider::new()));
                }
            }
        }
    }

    /// Shut the given backend down and forget its provider.
    ///
    /// A following [`register`](NetContext::register) produces a fresh
    /// instance. Deregistering an unknown backend is a no-op.
    pub fn deregister(&mut self, backend: ProviderType) {
        match backend {
            ProviderType::Tcp => {
                if let Some(provider) = self.tcp.take() {
                    provider.shutdown();
                }
            }
            #[cfg(feature = "reliable")]
            ProviderType::Reliable => {
                if let Some(provider) = self.reliable.take() {
                    provider.shutdown();
                }
            }
        }
    }

    /// The registered TCP provider, if any.
    pub fn tcp(&self) -> Option<Arc<TcpProvider>> {
        self.tcp.clone()
    }

    /// The registered reliable-messaging provider, if any.
    #[cfg(feature = "reliable")]
    pub fn reliable(&self) -> Option<Arc<ReliableProvider>> {
        self.reliable.clone()
    }

    /// True when the backend currently has a provider.
    pub fn is_registered(&self, backend: ProviderType) -> bool {
        match backend {
            ProviderType::Tcp => self.tcp.is_some(),
            #[cfg(feature = "reliable")]
            ProviderType::Reliable => self.reliable.is_some(),
        }
    }

    /// Tear down every registered backend.
    pub fn shutdown(&mut self) {
        self.deregister(ProviderType::Tcp);
        #[cfg(feature = "reliable")]
        self.deregister(ProviderType::Reliable);
    }
}

impl Drop for NetContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_lazy_and_stable() {
        let mut ctx = NetContext::new();
        assert!(ctx.tcp().is_none());

        ctx.register(ProviderType::Tcp);
        let first = ctx.tcp().unwrap();
        let second = ctx.tcp().unwrap();
        assert!(
            Arc::ptr_eq(&first, &second),
            "repeated lookups must return the same provider instance"
        );

        // Re-registering keeps the instance.
        ctx.register(ProviderType::Tcp);
        assert!(Arc::ptr_eq(&first, &ctx.tcp().unwrap()));
    }

    #[test]
    fn test_deregister_then_register_gives_a_fresh_instance() {
        let mut ctx = NetContext::new();
        ctx.register(ProviderType::Tcp);
        let first = ctx.tcp().unwrap();

        ctx.deregister(ProviderType::Tcp);
        assert!(ctx.tcp().is_none());
        assert!(!ctx.is_registered(ProviderType::Tcp));

        ctx.register(ProviderType::Tcp);
        let second = ctx.tcp().unwrap();
        assert!(
            !Arc::ptr_eq(&first, &second),
            "a new registration must produce a new provider"
        );
    }

    #[test]
    fn test_deregister_unknown_backend_is_a_no_op() {
        let mut ctx = NetContext::new();
        ctx.deregister(ProviderType::Tcp);
        ctx.shutdown();
    }

    #[test]
    fn test_isolated_contexts_do_not_share_providers() {
        let mut a = NetContext::new();
        let mut b = NetContext::new();
        a.register(ProviderType::Tcp);
        b.register(ProviderType::Tcp);
        assert!(!Arc::ptr_eq(&a.tcp().unwrap(), &b.tcp().unwrap()));
    }
}
