//! Push fallback primitives
//!
//! A firewalled peer cannot be connected to directly. Instead we ask it to
//! connect back to us, either through one of its push-proxies or by routing a
//! push message towards its GUID over the overlay. When it does, it opens the
//! connection with a GIV announcing who it is.

use crate::error::Result;
use crate::types::Guid;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Overlay routing towards a servent GUID
pub trait PushRouting: Send {
    /// Overlay neighbours through which `guid` is reachable
    fn route_towards(&self, guid: &Guid) -> Vec<SocketAddr>;

    /// Route a push for `file_index` towards `guid`, asking it to call back
    /// on `port`. Returns whether a message was actually sent.
    fn send_push(&mut self, guid: &Guid, file_index: u32, port: u16) -> bool;

    /// Ask `proxy` to relay a push. The outcome is reported back through
    /// `TransferManager::on_proxy_result`.
    fn request_via_proxy(
        &mut self,
        proxy: SocketAddr,
        guid: &Guid,
        file_index: u32,
        port: u16,
    ) -> Result<()>;
}

/// How a pending push was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushRoute {
    /// Relayed through a push-proxy
    Proxy(SocketAddr),
    /// Routed over the overlay towards the GUID
    Routed,
}

impl std::fmt::Display for PushRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushRoute::Proxy(addr) => write!(f, "proxy {}", addr),
            PushRoute::Routed => write!(f, "routed"),
        }
    }
}

/// Incoming reverse connection announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Giv {
    /// GUID the remote claims
    pub guid: Guid,
    /// File index it was asked to serve
    pub file_index: u32,
    /// Address the connection came from
    pub addr: SocketAddr,
}

/// Ordered push-proxy list of one peer.
///
/// Proxies are tried front to back; a proxy that fails is dropped, so the
/// head of the list is always the next one to try.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushProxyList {
    proxies: Vec<SocketAddr>,
}

impl PushProxyList {
    pub fn new(proxies: Vec<SocketAddr>) -> Self {
        let mut list = Self::default();
        list.replace(proxies);
        list
    }

    /// Next proxy to try
    pub fn current(&self) -> Option<SocketAddr> {
        self.proxies.first().copied()
    }

    /// Replace the whole list, keeping the given order and dropping duplicates
    pub fn replace(&mut self, proxies: Vec<SocketAddr>) {
        self.proxies.clear();
        for proxy in proxies {
            if !self.proxies.contains(&proxy) {
                self.proxies.push(proxy);
            }
        }
    }

    /// Add a proxy at the end if unknown
    pub fn add(&mut self, proxy: SocketAddr) {
        if !self.proxies.contains(&proxy) {
            self.proxies.push(proxy);
        }
    }

    /// Report a proxy as failed, returning the next one to try
    pub fn report_failure(&mut self, proxy: SocketAddr) -> Option<SocketAddr> {
        if let Some(pos) = self.proxies.iter().position(|p| *p == proxy) {
            self.proxies.remove(pos);
            tracing::debug!(
                "Push-proxy {} dropped, {} left",
                proxy,
                self.proxies.len()
            );
        }
        self.current()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.proxies.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_proxy_failover_order() {
        let mut list = PushProxyList::new(vec![
            addr("1.1.1.1:1"),
            addr("2.2.2.2:2"),
            addr("1.1.1.1:1"),
            addr("3.3.3.3:3"),
        ]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.current(), Some(addr("1.1.1.1:1")));

        assert_eq!(
            list.report_failure(addr("1.1.1.1:1")),
            Some(addr("2.2.2.2:2"))
        );
        // Failure of a proxy that is not at the head keeps the head
        assert_eq!(
            list.report_failure(addr("3.3.3.3:3")),
            Some(addr("2.2.2.2:2"))
        );
        assert_eq!(list.report_failure(addr("2.2.2.2:2")), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_add_ignores_known() {
        let mut list = PushProxyList::default();
        list.add(addr("1.1.1.1:1"));
        list.add(addr("1.1.1.1:1"));
        assert_eq!(list.len(), 1);
        assert_eq!(PushRoute::Proxy(addr("1.1.1.1:1")).to_string(), "proxy 1.1.1.1:1");
    }
}
