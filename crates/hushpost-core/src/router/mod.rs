//! Router session layer: connection lifecycle, events, and connectivity.

mod connection;

pub use connection::RouterConnection;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ConnectivityError;
use crate::identity::ChatId;
use crate::protocol::DecodedPost;

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// Logged in to the router.
    Connected,
    /// Session ended; the spooler holds anything undelivered.
    Disconnected { reason: String },
    /// A post was received, stored, decrypted and verified.
    PostArrived { chat_id: ChatId, post: DecodedPost },
    /// The router confirmed receipt of an outbound frame.
    DeliveryConfirmed { data_id: [u8; 4] },
    /// Diagnostic only. Delivery is retried transparently.
    ConnectionError { error: ConnectivityError },
}

/// Connection tuning. The defaults fit an always-on client; mobile
/// embedders set `idle_timeout` and leave `keep_alive_interval` off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Router endpoint as `host:port`.
    pub router_addr: String,
    /// Routing domain announced at login.
    pub domain: [u8; 4],
    /// Per-address timeout while connecting.
    pub connect_attempt_timeout: Duration,
    /// Disconnect after this long without meaningful inbound traffic.
    /// Keep-alive probes do not count as traffic.
    pub idle_timeout: Option<Duration>,
    /// Interval between outbound zero-length keep-alive frames.
    pub keep_alive_interval: Option<Duration>,
    /// Delay before a reconnect attempt after a lost session.
    pub reconnect_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            router_addr: "127.0.0.1:7340".to_string(),
            domain: *b"hush",
            connect_attempt_timeout: Duration::from_secs(1),
            idle_timeout: None,
            keep_alive_interval: Some(Duration::from_secs(30)),
            reconnect_interval: Duration::from_secs(15),
        }
    }
}

/// Network availability as an injected, observable value.
///
/// Connections hold a clone and consult it before dialing; embedders
/// flip it from their platform's reachability hooks. Tests get isolated
/// instances instead of process-wide state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(available: bool) -> Self {
        let (tx, _) = watch::channel(available);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_available(&self, available: bool) {
        let _ = self.tx.send(available);
    }

    pub fn is_available(&self) -> bool {
        *self.tx.borrow()
    }

    /// Watch for availability changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_is_observable() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();
        assert!(monitor.is_available());

        monitor.set_available(false);
        assert!(!monitor.is_available());
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_monitor_clones_share_state() {
        let a = ConnectivityMonitor::new(true);
        let b = a.clone();
        b.set_available(false);
        assert!(!a.is_available());
    }
}
